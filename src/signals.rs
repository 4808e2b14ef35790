//! Signal Handling for Graceful Shutdown
//!
//! SIGINT, SIGTERM and SIGQUIT set a shutdown flag. The runner polls it while
//! waiting for readiness and between test cases, then tears the topology down
//! through the normal shutdown path so no launched process is orphaned.
//!
//! ## Architecture
//!
//! The signal thread is spawned as a daemon and dies with the main thread.

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Shared "stop as soon as possible" flag
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Install signal handlers that raise `flag`
pub fn install_signal_handlers(flag: ShutdownFlag) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;

    thread::Builder::new()
        .name("signal-listener".into())
        .spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGINT => warn!("received SIGINT, shutting down"),
                    _ => warn!(signal = sig, "received signal, shutting down"),
                }
                flag.request();
            }
        })?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_requested());

        let shared = flag.clone();
        shared.request();
        assert!(flag.is_requested());

        flag.reset();
        assert!(!shared.is_requested());
    }
}
