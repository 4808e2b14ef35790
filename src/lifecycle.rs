//! Lifecycle Management for guaranteed process cleanup
//!
//! A launched topology must never outlive the harness, whatever the exit path
//! (normal return, early `?` return, panic inside the runner). `CleanupGuard`
//! tracks every launched process group and SIGKILLs the ones still tracked
//! when it is dropped.
//!
//! ## Mutex Poison Immunity
//!
//! If a thread panics while holding the lock, the mutex becomes poisoned.
//! Cleanup ignores the poison flag: the pids are still valid and still need
//! to die.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::Mutex;
use tracing::debug;

/// Resource tracker for guaranteed cleanup
///
/// Uses the RAII pattern: Drop runs on every exit path.
pub struct CleanupGuard {
    /// Process group ids (= leader pids) still alive as far as we know
    groups: Mutex<Vec<i32>>,
}

impl CleanupGuard {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(Vec::new()),
        }
    }

    /// Track a process group for cleanup
    pub fn track_group(&self, pgid: i32) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.push(pgid);
    }

    /// Stop tracking a group (it was shut down properly)
    pub fn untrack_group(&self, pgid: i32) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.retain(|&g| g != pgid);
    }

    pub fn tracked_groups(&self) -> Vec<i32> {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.clone()
    }

    /// Force kill all tracked groups
    fn kill_groups(&self) {
        let groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        for &pgid in groups.iter() {
            if pgid > 0 {
                let _ = kill(Pid::from_raw(-pgid), Signal::SIGKILL);
            }
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let remaining = self.tracked_groups();
        if remaining.is_empty() {
            return;
        }
        debug!(groups = ?remaining, "cleanup guard killing leftover process groups");
        self.kill_groups();
    }
}

impl Default for CleanupGuard {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;
    use std::time::{Duration, Instant};

    #[test]
    fn test_cleanup_guard_creation() {
        let guard = CleanupGuard::new();
        assert!(guard.tracked_groups().is_empty());
    }

    #[test]
    fn test_track_untrack_group() {
        let guard = CleanupGuard::new();
        guard.track_group(1234);
        guard.track_group(5678);
        assert_eq!(guard.tracked_groups().len(), 2);

        guard.untrack_group(1234);
        assert_eq!(guard.tracked_groups(), vec![5678]);

        // Never signal these fake ids on drop
        guard.untrack_group(5678);
    }

    #[test]
    fn test_untrack_unknown_group() {
        let guard = CleanupGuard::default();
        guard.untrack_group(999);
        assert!(guard.tracked_groups().is_empty());
    }

    #[test]
    fn test_drop_kills_tracked_group() {
        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();

        {
            let guard = CleanupGuard::new();
            guard.track_group(child.id() as i32);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut exited = None;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait().unwrap() {
                exited = Some(status);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(exited.is_some(), "guard should have killed the child");
    }

    #[test]
    fn test_poisoned_lock_still_usable() {
        let guard = std::sync::Arc::new(CleanupGuard::new());
        let g = guard.clone();
        let _ = std::thread::spawn(move || {
            let _lock = g.groups.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        guard.track_group(42);
        assert_eq!(guard.tracked_groups(), vec![42]);
        guard.untrack_group(42);
    }
}
