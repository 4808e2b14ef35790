//! Domain Coordinator: collision-free small integer IDs across test runs
//!
//! Independent test runs (separate processes, separate CI jobs on one host)
//! often share a numeric namespace such as a pub/sub transport domain. Each
//! run claims a value by taking an exclusive, non-blocking `flock` on
//! `<lock_dir>/domain_<value>.lock`. There is no central broker: the lock is
//! the reservation, and the kernel releases it when the owner exits.

use nix::fcntl::{Flock, FlockArg};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Range handed out by the default coordinator
pub const DEFAULT_DOMAIN_RANGE: RangeInclusive<u32> = 1..=100;

/// Directory (under the system temp dir) holding the lock files
pub const DEFAULT_LOCK_DIR_NAME: &str = "launchtest-domains";

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Failed to get a unique domain ID after {attempts} attempts")]
    Exhausted { attempts: usize },
    #[error("cannot prepare domain lock directory {path}: {source}")]
    LockDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// =============================================================================
// Selectors
// =============================================================================

/// Produces candidate domain values for the coordinator.
pub trait Selector {
    fn select(&mut self) -> u32;
}

impl<F> Selector for F
where
    F: FnMut() -> u32,
{
    fn select(&mut self) -> u32 {
        self()
    }
}

/// Non-repeating random permutation over a range.
///
/// Each full cycle yields every value of the range exactly once. When a cycle
/// is used up the permutation is reshuffled, so the selector never runs dry.
pub struct PermutationSelector {
    values: Vec<u32>,
    cursor: usize,
    rng: StdRng,
}

impl PermutationSelector {
    pub fn new(range: RangeInclusive<u32>) -> Self {
        Self::with_rng(range, StdRng::from_entropy())
    }

    /// Deterministic permutation, for tests
    pub fn seeded(range: RangeInclusive<u32>, seed: u64) -> Self {
        Self::with_rng(range, StdRng::seed_from_u64(seed))
    }

    fn with_rng(range: RangeInclusive<u32>, mut rng: StdRng) -> Self {
        let mut values: Vec<u32> = range.collect();
        values.shuffle(&mut rng);
        Self {
            values,
            cursor: 0,
            rng,
        }
    }

    pub fn cycle_len(&self) -> usize {
        self.values.len()
    }
}

impl Default for PermutationSelector {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN_RANGE)
    }
}

impl Selector for PermutationSelector {
    fn select(&mut self) -> u32 {
        if self.values.is_empty() {
            return 0;
        }
        if self.cursor >= self.values.len() {
            self.values.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let value = self.values[self.cursor];
        self.cursor += 1;
        value
    }
}

// =============================================================================
// Reservation
// =============================================================================

/// A claimed domain value. The claim lasts as long as this value lives.
pub struct DomainReservation {
    value: u32,
    path: PathBuf,
    _lock: Flock<File>,
}

impl DomainReservation {
    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn lock_path(&self) -> &Path {
        &self.path
    }

    /// Give the value back before the owner exits
    pub fn release(self) {
        debug!(domain = self.value, "releasing domain reservation");
    }
}

impl fmt::Display for DomainReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl fmt::Debug for DomainReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainReservation")
            .field("value", &self.value)
            .field("path", &self.path)
            .finish()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct DomainCoordinator {
    lock_dir: PathBuf,
    range: RangeInclusive<u32>,
    max_attempts: usize,
}

impl DomainCoordinator {
    /// Coordinator over the default range, sharing the system-wide lock dir
    pub fn new() -> Self {
        Self::with_lock_dir(std::env::temp_dir().join(DEFAULT_LOCK_DIR_NAME))
    }

    pub fn with_lock_dir(lock_dir: impl Into<PathBuf>) -> Self {
        let range = DEFAULT_DOMAIN_RANGE;
        Self {
            lock_dir: lock_dir.into(),
            max_attempts: range_len(&range),
            range,
        }
    }

    /// Change the range. The attempt budget follows the new range size.
    pub fn with_range(mut self, range: RangeInclusive<u32>) -> Self {
        self.max_attempts = range_len(&range);
        self.range = range;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Fresh default selector over this coordinator's range
    pub fn default_selector(&self) -> PermutationSelector {
        PermutationSelector::new(self.range.clone())
    }

    /// Claim a domain using a fresh permutation selector
    pub fn reserve(&self) -> Result<DomainReservation, AllocationError> {
        let mut selector = self.default_selector();
        self.reserve_with(&mut selector)
    }

    /// Draw candidates until one can be locked or the attempt budget runs out
    pub fn reserve_with<S: Selector + ?Sized>(
        &self,
        selector: &mut S,
    ) -> Result<DomainReservation, AllocationError> {
        fs::create_dir_all(&self.lock_dir).map_err(|source| AllocationError::LockDir {
            path: self.lock_dir.clone(),
            source,
        })?;

        for attempt in 1..=self.max_attempts {
            let candidate = selector.select();
            if !self.range.contains(&candidate) {
                trace!(candidate, attempt, "selector produced out-of-range value");
                continue;
            }
            if let Some(reservation) = self.try_claim(candidate) {
                debug!(domain = candidate, attempt, "reserved domain");
                return Ok(reservation);
            }
            trace!(candidate, attempt, "domain already reserved");
        }

        Err(AllocationError::Exhausted {
            attempts: self.max_attempts,
        })
    }

    fn try_claim(&self, value: u32) -> Option<DomainReservation> {
        let path = self.lock_dir.join(format!("domain_{}.lock", value));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .ok()?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Some(DomainReservation {
                value,
                path,
                _lock: lock,
            }),
            Err((_, errno)) => {
                trace!(value, %errno, "flock refused");
                None
            }
        }
    }
}

impl Default for DomainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn range_len(range: &RangeInclusive<u32>) -> usize {
    if range.is_empty() {
        0
    } else {
        (*range.end() - *range.start()) as usize + 1
    }
}

/// Reserve a domain from the shared, host-wide lock directory.
///
/// `None` uses the default permutation selector over 1..=100.
pub fn get_coordinated_domain_id(
    selector: Option<&mut dyn Selector>,
) -> Result<DomainReservation, AllocationError> {
    let coordinator = DomainCoordinator::new();
    match selector {
        Some(selector) => coordinator.reserve_with(selector),
        None => coordinator.reserve(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[test]
    fn test_selector_values_between_1_and_100() {
        let mut selector = PermutationSelector::default();
        for _ in 0..200 {
            let value = selector.select();
            assert!((1..=100).contains(&value), "out of range: {}", value);
        }
    }

    #[test]
    fn test_selector_full_cycle_is_permutation() {
        let mut selector = PermutationSelector::default();
        let mut seen: Vec<u32> = (0..100).map(|_| selector.select()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=100).collect::<Vec<_>>());
    }

    #[test]
    fn test_seeded_selectors_are_deterministic() {
        let mut a = PermutationSelector::seeded(1..=100, 7);
        let mut b = PermutationSelector::seeded(1..=100, 7);
        for _ in 0..150 {
            assert_eq!(a.select(), b.select());
        }
    }

    #[test]
    fn test_empty_range_selector() {
        #[allow(clippy::reversed_empty_ranges)]
        let mut selector = PermutationSelector::new(5..=4);
        assert_eq!(selector.cycle_len(), 0);
        assert_eq!(selector.select(), 0);
    }

    #[test]
    fn test_attempt_budget_follows_range() {
        let dir = TempDir::new().unwrap();
        let coordinator = DomainCoordinator::with_lock_dir(dir.path());
        assert_eq!(coordinator.max_attempts(), 100);

        let coordinator = coordinator.with_range(10..=19);
        assert_eq!(coordinator.max_attempts(), 10);

        let coordinator = coordinator.with_max_attempts(3);
        assert_eq!(coordinator.max_attempts(), 3);
    }

    #[test]
    fn test_out_of_range_candidates_exhaust() {
        let dir = TempDir::new().unwrap();
        let coordinator = DomainCoordinator::with_lock_dir(dir.path());
        let mut selector = || 500u32;
        let err = coordinator.reserve_with(&mut selector).unwrap_err();
        assert!(matches!(err, AllocationError::Exhausted { attempts: 100 }));
    }

    #[test]
    fn test_release_frees_value() {
        let dir = TempDir::new().unwrap();
        let coordinator = DomainCoordinator::with_lock_dir(dir.path());
        let mut fixed = || 9u32;

        let first = coordinator.reserve_with(&mut fixed).unwrap();
        assert!(first.lock_path().ends_with("domain_9.lock"));
        assert!(coordinator.reserve_with(&mut fixed).is_err());

        first.release();
        let again = coordinator.reserve_with(&mut fixed).unwrap();
        assert_eq!(again.value(), 9);
    }

    #[test]
    fn test_whole_range_reserved() {
        let dir = TempDir::new().unwrap();
        let coordinator = DomainCoordinator::with_lock_dir(dir.path()).with_range(1..=5);

        let held: Vec<_> = (0..5).map(|_| coordinator.reserve().unwrap()).collect();
        let values: HashSet<u32> = held.iter().map(|r| r.value()).collect();
        assert_eq!(values.len(), 5);

        let err = coordinator.reserve().unwrap_err();
        assert!(err.to_string().contains("Failed to get a unique domain ID"));
    }

    proptest! {
        #[test]
        fn prop_every_cycle_is_a_permutation(seed in any::<u64>(), end in 1u32..64) {
            let mut selector = PermutationSelector::seeded(1..=end, seed);
            for _ in 0..2 {
                let mut cycle: Vec<u32> = (0..end).map(|_| selector.select()).collect();
                cycle.sort_unstable();
                prop_assert_eq!(cycle, (1..=end).collect::<Vec<_>>());
            }
        }
    }
}
