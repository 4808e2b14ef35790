//! Domain coordination across independent coordinators and processes
//!
//! Each test gets its own lock directory so parallel test threads never
//! contend for the same domain files.

use launchtest::domain::{AllocationError, DomainCoordinator, PermutationSelector, Selector};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::os::unix::process::CommandExt;
use std::process::Command;
use tempfile::TempDir;

#[test]
fn test_sequential_default_reservations_are_distinct() {
    let dir = TempDir::new().unwrap();
    let coordinator = DomainCoordinator::with_lock_dir(dir.path());

    let held: Vec<_> = (0..100).map(|_| coordinator.reserve().unwrap()).collect();
    let values: HashSet<u32> = held.iter().map(|r| r.value()).collect();
    assert_eq!(values.len(), 100);
    assert!(values.iter().all(|v| (1..=100).contains(v)));
}

#[test]
fn test_forced_collision_on_fixed_value() {
    let dir = TempDir::new().unwrap();
    let coordinator = DomainCoordinator::with_lock_dir(dir.path());
    let mut always_42 = || 42u32;

    let first = coordinator.reserve_with(&mut always_42).unwrap();
    assert_eq!(first.to_string(), "42");

    let err = coordinator.reserve_with(&mut always_42).unwrap_err();
    assert!(matches!(err, AllocationError::Exhausted { .. }));
    assert!(err.to_string().contains("Failed to get a unique domain ID"));
}

#[test]
fn test_sequence_selector_returns_in_order() {
    let dir = TempDir::new().unwrap();
    let coordinator = DomainCoordinator::with_lock_dir(dir.path());
    let mut next = 0u32;
    let mut sequence = move || {
        next += 1;
        next
    };

    let held: Vec<_> = (0..10)
        .map(|_| coordinator.reserve_with(&mut sequence).unwrap())
        .collect();
    let rendered: Vec<String> = held.iter().map(ToString::to_string).collect();
    let expected: Vec<String> = (1..=10).map(|n| n.to_string()).collect();
    assert_eq!(rendered, expected);
}

#[test]
fn test_fresh_sequence_selectors_skip_held_values() {
    let dir = TempDir::new().unwrap();
    let coordinator = DomainCoordinator::with_lock_dir(dir.path()).with_range(1..=10);

    // Every call starts over at 1 and has to step past what is still held
    let held: Vec<_> = (0..10)
        .map(|_| {
            let mut next = 0u32;
            let mut from_one = move || {
                next += 1;
                next
            };
            coordinator.reserve_with(&mut from_one).unwrap()
        })
        .collect();

    let values: Vec<u32> = held.iter().map(|r| r.value()).collect();
    assert_eq!(values, (1..=10).collect::<Vec<u32>>());
}

#[test]
fn test_independent_coordinators_share_lock_dir() {
    let dir = TempDir::new().unwrap();
    let a = DomainCoordinator::with_lock_dir(dir.path()).with_range(1..=3);
    let b = DomainCoordinator::with_lock_dir(dir.path()).with_range(1..=3);

    let r1 = a.reserve().unwrap();
    let r2 = b.reserve().unwrap();
    let r3 = a.reserve().unwrap();
    let values: HashSet<u32> = [r1.value(), r2.value(), r3.value()].into_iter().collect();
    assert_eq!(values.len(), 3);
    assert!(b.reserve().is_err());

    drop(r2);
    assert!(b.reserve().is_ok());
}

#[test]
fn test_lock_held_by_other_process_is_skipped() {
    let dir = TempDir::new().unwrap();
    let lock_file = dir.path().join("domain_7.lock");
    std::fs::write(&lock_file, b"").unwrap();

    // With -o only flock(1) itself holds the lock, not the sleep it runs
    let holder = Command::new("flock")
        .args(["-o", "-x"])
        .arg(&lock_file)
        .args(["sleep", "30"])
        .process_group(0)
        .spawn();
    let mut holder = match holder {
        Ok(child) => child,
        Err(_) => return, // flock(1) not installed
    };

    let coordinator = DomainCoordinator::with_lock_dir(dir.path()).with_max_attempts(50);
    let mut always_7 = || 7u32;
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut refused = false;
    while std::time::Instant::now() < deadline {
        match coordinator.reserve_with(&mut always_7) {
            Err(_) => {
                refused = true;
                break;
            }
            // The child may not have taken the lock yet
            Ok(r) => {
                drop(r);
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
        }
    }

    let _ = killpg(Pid::from_raw(holder.id() as i32), Signal::SIGKILL);
    let _ = holder.wait();
    assert!(refused, "lock held by another process should be refused");

    // The kernel drops the lock with its owner
    assert_eq!(coordinator.reserve_with(&mut always_7).unwrap().value(), 7);
}

#[test]
fn test_dyn_selector_entry_point() {
    let dir = TempDir::new().unwrap();
    let coordinator = DomainCoordinator::with_lock_dir(dir.path());
    let mut selector = PermutationSelector::seeded(1..=100, 99);
    let dyn_selector: &mut dyn Selector = &mut selector;
    let reservation = coordinator.reserve_with(dyn_selector).unwrap();
    assert!((1..=100).contains(&reservation.value()));
}
