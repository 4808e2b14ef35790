//! TOML manifests driven through the runner

use launchtest::description::{LaunchArguments, LaunchDescription, ValidationError};
use launchtest::manifest::Manifest;
use launchtest::reporter::NullReporter;
use launchtest::results::{RunResults, TestStatus};
use launchtest::runner::{RunError, Runner, RunnerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

const TALKER: &str = r#"
[[argument]]
name = "loops"
description = "Number of loop lines to print"
default = "2"

[[process]]
name = "talker"
cmd = ["sh", "-c", "echo 'Starting Up'; i=1; while [ $i -le $(arg loops) ]; do echo Loop $i; i=$((i+1)); done; echo 'Shutting Down'"]

[[process]]
name = "idler"
cmd = ["sh", "-c", "echo idling; sleep 30"]

[ready]
process = "talker"
output = "Starting Up"

[context]
expected_loops = 2

[[test]]
name = "test_talker_sequence"

[[test.check]]
kind = "wait_for"
process = "talker"
text = "Shutting Down"
timeout_secs = 10

[[test.check]]
kind = "sequential"
process = "talker"
lines = ["Starting Up", "Loop 1", "Loop 2", "Shutting Down"]

[[test]]
name = "test_context"

[[test.check]]
kind = "context_equals"
name = "expected_loops"
value = 2

[[test]]
name = "test_talker_exit"
phase = "post_shutdown"

[[test.check]]
kind = "exit_codes"
process = "talker"
allowed = [0]

[[test]]
name = "test_idler_output_kept"
phase = "post_shutdown"

[[test.check]]
kind = "in_output"
process = "idler"
text = "idling"
"#;

fn write_manifest(dir: &TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("talker.test.toml");
    std::fs::write(&path, text).unwrap();
    path
}

fn run(manifest: &Manifest, args: &[&str]) -> Result<RunResults, RunError> {
    let config = RunnerConfig {
        ready_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(3),
        ..RunnerConfig::default()
    };
    let args = LaunchArguments::parse(args.iter().copied()).unwrap();
    Runner::new(manifest, manifest.test_suite(), args, config).run(&mut NullReporter)
}

#[test]
fn test_manifest_run_passes() {
    let dir = TempDir::new().unwrap();
    let manifest = Manifest::load(&write_manifest(&dir, TALKER)).unwrap();

    let results = run(&manifest, &[]).unwrap();
    for r in results.active.iter().chain(results.after_shutdown.iter()) {
        assert_eq!(r.status, TestStatus::Pass, "{}: {}", r.name, r.message);
    }
    assert_eq!(results.total(), 4);
}

#[test]
fn test_launch_argument_changes_behavior() {
    let dir = TempDir::new().unwrap();
    let manifest = Manifest::load(&write_manifest(&dir, TALKER)).unwrap();

    // One loop only: the sequence check cannot find "Loop 2"
    let results = run(&manifest, &["loops:=1"]).unwrap();
    assert_eq!(
        results.active.get("test_talker_sequence").unwrap().status,
        TestStatus::Fail
    );
    assert_eq!(
        results.active.get("test_context").unwrap().status,
        TestStatus::Pass
    );
    assert!(!results.was_successful());
}

#[test]
fn test_failing_exit_code_check() {
    let dir = TempDir::new().unwrap();
    let text = TALKER.replace("echo 'Shutting Down'\"]", "echo 'Shutting Down'; exit 3\"]");
    let manifest = Manifest::load(&write_manifest(&dir, &text)).unwrap();

    let results = run(&manifest, &[]).unwrap();
    let exit = results.after_shutdown.get("test_talker_exit").unwrap();
    assert_eq!(exit.status, TestStatus::Fail);
    assert!(exit.message.contains("talker"));
    assert!(exit.message.contains('3'));
}

#[test]
fn test_invalid_manifest_fails_validation() {
    let dir = TempDir::new().unwrap();
    let text = TALKER.replace("name = \"expected_loops\"", "name = \"unknown_entry\"");
    let manifest = Manifest::load(&write_manifest(&dir, &text)).unwrap();

    assert!(manifest.validate().is_err());
    let err = run(&manifest, &[]).err().unwrap();
    assert!(matches!(
        err,
        RunError::Validation(ValidationError::Description(_))
    ));
}

#[test]
fn test_load_reports_path_on_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = write_manifest(&dir, "[[process]\n");
    let err = Manifest::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("talker.test.toml"));
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    assert!(Manifest::load(&dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_exit_code_of_running_process_fails() {
    let dir = TempDir::new().unwrap();
    let text = format!(
        "{}{}",
        TALKER,
        r#"
[[test]]
name = "test_idler_exit_too_early"

[[test.check]]
kind = "exit_codes"
process = "idler"

[[test]]
name = "test_any_process_output"

[[test.check]]
kind = "in_output"
text = "idling"
"#
    );
    let manifest = Manifest::load(&write_manifest(&dir, &text)).unwrap();

    let results = run(&manifest, &[]).unwrap();
    let early = results.active.get("test_idler_exit_too_early").unwrap();
    assert_eq!(early.status, TestStatus::Fail);
    assert!(early.message.contains("has not exited"));
    assert_eq!(
        results.active.get("test_any_process_output").unwrap().status,
        TestStatus::Pass
    );
}
