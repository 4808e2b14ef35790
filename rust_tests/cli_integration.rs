//! CLI Integration Tests
//!
//! Tests for:
//! - CLI flag recognition (--format, --junit-xml, --show-args, launch arguments)
//! - Exit codes of the built binary
//! - JSON output format and JUnit report

use clap::Parser;
use launchtest::config::{Cli, OutputFormat};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const PASSING: &str = r#"
[[argument]]
name = "word"
description = "Echoed by the DUT"
default = "hello"

[[process]]
name = "dut"
cmd = ["sh", "-c", "echo $(arg word); sleep 30"]

[ready]
process = "dut"
output = "$(arg word)"

[[test]]
name = "test_word"

[[test.check]]
kind = "in_output"
process = "dut"
text = "hello"
"#;

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_launchtest"));
    cmd.env_remove("LAUNCHTEST_FORMAT")
        .env_remove("LAUNCHTEST_JUNIT_XML")
        .env_remove("RUST_LOG");
    cmd
}

fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

fn run_in(dir: &TempDir, args: &[&str]) -> Output {
    bin().current_dir(dir.path()).args(args).output().unwrap()
}

/// Test output format enum variants
#[test]
fn test_output_format_variants() {
    assert_ne!(OutputFormat::Human, OutputFormat::Json);
    assert_eq!(OutputFormat::default(), OutputFormat::Human);
    let cli = Cli::try_parse_from(["launchtest", "t.toml", "--format", "both"]).unwrap();
    assert_eq!(cli.format, OutputFormat::Both);
}

#[test]
fn test_cli_parses_flags_and_launch_arguments() {
    let cli = Cli::try_parse_from([
        "launchtest",
        "talker.test.toml",
        "rate:=10",
        "name:=dut",
        "-v",
        "--format",
        "json",
        "--junit-xml",
        "out.xml",
        "--domain-env",
        "ROS_DOMAIN_ID",
    ])
    .unwrap();

    assert_eq!(cli.test_file, PathBuf::from("talker.test.toml"));
    assert_eq!(cli.launch_arguments, vec!["rate:=10", "name:=dut"]);
    assert!(cli.verbose);
    assert!(!cli.show_args);
    assert_eq!(cli.format, OutputFormat::Json);
    assert_eq!(cli.junit_xml, Some(PathBuf::from("out.xml")));
    assert_eq!(cli.domain_env.as_deref(), Some("ROS_DOMAIN_ID"));
}

#[test]
fn test_cli_requires_test_file() {
    assert!(Cli::try_parse_from(["launchtest"]).is_err());
}

#[test]
fn test_missing_test_file_exits_2() {
    let dir = TempDir::new().unwrap();
    let out = run_in(&dir, &["does_not_exist.toml"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("does not exist"));
}

#[test]
fn test_show_args_lists_declared_arguments() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "dut.test.toml", PASSING);
    let out = run_in(&dir, &["dut.test.toml", "--show-args"]);

    assert_eq!(out.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("'word'"));
    assert!(stdout.contains("Echoed by the DUT"));
    assert!(stdout.contains("(default: 'hello')"));
}

#[test]
fn test_passing_run_writes_junit() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "dut.test.toml", PASSING);
    let out = run_in(&dir, &["dut.test.toml", "--junit-xml", "report.xml"]);

    assert_eq!(
        out.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let xml = std::fs::read_to_string(dir.path().join("report.xml")).unwrap();
    assert!(xml.contains("name=\"active_tests\""));
    assert!(xml.contains("name=\"after_shutdown_tests\""));
    assert!(xml.contains("test_word"));
}

#[test]
fn test_failing_run_exits_1() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "dut.test.toml", PASSING);
    let out = run_in(&dir, &["dut.test.toml", "word:=goodbye"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn test_malformed_launch_argument_exits_2() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "dut.test.toml", PASSING);
    let out = run_in(&dir, &["dut.test.toml", "word=oops"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_json_format_emits_only_ndjson_on_stdout() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "dut.test.toml", PASSING);
    let out = run_in(&dir, &["dut.test.toml", "--format", "json"]);
    assert_eq!(out.status.code(), Some(0));

    let stdout = String::from_utf8_lossy(&out.stdout);
    let events: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.first().unwrap()["event"], "run_start");
    assert_eq!(events.last().unwrap()["event"], "run_finished");
    assert!(events
        .iter()
        .any(|e| e["event"] == "test_finished" && e["id"] == "test_word" && e["status"] == "pass"));
}

#[test]
fn test_both_format_reports_to_stderr_and_stdout() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "dut.test.toml", PASSING);
    let out = run_in(&dir, &["dut.test.toml", "--format", "both"]);
    assert_eq!(out.status.code(), Some(0));

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout
        .lines()
        .all(|line| serde_json::from_str::<serde_json::Value>(line).is_ok()));
    assert!(stdout.contains("\"event\":\"run_finished\""));
    assert!(stdout.contains("test_word"));

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("[launchtest]"));
    assert!(stderr.contains("test_word"));
}

#[test]
fn test_project_config_env_and_domain_export() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "env.test.toml",
        r#"
[[process]]
name = "dut"
cmd = ["sh", "-c", "echo flavor=$FLAVOR domain=$TEST_DOMAIN_ID; sleep 30"]

[ready]
process = "dut"
output = "flavor="

[[test]]
name = "test_env"

[[test.check]]
kind = "in_output"
process = "dut"
text = "flavor=vanilla domain="
"#,
    );
    write(
        dir.path(),
        "launchtest.toml",
        "[runner]\ndomain_env_var = \"TEST_DOMAIN_ID\"\n\n[env]\nFLAVOR = \"vanilla\"\n",
    );

    let out = run_in(&dir, &["env.test.toml", "--format", "json"]);
    assert_eq!(
        out.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}
