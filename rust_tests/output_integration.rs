//! Output capture against real child processes
//!
//! Processes are `sh -c` scripts so the tests only need a POSIX shell.

use launchtest::asserts::AssertionError;
use launchtest::description::{ready_channel, ReadinessTrigger, Topology};
use launchtest::output::{CmdArgs, ProcOutput, ProcQuery, Stream};
use launchtest::process::{ProcessGroup, ProcessSpec};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

fn sh(name: &str, script: &str) -> ProcessSpec {
    ProcessSpec::new(name, ["sh", "-c", script])
}

fn launch(topology: &Topology, proc_output: &ProcOutput) -> ProcessGroup {
    let (ready, _waiter) = ready_channel();
    ProcessGroup::launch(
        topology,
        proc_output,
        &ready,
        &BTreeMap::new(),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[test]
fn test_sequential_ordering_on_live_output() {
    let mut topology = Topology::new();
    let dut = topology.add_process(sh(
        "dut",
        "echo 'Starting Up'; echo 'Loop 1'; echo 'Shutting Down'; sleep 30",
    ));
    let proc_output = ProcOutput::new();
    let mut group = launch(&topology, &proc_output);

    proc_output
        .assert_wait_for("Shutting Down", &dut, Duration::from_secs(10))
        .unwrap();

    let mut in_order = proc_output.sequential(&dut).unwrap();
    in_order.assert_in_output("Starting Up").unwrap();
    in_order.assert_in_output("Shutting Down").unwrap();

    let mut reversed = proc_output.sequential(&dut).unwrap();
    reversed.assert_in_output("Shutting Down").unwrap();
    let err = reversed.assert_in_output("Starting Up").unwrap_err();
    assert!(matches!(err, AssertionError::NotFoundInSequence { .. }));

    group.shutdown(Duration::from_secs(5));
}

#[test]
fn test_stderr_lines_are_captured_with_stream() {
    let mut topology = Topology::new();
    let dut = topology.add_process(sh("dut", "echo warn >&2; echo info; sleep 30"));
    let proc_output = ProcOutput::new();
    let mut group = launch(&topology, &proc_output);

    proc_output
        .assert_wait_for("warn", &dut, Duration::from_secs(10))
        .unwrap();
    proc_output
        .assert_wait_for("info", &dut, Duration::from_secs(10))
        .unwrap();
    group.shutdown(Duration::from_secs(5));

    let lines = proc_output.capture(&dut).unwrap().lines();
    let warn = lines.iter().find(|l| l.text == "warn").unwrap();
    let info = lines.iter().find(|l| l.text == "info").unwrap();
    assert_eq!(warn.stream, Stream::Stderr);
    assert_eq!(info.stream, Stream::Stdout);
}

#[test]
fn test_captures_are_frozen_after_shutdown() {
    let mut topology = Topology::new();
    let dut = topology.add_process(sh("dut", "echo once; sleep 30"));
    let proc_output = ProcOutput::new();
    let mut group = launch(&topology, &proc_output);

    proc_output
        .assert_wait_for("once", &dut, Duration::from_secs(10))
        .unwrap();
    group.shutdown(Duration::from_secs(5));
    proc_output.freeze_all();

    let capture = proc_output.capture(&dut).unwrap();
    assert!(capture.is_frozen());
    assert!(capture.append(Stream::Stdout, "late").is_err());

    // Waiting on a frozen capture does not sit out the timeout
    let started = Instant::now();
    let err = proc_output
        .assert_wait_for("never", &dut, Duration::from_secs(30))
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, AssertionError::WaitTimeout { .. }));
}

#[test]
fn test_lookup_by_name_and_arguments() {
    let mut topology = Topology::new();
    topology.add_process(ProcessSpec::new(
        "talker",
        ["sh", "-c", "echo fast; sleep 30", "--fast"],
    ));
    topology.add_process(sh("listener", "echo heard; sleep 30"));
    let proc_output = ProcOutput::new();
    let mut group = launch(&topology, &proc_output);

    proc_output
        .assert_wait_for("heard", "listener", Duration::from_secs(10))
        .unwrap();
    proc_output
        .assert_wait_for(
            "fast",
            ProcQuery::name("talker").with_args(CmdArgs::Contains("--fast")),
            Duration::from_secs(10),
        )
        .unwrap();

    let err = proc_output
        .assert_in_output("anything", "missing")
        .unwrap_err();
    match err {
        AssertionError::NoMatchingProcess { known, .. } => assert_eq!(known.len(), 2),
        other => panic!("unexpected error: {}", other),
    }

    group.shutdown(Duration::from_secs(5));
}

#[test]
fn test_ready_signal_fires_on_matching_stdout_line() {
    let mut topology = Topology::new();
    let dut = topology.add_process(sh("dut", "sleep 0.2; echo 'node ready'; sleep 30"));
    topology.ready_when(ReadinessTrigger::OutputContains {
        process: dut.clone(),
        text: "ready".into(),
    });
    let proc_output = ProcOutput::new();
    let (ready, waiter) = ready_channel();

    let mut group = ProcessGroup::launch(
        &topology,
        &proc_output,
        &ready,
        &BTreeMap::new(),
        Duration::from_secs(5),
    )
    .unwrap();

    assert!(waiter.wait(Duration::from_secs(10)).is_ok());
    // The line is in the capture before readiness is announced
    proc_output.assert_in_output("node ready", &dut).unwrap();
    group.shutdown(Duration::from_secs(5));
}
