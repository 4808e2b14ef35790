//! End-to-end runs of the orchestrator against real `sh` processes

use launchtest::asserts::{assert_exit_codes, expect_eq};
use launchtest::context::{ContextValue, TestContext};
use launchtest::description::{
    LaunchArguments, LaunchDescription, ReadinessTrigger, ReadySignal, TestDescription, Topology,
    ValidationError,
};
use launchtest::inject::InjectionError;
use launchtest::process::ProcessSpec;
use launchtest::reporter::NullReporter;
use launchtest::results::TestStatus;
use launchtest::runner::{RunError, RunState, Runner, RunnerConfig};
use launchtest::suite::{TestCase, TestFailure, TestSuite};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::time::{Duration, Instant};

type Generate =
    dyn Fn(&LaunchArguments, ReadySignal) -> Result<TestDescription, ValidationError> + Send + Sync;

/// Launch description backed by a closure
struct FnDescription(Box<Generate>);

impl FnDescription {
    fn new<F>(f: F) -> Self
    where
        F: Fn(&LaunchArguments, ReadySignal) -> Result<TestDescription, ValidationError>
            + Send
            + Sync
            + 'static,
    {
        Self(Box::new(f))
    }
}

impl LaunchDescription for FnDescription {
    fn generate_test_description(
        &self,
        args: &LaunchArguments,
        ready: ReadySignal,
    ) -> Result<TestDescription, ValidationError> {
        (self.0)(args, ready)
    }
}

fn sh(name: &str, script: &str) -> ProcessSpec {
    ProcessSpec::new(name, ["sh", "-c", script])
}

/// One process that prints a few lines and then idles
fn dut_description() -> FnDescription {
    FnDescription::new(|_args, _ready| {
        let mut topology = Topology::new();
        let dut = topology.add_process(sh(
            "dut",
            "echo 'Starting Up'; echo 'Loop 1'; echo 'Loop 2'; sleep 30",
        ));
        topology.ready_when(ReadinessTrigger::OutputContains {
            process: dut.clone(),
            text: "Starting Up".into(),
        });
        Ok(TestDescription {
            topology,
            context: TestContext::new().with("dut", dut).with("int_val", 10i64),
        })
    })
}

fn config() -> RunnerConfig {
    RunnerConfig {
        ready_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(3),
        ..RunnerConfig::default()
    }
}

fn run(
    description: &FnDescription,
    suite: TestSuite,
) -> Result<launchtest::results::RunResults, RunError> {
    Runner::new(description, suite, LaunchArguments::default(), config()).run(&mut NullReporter)
}

#[test]
fn test_full_lifecycle_with_output_and_exit_checks() {
    let description = dut_description();
    let suite = TestSuite::new()
        .with(TestCase::active("test_loops", &["dut"], |b| {
            let dut = b.process("dut")?;
            b.proc_output()
                .assert_wait_for("Loop 2", dut, Duration::from_secs(10))?;
            let mut checker = b.proc_output().sequential(dut)?;
            checker.assert_in_output("Starting Up")?;
            checker.assert_in_output("Loop 1")?;
            checker.assert_in_output("Loop 2")?;
            Ok(())
        }))
        .with(TestCase::active("test_context", &["int_val"], |b| {
            expect_eq(b.integer("int_val")?, 10)?;
            Ok(())
        }))
        .with(TestCase::post_shutdown("test_exit", &["dut"], |b| {
            let dut = b.process("dut")?;
            if b.proc_info().get(dut).is_none() {
                return Err(TestFailure::failed("dut has no exit record"));
            }
            // Interrupted by shutdown: SIGINT (-2), the shell's 130, or SIGKILL
            assert_exit_codes(b.proc_info(), &[-2, 130, -9])?;
            Ok(())
        }))
        .with(TestCase::post_shutdown("test_output_kept", &["dut"], |b| {
            b.proc_output().assert_in_output("Loop 1", b.process("dut")?)?;
            Ok(())
        }));

    let results = run(&description, suite).unwrap();
    for r in results.active.iter().chain(results.after_shutdown.iter()) {
        assert_eq!(r.status, TestStatus::Pass, "{}: {}", r.name, r.message);
    }
    assert!(results.was_successful());
}

#[test]
fn test_failures_do_not_stop_later_tests() {
    let description = dut_description();
    let suite = TestSuite::new()
        .with(TestCase::active("a_fails", &[], |_| {
            Err(TestFailure::failed("deliberate"))
        }))
        .with(TestCase::active("b_passes", &[], |_| Ok(())))
        .with(TestCase::post_shutdown("c_panics", &[], |_| panic!("deliberate")))
        .with(TestCase::post_shutdown("d_passes", &[], |_| Ok(())));

    let results = run(&description, suite).unwrap();
    assert_eq!(results.active.len(), 2);
    assert_eq!(results.after_shutdown.len(), 2);
    assert_eq!(results.active.get("a_fails").unwrap().status, TestStatus::Fail);
    assert_eq!(results.active.get("b_passes").unwrap().status, TestStatus::Pass);
    assert_eq!(
        results.after_shutdown.get("c_panics").unwrap().status,
        TestStatus::Error
    );
    assert_eq!(
        results.after_shutdown.get("d_passes").unwrap().status,
        TestStatus::Pass
    );
    assert!(!results.was_successful());
}

#[test]
fn test_success_iff_no_failure_in_either_phase() {
    let only_passes = TestSuite::new()
        .with(TestCase::active("a", &[], |_| Ok(())))
        .with(TestCase::post_shutdown("b", &[], |_| Ok(())));
    assert!(run(&dut_description(), only_passes).unwrap().was_successful());

    let post_failure = TestSuite::new()
        .with(TestCase::active("a", &[], |_| Ok(())))
        .with(TestCase::post_shutdown("b", &[], |_| {
            Err(TestFailure::failed("late"))
        }));
    let results = run(&dut_description(), post_failure).unwrap();
    assert!(results.active.was_successful());
    assert!(!results.was_successful());
}

#[test]
fn test_missing_context_entry_is_error_result() {
    let description = dut_description();
    let suite = TestSuite::new().with(TestCase::active("needs_ghost", &["dut", "ghost"], |_| {
        Ok(())
    }));

    let results = run(&description, suite).unwrap();
    let result = results.active.get("needs_ghost").unwrap();
    assert_eq!(result.status, TestStatus::Error);
    let expected = InjectionError::MissingContextEntry {
        test: "needs_ghost".into(),
        name: "ghost".into(),
    };
    assert_eq!(result.message, expected.to_string());
}

#[test]
fn test_custom_context_values_reach_tests() {
    #[derive(Debug, PartialEq)]
    struct Endpoint {
        port: u16,
    }

    let description = FnDescription::new(|_args, _ready| {
        let mut topology = Topology::new();
        let dut = topology.add_process(sh("dut", "sleep 30"));
        let context = TestContext::new()
            .with("dut", dut)
            .with("endpoint", ContextValue::custom(Endpoint { port: 8080 }));
        Ok(TestDescription { topology, context })
    });
    let suite = TestSuite::new().with(TestCase::active("endpoint", &["endpoint"], |b| {
        expect_eq(b.custom::<Endpoint>("endpoint")?, &Endpoint { port: 8080 })?;
        Ok(())
    }));

    let results = run(&description, suite).unwrap();
    assert!(results.was_successful(), "{:?}", results);
}

#[test]
fn test_external_ready_signal() {
    let description = FnDescription::new(|_args, ready| {
        let mut topology = Topology::new();
        let dut = topology.add_process(sh("dut", "sleep 30"));
        topology.ready_when(ReadinessTrigger::External);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            ready.fire();
        });
        Ok(TestDescription {
            topology,
            context: TestContext::new().with("dut", dut),
        })
    });
    let suite = TestSuite::new().with(TestCase::active("runs", &[], |_| Ok(())));

    let results = run(&description, suite).unwrap();
    assert!(results.was_successful());
}

#[test]
fn test_readiness_timeout_leaves_nothing_running() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let script = format!("echo $$ > {}; sleep 30", pid_file.display());

    let description = FnDescription::new(move |_args, _ready| {
        let mut topology = Topology::new();
        let dut = topology.add_process(sh("dut", &script));
        topology.ready_when(ReadinessTrigger::OutputContains {
            process: dut.clone(),
            text: "never printed".into(),
        });
        Ok(TestDescription {
            topology,
            context: TestContext::new(),
        })
    });
    let config = RunnerConfig {
        ready_timeout: Duration::from_millis(500),
        shutdown_grace: Duration::from_secs(2),
        ..RunnerConfig::default()
    };
    let mut runner = Runner::new(
        &description,
        TestSuite::new(),
        LaunchArguments::default(),
        config,
    );

    let started = Instant::now();
    let err = runner.run(&mut NullReporter).err().unwrap();
    assert!(matches!(err, RunError::ReadinessTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(runner.state(), RunState::Error);

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    // Orphaned group members may need a moment to be reaped by init
    let deadline = Instant::now() + Duration::from_secs(5);
    while kill(Pid::from_raw(-pid), None).is_ok() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(kill(Pid::from_raw(-pid), None).is_err());
}

#[test]
fn test_invalid_topology_fails_before_launch() {
    let description = FnDescription::new(|_args, _ready| {
        let mut topology = Topology::new();
        topology.add_process(sh("dup", "true"));
        topology.add_process(sh("dup", "true"));
        Ok(TestDescription {
            topology,
            context: TestContext::new(),
        })
    });

    let err = run(&description, TestSuite::new()).err().unwrap();
    assert!(matches!(
        err,
        RunError::Validation(ValidationError::DuplicateProcess(ref name)) if name == "dup"
    ));
}

#[test]
fn test_launch_failure_is_fatal() {
    let description = FnDescription::new(|_args, _ready| {
        let mut topology = Topology::new();
        topology.add_process(sh("ok", "sleep 30"));
        topology.add_process(ProcessSpec::new("ghost", ["/nonexistent/launchtest-bin"]));
        Ok(TestDescription {
            topology,
            context: TestContext::new(),
        })
    });

    let err = run(&description, TestSuite::new()).err().unwrap();
    assert!(matches!(err, RunError::Launch(_)));
}

#[test]
fn test_run_timeout_skips_remaining_tests() {
    let description = dut_description();
    let suite = TestSuite::new()
        .with(TestCase::active("first", &[], |_| Ok(())))
        .with(TestCase::post_shutdown("second", &[], |_| Ok(())));
    let config = RunnerConfig {
        run_timeout: Duration::ZERO,
        ..config()
    };

    let results = Runner::new(&description, suite, LaunchArguments::default(), config)
        .run(&mut NullReporter)
        .unwrap();
    let first = results.active.get("first").unwrap();
    assert_eq!(first.status, TestStatus::Error);
    assert!(first.message.contains("run timeout"));
    assert_eq!(
        results.after_shutdown.get("second").unwrap().status,
        TestStatus::Error
    );
}

#[test]
fn test_launch_arguments_reach_description() {
    let description = FnDescription::new(|args, _ready| {
        let greeting = args.get("greeting").unwrap_or("none").to_string();
        let mut topology = Topology::new();
        let dut = topology.add_process(sh("dut", &format!("echo {}; sleep 30", greeting)));
        Ok(TestDescription {
            topology,
            context: TestContext::new().with("dut", dut),
        })
    });
    let suite = TestSuite::new().with(TestCase::active("greets", &["dut"], |b| {
        expect_eq(b.launch_args().get("greeting"), Some("hi"))?;
        b.proc_output()
            .assert_wait_for("hi", b.process("dut")?, Duration::from_secs(10))?;
        Ok(())
    }));

    let args = LaunchArguments::parse(["greeting:=hello", "greeting:=hi"]).unwrap();
    let results = Runner::new(&description, suite, args, config())
        .run(&mut NullReporter)
        .unwrap();
    assert!(results.was_successful(), "{:?}", results);
}

#[test]
fn test_shutdown_does_not_wait_for_escaped_descendants() {
    let have_setsid = std::process::Command::new("setsid")
        .arg("true")
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !have_setsid {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("escaped.pid");
    // The new session keeps our stdout open but is out of reach of killpg
    let script = format!(
        "setsid sh -c 'echo $$ > {}; exec sleep 20' & echo up; sleep 30",
        pid_file.display()
    );

    let description = FnDescription::new(move |_args, _ready| {
        let mut topology = Topology::new();
        let dut = topology.add_process(sh("dut", &script));
        topology.ready_when(ReadinessTrigger::OutputContains {
            process: dut.clone(),
            text: "up".into(),
        });
        Ok(TestDescription {
            topology,
            context: TestContext::new().with("dut", dut),
        })
    });
    let suite = TestSuite::new().with(TestCase::post_shutdown("output_kept", &["dut"], |b| {
        b.proc_output().assert_in_output("up", b.process("dut")?)?;
        Ok(())
    }));
    let config = RunnerConfig {
        ready_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(1),
        run_timeout: Duration::from_secs(3),
        ..RunnerConfig::default()
    };

    let started = Instant::now();
    let results = Runner::new(&description, suite, LaunchArguments::default(), config)
        .run(&mut NullReporter)
        .unwrap();
    let elapsed = started.elapsed();

    if let Some(pid) = std::fs::read_to_string(&pid_file)
        .ok()
        .and_then(|text| text.trim().parse::<i32>().ok())
    {
        let _ = kill(Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL);
    }

    assert!(elapsed < Duration::from_secs(8), "run took {:?}", elapsed);
    assert!(results.was_successful(), "{:?}", results);
}
