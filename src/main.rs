use anyhow::{Context, Result};
use clap::Parser;
use launchtest::config::{Cli, OutputFormat, ProjectConfig};
use launchtest::description::{describe_arguments, LaunchArguments, LaunchDescription};
use launchtest::domain::get_coordinated_domain_id;
use launchtest::junit;
use launchtest::manifest::Manifest;
use launchtest::reporter::{HumanReporter, JsonReporter, MultiReporter, Reporter};
use launchtest::runner::Runner;
use launchtest::signals::{install_signal_handlers, ShutdownFlag};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_TESTS_FAILED: u8 = 1;
const EXIT_FATAL: u8 = 2;

fn init_tracing(verbose: bool) {
    // -v wins over RUST_LOG; stdout stays reserved for the JSON reporter
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[launchtest] error: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn build_reporter(format: &OutputFormat) -> Box<dyn Reporter> {
    match format {
        OutputFormat::Human => Box::new(HumanReporter),
        OutputFormat::Json => Box::new(JsonReporter),
        OutputFormat::Both => Box::new(MultiReporter::new(vec![
            Box::new(HumanReporter),
            Box::new(JsonReporter),
        ])),
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    if !cli.test_file.is_file() {
        eprintln!(
            "[launchtest] Test file '{}' does not exist",
            cli.test_file.display()
        );
        return Ok(ExitCode::from(EXIT_FATAL));
    }

    let manifest = Manifest::load(&cli.test_file)?;

    if cli.show_args {
        print!("{}", describe_arguments(&manifest.declared_arguments()));
        return Ok(ExitCode::SUCCESS);
    }

    let args = LaunchArguments::parse(&cli.launch_arguments)?;
    let project = ProjectConfig::load(&cli.config)?;
    let mut config = project.runner_config(cli)?;

    let shutdown = ShutdownFlag::new();
    install_signal_handlers(shutdown.clone()).context("failed to install signal handlers")?;
    config.shutdown = shutdown;

    // Held until the run is over so no other run can take the same id
    let _domain = match project.domain_env(cli) {
        Some(var) => {
            let reservation = get_coordinated_domain_id(None)?;
            info!(domain = reservation.value(), var, "reserved domain id");
            config
                .extra_env
                .insert(var.to_string(), reservation.to_string());
            Some(reservation)
        }
        None => None,
    };

    let mut reporter = build_reporter(&cli.format);

    let mut runner = Runner::new(&manifest, manifest.test_suite(), args, config);
    let results = match runner.run(reporter.as_mut()) {
        Ok(results) => results,
        // Already reported through the reporter
        Err(e) => {
            error!(state = ?runner.state(), "run aborted: {}", e);
            return Ok(ExitCode::from(EXIT_FATAL));
        }
    };

    if let Some(path) = &cli.junit_xml {
        junit::write_report(path, &results)?;
    }

    if results.was_successful() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_TESTS_FAILED))
    }
}
