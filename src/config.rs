//! Configuration Loader
//! - CLI argument parsing with clap
//! - Optional `launchtest.toml` with runner settings and extra environment

use crate::runner::RunnerConfig;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const PROJECT_CONFIG_FILE: &str = "launchtest.toml";

// =============================================================================
// CLI Configuration
// =============================================================================

/// Output format for progress reporting
#[derive(ValueEnum, Clone, Debug, Default, PartialEq)]
pub enum OutputFormat {
    /// Human-readable CLI output (to stderr)
    #[default]
    Human,
    /// Machine-readable NDJSON (to stdout)
    Json,
    /// Human progress on stderr and NDJSON on stdout
    Both,
}

/// launchtest - integration tests against a launched process topology
#[derive(Parser, Debug)]
#[command(
    name = "launchtest",
    version,
    about = "Launch processes, test them while they run and after they stop"
)]
pub struct Cli {
    /// Test file describing the processes and tests
    pub test_file: PathBuf,

    /// Launch arguments, in the form '<name>:=<value>'
    #[arg(value_name = "LAUNCH_ARGUMENTS")]
    pub launch_arguments: Vec<String>,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Show the arguments the test file accepts and exit
    #[arg(short = 's', long)]
    pub show_args: bool,

    /// Output format (also: LAUNCHTEST_FORMAT env var)
    #[arg(long, value_enum, default_value_t = OutputFormat::Human, env = "LAUNCHTEST_FORMAT")]
    pub format: OutputFormat,

    /// Path to generate JUnit XML report (also: LAUNCHTEST_JUNIT_XML env var)
    #[arg(long, env = "LAUNCHTEST_JUNIT_XML")]
    pub junit_xml: Option<PathBuf>,

    /// Seconds to wait for the processes to become ready
    #[arg(long, value_name = "SECS")]
    pub ready_timeout: Option<f64>,

    /// Reserve a unique domain id and export it under this variable
    #[arg(long, value_name = "VAR")]
    pub domain_env: Option<String>,

    /// Project settings file
    #[arg(long, default_value = PROJECT_CONFIG_FILE)]
    pub config: PathBuf,
}

// =============================================================================
// Project Configuration
// =============================================================================

#[derive(Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub runner: RunnerSection,
    /// Added to the environment of every launched process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunnerSection {
    pub ready_timeout_secs: Option<f64>,
    pub run_timeout_secs: Option<f64>,
    pub shutdown_grace_secs: Option<f64>,
    pub domain_env_var: Option<String>,
}

fn secs(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {}: {}", what, value))
}

impl ProjectConfig {
    /// Load the settings file; a missing file means defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        debug!(path = %path.display(), ?config, "loaded project config");
        Ok(config)
    }

    /// Runner settings: defaults, then this file, then CLI flags
    pub fn runner_config(&self, cli: &Cli) -> Result<RunnerConfig> {
        let mut config = RunnerConfig::default();
        if let Some(v) = self.runner.ready_timeout_secs {
            config.ready_timeout = secs(v, "ready_timeout_secs")?;
        }
        if let Some(v) = self.runner.run_timeout_secs {
            config.run_timeout = secs(v, "run_timeout_secs")?;
        }
        if let Some(v) = self.runner.shutdown_grace_secs {
            config.shutdown_grace = secs(v, "shutdown_grace_secs")?;
        }
        if let Some(v) = cli.ready_timeout {
            config.ready_timeout = secs(v, "--ready-timeout")?;
        }
        config.extra_env = self.env.clone();
        Ok(config)
    }

    /// Variable that receives the reserved domain id, if any
    pub fn domain_env<'a>(&'a self, cli: &'a Cli) -> Option<&'a str> {
        cli.domain_env
            .as_deref()
            .or(self.runner.domain_env_var.as_deref())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("launchtest").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_full_config() {
        let toml_content = r#"
[runner]
ready_timeout_secs = 30
run_timeout_secs = 60.5
shutdown_grace_secs = 1
domain_env_var = "ROS_DOMAIN_ID"

[env]
FOO = "bar"
"#;
        let config: ProjectConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.runner.ready_timeout_secs, Some(30.0));
        assert_eq!(config.runner.domain_env_var.as_deref(), Some("ROS_DOMAIN_ID"));
        assert_eq!(config.env.get("FOO"), Some(&"bar".to_string()));
    }

    #[test]
    fn test_parse_empty_config() {
        let config: ProjectConfig = toml::from_str("").unwrap();
        assert_eq!(config, ProjectConfig::default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<ProjectConfig>("[runner]\nworkers = 4\n").is_err());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = ProjectConfig::load(&temp_dir.path().join(PROJECT_CONFIG_FILE)).unwrap();
        assert_eq!(config, ProjectConfig::default());
    }

    #[test]
    fn test_load_invalid_file_names_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(PROJECT_CONFIG_FILE);
        std::fs::write(&path, "[runner\n").unwrap();
        let err = ProjectConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(PROJECT_CONFIG_FILE));
    }

    #[test]
    fn test_cli_overrides_file() {
        let config = ProjectConfig {
            runner: RunnerSection {
                ready_timeout_secs: Some(30.0),
                shutdown_grace_secs: Some(1.0),
                domain_env_var: Some("FROM_FILE".into()),
                ..RunnerSection::default()
            },
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
        };

        let plain = cli(&["test.toml"]);
        let merged = config.runner_config(&plain).unwrap();
        assert_eq!(merged.ready_timeout, Duration::from_secs(30));
        assert_eq!(merged.shutdown_grace, Duration::from_secs(1));
        assert_eq!(merged.extra_env.get("A").map(String::as_str), Some("1"));
        assert_eq!(config.domain_env(&plain), Some("FROM_FILE"));

        let flags = cli(&["test.toml", "--ready-timeout", "2.5", "--domain-env", "ROS_DOMAIN_ID"]);
        let merged = config.runner_config(&flags).unwrap();
        assert_eq!(merged.ready_timeout, Duration::from_millis(2500));
        assert_eq!(config.domain_env(&flags), Some("ROS_DOMAIN_ID"));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let flags = cli(&["test.toml", "--ready-timeout=-1"]);
        assert!(ProjectConfig::default().runner_config(&flags).is_err());
    }
}
