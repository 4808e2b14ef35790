//! launchtest Library
//!
//! Launches a topology of processes, runs tests against them while they run
//! and after they have been shut down, and reports both batteries.
//! The binary entry point is in main.rs.

pub mod asserts;
pub mod config;
pub mod context;
pub mod description;
pub mod domain;
pub mod inject;
pub mod junit;
pub mod lifecycle;
pub mod manifest;
pub mod output;
pub mod process;
pub mod reporter;
pub mod results;
pub mod runner;
pub mod signals;
pub mod suite;
