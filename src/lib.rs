//! asttest runs scripted acceptance tests against an installed system under
//! test. Each test runs in its own directory, may build a symlinked work area
//! mirroring the installation, and may spawn and supervise real processes.
//!
//! The pieces:
//!
//! - [`sandbox`] builds and removes work areas.
//! - [`process`] locates, spawns, waits for and signals child processes.
//! - [`outcome`] normalizes test results, runs exit hooks and classifies.
//! - [`suite`] and [`runner`] drive a run and keep the log and counters.
//! - [`context`] is the contract between the runner and a test body;
//!   [`script`] is the built-in body that executes YAML/TOML scripts.

pub mod context;
pub mod env;
pub mod loader;
pub mod outcome;
pub mod process;
pub mod runner;
pub mod sandbox;
pub mod schema;
pub mod script;
pub mod suite;
