// Library root: exposes internal modules for integration tests in `tests/`.
// Production entry point remains `src/main.rs`.

pub mod api;
pub mod db;
pub mod error;
pub mod metrics;
pub mod repository;
pub mod scheduler;
pub mod telemetry;

// Only the binary reads these; kept public so tests can reach them.
pub mod cli;
pub mod config;
pub mod logging;
