//! Runtime glue that wires configuration, error kinds, and telemetry.

pub mod config;
pub mod error;
pub mod telemetry;
