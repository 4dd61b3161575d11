pub mod build;
pub mod cli;
pub mod config;
pub mod error;
pub mod protocol;
pub mod reporters;
pub mod telemetry;
pub mod worker;
