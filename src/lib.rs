pub mod adaptor;
pub mod config;
pub mod diagnostics;
pub mod execution_log;
pub mod interceptor;
pub mod inventory;
pub mod runner;
pub mod suite;
pub mod telemetry;
pub mod tracker;
