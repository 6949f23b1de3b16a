pub mod commands;
pub mod config;
pub mod k8s;
pub mod lifecycle;
pub mod output;
pub mod state;
pub mod telemetry;
