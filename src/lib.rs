pub mod bridge;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod server;
