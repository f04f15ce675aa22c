pub mod config;
pub mod error;
pub mod hub;
pub mod listener;
pub mod monitoring;
pub mod orchestrator;
pub mod stats;
