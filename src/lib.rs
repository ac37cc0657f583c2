pub mod config;
pub mod database;
pub mod dead_letter;
pub mod discovery;
pub mod error;
pub mod heartbeat;
pub mod messaging;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod rate_limiter;
pub mod recovery;
pub mod routes;
pub mod starvation;
pub mod store;
pub mod worker_processing;
pub mod worker_scheduler;
