// Common library: the job engine shared by the scheduler binary and tests

pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod models;
pub mod queue;
pub mod retention;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;

pub use engine::{JobEngine, JobEngineBuilder};
