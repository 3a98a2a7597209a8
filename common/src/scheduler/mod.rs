// Scheduler module for cron-driven job creation

pub mod engine;

pub use engine::Scheduler;
