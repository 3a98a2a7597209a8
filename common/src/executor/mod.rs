// Executor module: handler dispatch and the single-concurrency wake loop

pub mod registry;
pub mod runner;

pub use registry::{HandlerRegistry, JobHandler};
pub use runner::{CycleOutcome, Executor, ExecutorConfig};
