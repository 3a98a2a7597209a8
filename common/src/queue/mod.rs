// Queue module: priority-ordered job storage and the publisher seam

pub mod job_queue;
pub mod publisher;

pub use job_queue::JobQueue;
pub use publisher::JobPublisher;
