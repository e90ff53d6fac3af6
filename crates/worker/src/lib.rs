pub mod manager;
pub mod registry;
pub mod worker;

pub use manager::{WorkerManager, WorkerOptions, WorkerPoolStatus};
pub use registry::HandlerRegistry;
pub use worker::{Worker, WorkerBuilder, WorkerSnapshot, WorkerStats};
