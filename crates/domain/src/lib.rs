pub mod entities;
pub mod errors;
pub mod ports;
pub mod repositories;
pub mod retry;

pub use entities::{
    DeadLetterPage, FailOutcome, HandlerFailure, HandlerResult, QueueStatus, Task, TaskClaim,
    TaskStatus, TaskType, WorkerInfo, WorkerStatus,
};
pub use errors::{QueueError, QueueResult};
pub use ports::TaskHandler;
pub use repositories::QueueStore;
pub use retry::{decide_failure, FailureDisposition, RetryPolicy};
