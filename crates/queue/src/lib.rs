pub mod dead_letter;
pub mod task_queue;
pub mod timeout_watcher;

pub use dead_letter::DeadLetterQueue;
pub use task_queue::{EnqueueOptions, TaskQueue, DEFAULT_MAX_RETRIES};
pub use timeout_watcher::{TimeoutWatcher, TimeoutWatcherConfig};
