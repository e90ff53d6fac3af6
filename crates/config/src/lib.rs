pub mod models;

pub use models::{
    AppConfig, ObservabilityConfig, QueueSettings, StoreBackend, StoreConfig, WorkerPoolSettings,
};
