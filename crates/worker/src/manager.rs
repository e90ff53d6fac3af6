use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use agrotask_domain::{QueueResult, QueueStore, RetryPolicy, TaskType};

use crate::registry::HandlerRegistry;
use crate::worker::{Worker, WorkerSnapshot};

/// 池内每个Worker的公共参数
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub max_concurrent_tasks: usize,
    pub poll_interval: Duration,
    pub settle_retry_interval: Duration,
    pub allowed_types: Option<Vec<TaskType>>,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            poll_interval: Duration::from_millis(1000),
            settle_retry_interval: Duration::from_secs(5),
            allowed_types: None,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Worker池聚合状态
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerPoolStatus {
    pub total_workers: usize,
    pub total_in_flight: usize,
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub workers: Vec<WorkerSnapshot>,
}

/// Worker池管理器
///
/// 监督一组Worker轮询循环。scale_workers幂等地向目标数量收敛：
/// 数量不变时不重建循环，缩容时优雅停掉多出的Worker。
pub struct WorkerManager {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    options: WorkerOptions,
    base_id: String,
    workers: RwLock<Vec<Arc<Worker>>>,
    /// 单调递增的Worker序号，保证缩扩容后id不复用
    spawned_total: AtomicUsize,
}

impl WorkerManager {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
        options: WorkerOptions,
    ) -> Self {
        let host = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();
        let base_id = format!(
            "{}-{}",
            host,
            &uuid::Uuid::new_v4().to_string()[..8]
        );

        Self {
            store,
            registry,
            options,
            base_id,
            workers: RwLock::new(Vec::new()),
            spawned_total: AtomicUsize::new(0),
        }
    }

    /// 扩缩容到目标Worker数量（幂等）
    pub async fn scale_workers(&self, target: usize) -> QueueResult<()> {
        let mut workers = self.workers.write().await;

        if workers.len() == target {
            debug!("Worker数量已是 {}，无需变更", target);
            return Ok(());
        }

        info!("Worker池从 {} 调整到 {}", workers.len(), target);

        // 缩容：停掉尾部多余的Worker
        if workers.len() > target {
            let removed: Vec<Arc<Worker>> = workers.drain(target..).collect();
            let results = join_all(removed.iter().map(|w| w.stop())).await;
            for (worker, result) in removed.iter().zip(results) {
                if let Err(e) = result {
                    error!("停止Worker {} 失败: {}", worker.worker_id(), e);
                }
            }
        }

        // 扩容：补足缺少的Worker
        while workers.len() < target {
            let seq = self.spawned_total.fetch_add(1, Ordering::Relaxed);
            let worker_id = format!("{}-{}", self.base_id, seq);
            let worker = Arc::new(
                Worker::builder(worker_id, Arc::clone(&self.store), Arc::clone(&self.registry))
                    .retry_policy(self.options.retry_policy)
                    .max_concurrent_tasks(self.options.max_concurrent_tasks)
                    .poll_interval(self.options.poll_interval)
                    .settle_retry_interval(self.options.settle_retry_interval)
                    .allowed_types(self.options.allowed_types.clone())
                    .build(),
            );
            worker.start().await?;
            workers.push(worker);
        }

        Ok(())
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// 聚合状态：Worker总数、各Worker在途数、累计计数器
    pub async fn get_worker_status(&self) -> WorkerPoolStatus {
        let workers = self.workers.read().await;
        let mut snapshots = Vec::with_capacity(workers.len());
        for worker in workers.iter() {
            snapshots.push(worker.snapshot().await);
        }

        WorkerPoolStatus {
            total_workers: snapshots.len(),
            total_in_flight: snapshots.iter().map(|s| s.in_flight).sum(),
            total_processed: snapshots.iter().map(|s| s.processed).sum(),
            total_succeeded: snapshots.iter().map(|s| s.succeeded).sum(),
            total_failed: snapshots.iter().map(|s| s.failed).sum(),
            workers: snapshots,
        }
    }

    /// 停掉全部Worker
    pub async fn shutdown_all(&self) -> QueueResult<()> {
        self.scale_workers(0).await
    }
}
