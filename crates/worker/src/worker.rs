use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use agrotask_domain::{
    decide_failure, FailOutcome, FailureDisposition, HandlerFailure, QueueError, QueueResult,
    QueueStore, RetryPolicy, Task, TaskClaim, TaskType, WorkerInfo, WorkerStatus,
};

use crate::registry::HandlerRegistry;

/// Worker累计计数器
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

/// 单个Worker的状态快照
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub in_flight: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Worker构建器
pub struct WorkerBuilder {
    worker_id: String,
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    max_concurrent_tasks: usize,
    poll_interval: Duration,
    settle_retry_interval: Duration,
    allowed_types: Option<Vec<TaskType>>,
    hostname: String,
}

impl WorkerBuilder {
    pub fn new(
        worker_id: String,
        store: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            worker_id,
            store,
            registry,
            retry_policy: RetryPolicy::default(),
            max_concurrent_tasks: 4,
            poll_interval: Duration::from_millis(1000),
            settle_retry_interval: Duration::from_secs(5),
            allowed_types: None,
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
        }
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// 最大并发处理数
    pub fn max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// 结算写入失败后的原地重试间隔
    pub fn settle_retry_interval(mut self, interval: Duration) -> Self {
        self.settle_retry_interval = interval;
        self
    }

    /// 限定本Worker可处理的任务类型（None为全部）
    pub fn allowed_types(mut self, allowed_types: Option<Vec<TaskType>>) -> Self {
        self.allowed_types = allowed_types;
        self
    }

    pub fn hostname(mut self, hostname: String) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn build(self) -> Worker {
        let (shutdown_tx, _) = broadcast::channel(4);
        Worker {
            inner: Arc::new(WorkerInner {
                worker_id: self.worker_id,
                hostname: self.hostname,
                store: self.store,
                registry: self.registry,
                retry_policy: self.retry_policy,
                max_concurrent_tasks: self.max_concurrent_tasks,
                poll_interval: self.poll_interval,
                settle_retry_interval: self.settle_retry_interval,
                allowed_types: self.allowed_types,
                registered_at: Utc::now(),
                running_tasks: RwLock::new(HashMap::new()),
                stats: WorkerStats::default(),
                settle_stalled: AtomicBool::new(false),
                shutdown_tx,
                is_running: RwLock::new(false),
            }),
            loop_handle: Mutex::new(None),
        }
    }
}

/// Worker轮询执行循环
///
/// 每轮：从最高优先级向下轮询可见任务，原子声明（PENDING -> PROCESSING，
/// 系统中最重要的原子性边界），查处理器并调用，按显式结果值施加状态迁移。
/// 单个Worker最多同时持有max_concurrent_tasks个在途处理器调用。
pub struct Worker {
    inner: Arc<WorkerInner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

struct WorkerInner {
    worker_id: String,
    hostname: String,
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    max_concurrent_tasks: usize,
    poll_interval: Duration,
    settle_retry_interval: Duration,
    allowed_types: Option<Vec<TaskType>>,
    registered_at: DateTime<Utc>,
    /// 在途任务：id -> 类型。进程内簿记，权威状态始终在store
    running_tasks: RwLock<HashMap<String, TaskType>>,
    stats: WorkerStats,
    /// 结算写入受阻时置位，暂停接受新声明
    settle_stalled: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    is_running: RwLock<bool>,
}

impl Worker {
    pub fn builder(
        worker_id: String,
        store: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
    ) -> WorkerBuilder {
        WorkerBuilder::new(worker_id, store, registry)
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    /// 启动Worker
    ///
    /// 先做处理器覆盖校验：将要轮询的类型缺少处理器直接拒绝启动。
    pub async fn start(&self) -> QueueResult<()> {
        let inner = &self.inner;

        let poll_types: Vec<TaskType> = inner
            .allowed_types
            .clone()
            .unwrap_or_else(|| TaskType::ALL.to_vec());
        inner.registry.validate_for(&poll_types)?;

        {
            let mut running = inner.is_running.write().await;
            if *running {
                return Err(QueueError::Internal(format!(
                    "Worker {} 已在运行",
                    inner.worker_id
                )));
            }
            *running = true;
        }

        if let Err(e) = inner.store.register_worker(&inner.worker_info(0).await).await {
            warn!("注册Worker {} 失败: {}", inner.worker_id, e);
        }

        info!(
            "启动Worker: id={}, 并发上限={}, 轮询间隔={:?}, 类型限制={:?}",
            inner.worker_id, inner.max_concurrent_tasks, inner.poll_interval, inner.allowed_types
        );

        let loop_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            loop_inner.run_loop().await;
        });
        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    /// 停止Worker：停止声明新任务，等待在途任务结算完毕
    pub async fn stop(&self) -> QueueResult<()> {
        let inner = &self.inner;
        {
            let mut running = inner.is_running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        let _ = inner.shutdown_tx.send(());
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }

        // 在途任务排空（有界等待）
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !inner.running_tasks.read().await.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Worker {} 停止时仍有 {} 个在途任务未结算",
                    inner.worker_id,
                    inner.running_tasks.read().await.len()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Err(e) = inner.store.unregister_worker(&inner.worker_id).await {
            warn!("注销Worker {} 失败: {}", inner.worker_id, e);
        }
        info!("Worker {} 已停止", inner.worker_id);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.inner.is_running.read().await
    }

    pub async fn in_flight(&self) -> usize {
        self.inner.running_tasks.read().await.len()
    }

    pub async fn snapshot(&self) -> WorkerSnapshot {
        let inner = &self.inner;
        WorkerSnapshot {
            worker_id: inner.worker_id.clone(),
            in_flight: inner.running_tasks.read().await.len(),
            processed: inner.stats.processed.load(Ordering::Relaxed),
            succeeded: inner.stats.succeeded.load(Ordering::Relaxed),
            failed: inner.stats.failed.load(Ordering::Relaxed),
        }
    }
}

impl WorkerInner {
    async fn worker_info(&self, current_task_count: usize) -> WorkerInfo {
        let mut info = WorkerInfo::new(
            self.worker_id.clone(),
            self.hostname.clone(),
            self.allowed_types.clone().unwrap_or_default(),
            self.max_concurrent_tasks,
        );
        info.current_task_count = current_task_count;
        info.registered_at = self.registered_at;
        info.last_seen_at = Utc::now();
        info.status = if *self.is_running.read().await {
            WorkerStatus::Alive
        } else {
            WorkerStatus::Stopped
        };
        info
    }

    async fn run_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // 轮询抖动，多个Worker不同步扑向store
        let jitter_ms =
            (rand::random::<f64>() * self.poll_interval.as_millis() as f64 * 0.5) as u64;
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    WorkerInner::poll_once(&self).await;
                }
                _ = shutdown_rx.recv() => {
                    debug!("Worker {} 收到关闭信号", self.worker_id);
                    break;
                }
            }
        }
    }

    /// 一轮轮询：持续声明直到并发饱和或队列无可见任务
    async fn poll_once(this: &Arc<WorkerInner>) {
        if !*this.is_running.read().await {
            return;
        }
        if this.settle_stalled.load(Ordering::Relaxed) {
            debug!("Worker {} 结算受阻中，暂停声明", this.worker_id);
            return;
        }

        loop {
            let in_flight = this.running_tasks.read().await.len();
            if in_flight >= this.max_concurrent_tasks {
                break;
            }

            match this
                .store
                .claim_next_task(&this.worker_id, this.allowed_types.as_deref())
                .await
            {
                Ok(Some(task)) => {
                    debug!(
                        "Worker {} 声明任务 {} (类型 {}, 优先级 {})",
                        this.worker_id, task.id, task.task_type, task.priority
                    );
                    this.running_tasks
                        .write()
                        .await
                        .insert(task.id.clone(), task.task_type);

                    let exec_inner = Arc::clone(this);
                    tokio::spawn(async move {
                        exec_inner.execute_claimed(task).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Worker {} 声明任务失败: {}", this.worker_id, e);
                    break;
                }
            }
        }
    }

    async fn execute_claimed(&self, task: Task) {
        let claim = TaskClaim::of(&task);
        info!(
            "执行任务: id={}, 类型={}, 第{}次尝试",
            task.id,
            task.task_type,
            task.attempts + 1
        );

        let outcome = match self.registry.get(task.task_type) {
            Some(handler) => handler.handle(&task).await,
            // 启动校验兜底，正常不可达
            None => Err(HandlerFailure::fatal(format!(
                "任务类型 {} 没有注册处理器",
                task.task_type
            ))),
        };

        self.settle(&task, &claim, outcome).await;

        self.running_tasks.write().await.remove(&task.id);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        let count = self.running_tasks.read().await.len();
        if let Err(e) = self.store.update_worker(&self.worker_info(count).await).await {
            debug!("刷新Worker {} 注册信息失败: {}", self.worker_id, e);
        }
    }

    /// 把处理器结果结算回store
    ///
    /// 已声明任务的结果不允许丢失：store写入失败时置stalled、停止接受
    /// 新声明，并原地重试写入直到成功或Worker被关停。
    async fn settle(
        &self,
        task: &Task,
        claim: &TaskClaim,
        outcome: Result<serde_json::Value, HandlerFailure>,
    ) {
        loop {
            let result = match &outcome {
                Ok(value) => self
                    .store
                    .complete_task(&task.id, claim, value.clone())
                    .await
                    .map(|_| None),
                Err(failure) => {
                    let attempts_after = task.attempts + 1;
                    let disposition = decide_failure(
                        &self.retry_policy,
                        attempts_after,
                        task.max_retries,
                        failure.retryable,
                        Utc::now(),
                    );
                    let retry_at = match disposition {
                        FailureDisposition::Retry { run_at } => Some(run_at),
                        FailureDisposition::DeadLetter => None,
                    };
                    self.store
                        .fail_task(&task.id, claim, &failure.message, retry_at)
                        .await
                        .map(Some)
                }
            };

            match result {
                Ok(fail_outcome) => {
                    self.settle_stalled.store(false, Ordering::Relaxed);
                    match (&outcome, fail_outcome) {
                        (Ok(_), _) => {
                            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                            info!("任务 {} 执行成功", task.id);
                        }
                        (Err(failure), Some(FailOutcome::Retried { scheduled_at })) => {
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                "任务 {} 第{}次尝试失败: {}，将在 {} 重试",
                                task.id,
                                task.attempts + 1,
                                failure.message,
                                scheduled_at
                            );
                        }
                        (Err(failure), Some(FailOutcome::DeadLettered)) => {
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                "任务 {} 第{}次尝试失败: {}，已进入死信队列",
                                task.id,
                                task.attempts + 1,
                                failure.message
                            );
                        }
                        (Err(_), None) => unreachable!("失败结算必有去向"),
                    }
                    return;
                }
                Err(QueueError::ClaimLost { .. }) => {
                    // 超时清扫先行回收了声明，本次执行结果作废（at-least-once）
                    self.settle_stalled.store(false, Ordering::Relaxed);
                    warn!(
                        "任务 {} 的声明已被他方结算，Worker {} 丢弃本次结果",
                        task.id, self.worker_id
                    );
                    return;
                }
                Err(e) if e.is_retryable() => {
                    self.settle_stalled.store(true, Ordering::Relaxed);
                    error!(
                        "任务 {} 结算写入失败: {}，{:?}后重试（暂停新声明）",
                        task.id, e, self.settle_retry_interval
                    );
                    tokio::time::sleep(self.settle_retry_interval).await;
                    if !*self.is_running.read().await {
                        error!(
                            "Worker {} 已关停，任务 {} 的结算放弃，等待超时清扫回收",
                            self.worker_id, task.id
                        );
                        self.settle_stalled.store(false, Ordering::Relaxed);
                        return;
                    }
                }
                Err(e) => {
                    error!("任务 {} 结算失败（不可重试）: {}", task.id, e);
                    return;
                }
            }
        }
    }
}
