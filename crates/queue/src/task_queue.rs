use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use agrotask_domain::{
    decide_failure, FailureDisposition, QueueError, QueueResult, QueueStatus, QueueStore,
    RetryPolicy, Task, TaskClaim, TaskType,
};

/// 入队时的默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 入队选项
///
/// 未指定的字段落回任务类型的约定默认值。
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<u8>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

/// 任务队列
///
/// 生产者/管理侧API。所有操作都直接落到Queue Store上，本身不持有
/// 任何权威状态。
pub struct TaskQueue {
    store: Arc<dyn QueueStore>,
    retry_policy: RetryPolicy,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn QueueStore>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            retry_policy,
        }
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// 入队新任务
    ///
    /// 参数验证在任何持久化之前完成；只有store写入成功后才返回任务id。
    pub async fn enqueue(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<String> {
        let priority = options.priority.unwrap_or_else(|| task_type.default_priority());
        if !(1..=10).contains(&priority) {
            return Err(QueueError::Validation(format!(
                "优先级必须在1-10之间: {priority}"
            )));
        }

        let timeout_seconds = options
            .timeout_seconds
            .unwrap_or_else(|| task_type.default_timeout_seconds());
        if timeout_seconds == 0 {
            return Err(QueueError::validation_error("超时时间必须大于0"));
        }

        let max_retries = options.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);

        let task = Task::new(
            task_type,
            payload,
            priority,
            options.scheduled_at,
            timeout_seconds,
            max_retries,
        );

        self.store.insert_task(&task).await?;
        info!(
            "任务已入队: id={}, 类型={}, 优先级={}, 调度时间={}",
            task.id, task.task_type, task.priority, task.scheduled_at
        );
        Ok(task.id)
    }

    pub async fn get_task(&self, task_id: &str) -> QueueResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| QueueError::task_not_found(task_id))
    }

    /// 队列状态聚合（逐字段时点快照）
    pub async fn get_queue_status(&self) -> QueueResult<QueueStatus> {
        self.store.queue_status().await
    }

    /// 超时清扫
    ///
    /// 扫描PROCESSING集合，对超过超时预算的任务施加与处理器失败完全相同
    /// 的迁移（合成TimeoutError）。通过声明CAS保证并发/重复调用下每个
    /// 任务恰好迁移一次。返回本次完成迁移的任务id。
    pub async fn check_timeouts(&self) -> QueueResult<Vec<String>> {
        let processing = self.store.list_processing().await?;
        let now = Utc::now();
        let mut transitioned = Vec::new();

        for task in processing {
            if !task.is_timed_out(now) {
                continue;
            }

            let claim = TaskClaim::of(&task);
            let attempts_after = task.attempts + 1;
            let disposition = decide_failure(
                &self.retry_policy,
                attempts_after,
                task.max_retries,
                true,
                now,
            );
            let retry_at = match disposition {
                FailureDisposition::Retry { run_at } => Some(run_at),
                FailureDisposition::DeadLetter => None,
            };
            let error = format!(
                "任务执行超时 ({}s)，worker={} 未结算",
                task.timeout_seconds,
                claim.worker_id
            );

            match self.store.fail_task(&task.id, &claim, &error, retry_at).await {
                Ok(outcome) => {
                    warn!("超时任务 {} 已迁移: {:?}", task.id, outcome);
                    transitioned.push(task.id);
                }
                Err(QueueError::ClaimLost { .. }) => {
                    // 另一次清扫或原Worker抢先结算了
                    debug!("超时任务 {} 的声明已被他方结算，跳过", task.id);
                }
                Err(e) => {
                    warn!("迁移超时任务 {} 失败: {}", task.id, e);
                }
            }
        }

        if !transitioned.is_empty() {
            info!("本次超时清扫迁移了 {} 个任务", transitioned.len());
        }
        Ok(transitioned)
    }

    /// 死信/终态失败任务的手工重试：attempts归零并恢复为PENDING
    pub async fn retry_failed(&self, task_id: &str) -> QueueResult<Task> {
        let task = self.store.requeue_dead_task(task_id).await?;
        info!("任务 {} 已手工重试，重新进入队列", task_id);
        Ok(task)
    }

    /// 取消PENDING任务；PROCESSING任务只能由处理器协作式取消
    pub async fn cancel(&self, task_id: &str) -> QueueResult<Task> {
        let task = self.store.cancel_task(task_id).await?;
        info!("任务 {} 已取消", task_id);
        Ok(task)
    }

    /// 清空全部任务状态。破坏性操作，仅用于测试/管理场景。
    pub async fn clear_all(&self) -> QueueResult<()> {
        warn!("清空任务队列（破坏性操作）");
        self.store.clear_all().await
    }
}
