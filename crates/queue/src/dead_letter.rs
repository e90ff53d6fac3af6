use std::sync::Arc;

use tracing::info;

use agrotask_domain::{DeadLetterPage, QueueResult, QueueStore, Task};

/// 死信队列操作
///
/// 耗尽重试预算任务的终态存储。追加写入由失败结算完成，这里只提供
/// 分页查看、手工重新入队和永久删除；删除的审计日志由调用方负责。
pub struct DeadLetterQueue {
    store: Arc<dyn QueueStore>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// 分页列出死信任务
    pub async fn list(&self, offset: u64, limit: u64) -> QueueResult<DeadLetterPage> {
        self.store.list_dead_tasks(offset, limit).await
    }

    /// 重新入队，语义等同于TaskQueue::retry_failed
    pub async fn requeue(&self, task_id: &str) -> QueueResult<Task> {
        let task = self.store.requeue_dead_task(task_id).await?;
        info!("死信任务 {} 已重新入队", task_id);
        Ok(task)
    }

    /// 永久删除
    pub async fn purge(&self, task_id: &str) -> QueueResult<bool> {
        self.store.purge_dead_task(task_id).await
    }
}
