use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{
    DeadLetterPage, FailOutcome, QueueStatus, Task, TaskClaim, TaskType, WorkerInfo,
};
use crate::errors::QueueResult;

/// Queue Store端口
///
/// 队列状态的唯一权威来源。每个状态迁移（声明、完成、失败、重新入队）
/// 都必须是对store的一次原子操作——这是并发Worker之间不发生脑裂的前提。
///
/// 布局约定（按可配置前缀命名空间隔离）：
/// - 按优先级的FIFO集合（待处理）
/// - 以id为键的任务记录表
/// - 按到期时间排序的延迟集合
/// - PROCESSING集合
/// - 死信追加集合
/// - Worker注册表
/// - 累计completed/failed计数器
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// 持久化新任务并放入待处理集合（scheduled_at在未来时放入延迟集合）
    async fn insert_task(&self, task: &Task) -> QueueResult<()>;

    async fn get_task(&self, task_id: &str) -> QueueResult<Option<Task>>;

    /// 原子声明下一个可见任务
    ///
    /// 单次原子操作内完成：把到期的延迟任务提升为待处理；按优先级从高到低、
    /// 同级FIFO扫描；跳过allow-list之外的类型；命中后将任务置为PROCESSING
    /// 并记录worker_id与started_at。两个Worker竞争同一个任务时恰有一个成功。
    async fn claim_next_task(
        &self,
        worker_id: &str,
        allowed_types: Option<&[TaskType]>,
    ) -> QueueResult<Option<Task>>;

    /// 成功结算。CAS期望不满足时返回ClaimLost。
    async fn complete_task(
        &self,
        task_id: &str,
        claim: &TaskClaim,
        result: serde_json::Value,
    ) -> QueueResult<Task>;

    /// 失败结算：attempts加一，retry_at为Some则按退避重新调度回PENDING，
    /// 为None则移入死信队列。CAS期望不满足时返回ClaimLost。
    async fn fail_task(
        &self,
        task_id: &str,
        claim: &TaskClaim,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> QueueResult<FailOutcome>;

    /// 取消PENDING任务；PROCESSING任务不可强制取消
    async fn cancel_task(&self, task_id: &str) -> QueueResult<Task>;

    /// 死信任务重新入队：attempts归零，状态回到PENDING
    async fn requeue_dead_task(&self, task_id: &str) -> QueueResult<Task>;

    /// 当前所有PROCESSING任务（超时清扫的输入）
    async fn list_processing(&self) -> QueueResult<Vec<Task>>;

    async fn list_dead_tasks(&self, offset: u64, limit: u64) -> QueueResult<DeadLetterPage>;

    /// 从死信队列永久删除，返回是否确有删除
    async fn purge_dead_task(&self, task_id: &str) -> QueueResult<bool>;

    async fn queue_status(&self) -> QueueResult<QueueStatus>;

    async fn register_worker(&self, info: &WorkerInfo) -> QueueResult<()>;
    async fn update_worker(&self, info: &WorkerInfo) -> QueueResult<()>;
    async fn unregister_worker(&self, worker_id: &str) -> QueueResult<()>;
    async fn list_workers(&self) -> QueueResult<Vec<WorkerInfo>>;

    /// 清空全部任务状态（测试/管理用途；不触碰Worker注册表）
    async fn clear_all(&self) -> QueueResult<()>;
}
