use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use agrotask_domain::{
    DeadLetterPage, FailOutcome, QueueError, QueueResult, QueueStatus, QueueStore, Task, TaskClaim,
    TaskStatus, TaskType, WorkerInfo,
};

/// 内存Queue Store实现
///
/// 用于嵌入式部署和测试。全部状态在一把异步互斥锁之下，每个trait方法
/// 的临界区就是它的原子性边界，语义与Redis实现的Lua脚本一一对应。
pub struct MemoryQueueStore {
    state: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    /// 任务记录表：id -> Task
    tasks: HashMap<String, Task>,
    /// 按优先级的待处理FIFO集合：priority -> ids
    pending: HashMap<u8, VecDeque<String>>,
    /// 延迟集合，按到期时间排序
    scheduled: BTreeSet<(DateTime<Utc>, String)>,
    /// PROCESSING集合
    processing: BTreeSet<String>,
    /// 死信追加集合
    dead: VecDeque<String>,
    /// 累计计数器
    completed_count: u64,
    failed_count: u64,
    /// Worker注册表
    workers: HashMap<String, WorkerInfo>,
}

impl StoreState {
    /// 把到期的延迟任务提升为待处理
    fn promote_due(&mut self, now: DateTime<Utc>) {
        loop {
            let due = match self.scheduled.iter().next() {
                Some((at, id)) if *at <= now => (*at, id.clone()),
                _ => break,
            };
            self.scheduled.remove(&due);
            let (_, id) = due;
            if let Some(task) = self.tasks.get(&id) {
                self.pending.entry(task.priority).or_default().push_back(id);
            }
        }
    }

    fn remove_from_pending(&mut self, priority: u8, task_id: &str) {
        if let Some(queue) = self.pending.get_mut(&priority) {
            queue.retain(|id| id != task_id);
        }
    }

    fn remove_from_scheduled(&mut self, task_id: &str) {
        let found: Vec<(DateTime<Utc>, String)> = self
            .scheduled
            .iter()
            .filter(|(_, id)| id == task_id)
            .cloned()
            .collect();
        for key in found {
            self.scheduled.remove(&key);
        }
    }
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        info!("创建内存Queue Store");
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
        }
    }

    /// CAS检查：任务处于PROCESSING且声明快照仍然有效
    fn check_claim(task: &Task, claim: &TaskClaim) -> bool {
        task.status == TaskStatus::Processing
            && task.worker_id.as_deref() == Some(claim.worker_id.as_str())
            && task.attempts == claim.attempts
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert_task(&self, task: &Task) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.tasks.insert(task.id.clone(), task.clone());
        if task.scheduled_at <= now {
            state
                .pending
                .entry(task.priority)
                .or_default()
                .push_back(task.id.clone());
        } else {
            state.scheduled.insert((task.scheduled_at, task.id.clone()));
        }
        debug!("任务 {} 已入队 (优先级 {})", task.id, task.priority);
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> QueueResult<Option<Task>> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        allowed_types: Option<&[TaskType]>,
    ) -> QueueResult<Option<Task>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.promote_due(now);

        for priority in (1..=10u8).rev() {
            let state = &mut *state;
            let Some(queue) = state.pending.get_mut(&priority) else {
                continue;
            };

            // 同级FIFO，allow-list之外的类型跳过不出队
            let mut hit = None;
            let mut orphans = Vec::new();
            for (idx, id) in queue.iter().enumerate() {
                match state.tasks.get(id) {
                    None => orphans.push(idx),
                    Some(task) => {
                        let allowed = allowed_types
                            .map(|types| types.contains(&task.task_type))
                            .unwrap_or(true);
                        if allowed {
                            hit = Some(idx);
                            break;
                        }
                    }
                }
            }

            for idx in orphans.into_iter().rev() {
                queue.remove(idx);
                if let Some(h) = hit.as_mut() {
                    if idx < *h {
                        *h -= 1;
                    }
                }
            }

            if let Some(idx) = hit {
                let id = queue.remove(idx).expect("索引来自同一临界区");
                let task = state.tasks.get_mut(&id).expect("孤儿id已被剔除");
                task.status = TaskStatus::Processing;
                task.worker_id = Some(worker_id.to_string());
                task.started_at = Some(now);
                state.processing.insert(id.clone());
                debug!("Worker {} 声明任务 {}", worker_id, id);
                return Ok(Some(task.clone()));
            }
        }

        Ok(None)
    }

    async fn complete_task(
        &self,
        task_id: &str,
        claim: &TaskClaim,
        result: serde_json::Value,
    ) -> QueueResult<Task> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::task_not_found(task_id))?;

        if !Self::check_claim(task, claim) {
            return Err(QueueError::claim_lost(task_id));
        }

        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.worker_id = None;
        task.result = Some(result);
        let snapshot = task.clone();

        state.processing.remove(task_id);
        state.completed_count += 1;
        Ok(snapshot)
    }

    async fn fail_task(
        &self,
        task_id: &str,
        claim: &TaskClaim,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> QueueResult<FailOutcome> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::task_not_found(task_id))?;

        if !Self::check_claim(task, claim) {
            return Err(QueueError::claim_lost(task_id));
        }

        task.attempts += 1;
        task.error = Some(error.to_string());
        task.worker_id = None;
        task.started_at = None;

        let outcome = match retry_at {
            Some(at) => {
                task.status = TaskStatus::Pending;
                task.scheduled_at = at;
                state.scheduled.insert((at, task_id.to_string()));
                FailOutcome::Retried { scheduled_at: at }
            }
            None => {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                state.dead.push_back(task_id.to_string());
                FailOutcome::DeadLettered
            }
        };

        state.processing.remove(task_id);
        state.failed_count += 1;
        Ok(outcome)
    }

    async fn cancel_task(&self, task_id: &str) -> QueueResult<Task> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::task_not_found(task_id))?;

        if task.status != TaskStatus::Pending {
            return Err(QueueError::Validation(format!(
                "任务 {task_id} 处于 {} 状态，只有PENDING任务可以取消",
                task.status
            )));
        }

        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        let priority = task.priority;
        let snapshot = task.clone();

        state.remove_from_pending(priority, task_id);
        state.remove_from_scheduled(task_id);
        Ok(snapshot)
    }

    async fn requeue_dead_task(&self, task_id: &str) -> QueueResult<Task> {
        let mut state = self.state.lock().await;

        let in_dlq = state.dead.iter().any(|id| id == task_id);
        if !in_dlq {
            return Err(QueueError::Validation(format!(
                "任务 {task_id} 不在死信队列中"
            )));
        }

        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| QueueError::task_not_found(task_id))?;

        let now = Utc::now();
        task.status = TaskStatus::Pending;
        task.attempts = 0;
        task.scheduled_at = now;
        task.completed_at = None;
        task.worker_id = None;
        task.error = None;
        task.result = None;
        let priority = task.priority;
        let snapshot = task.clone();

        state.dead.retain(|id| id != task_id);
        state
            .pending
            .entry(priority)
            .or_default()
            .push_back(task_id.to_string());
        info!("死信任务 {} 已重新入队", task_id);
        Ok(snapshot)
    }

    async fn list_processing(&self) -> QueueResult<Vec<Task>> {
        let state = self.state.lock().await;
        Ok(state
            .processing
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect())
    }

    async fn list_dead_tasks(&self, offset: u64, limit: u64) -> QueueResult<DeadLetterPage> {
        let state = self.state.lock().await;
        let tasks = state
            .dead
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect();
        Ok(DeadLetterPage {
            tasks,
            total: state.dead.len() as u64,
            offset,
            limit,
        })
    }

    async fn purge_dead_task(&self, task_id: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.dead.len();
        state.dead.retain(|id| id != task_id);
        let removed = state.dead.len() < before;
        if removed {
            state.tasks.remove(task_id);
            info!("死信任务 {} 已永久删除", task_id);
        }
        Ok(removed)
    }

    async fn queue_status(&self) -> QueueResult<QueueStatus> {
        let state = self.state.lock().await;
        let now = Utc::now();
        let visible: u64 = state.pending.values().map(|q| q.len() as u64).sum();
        let due = state.scheduled.iter().filter(|(at, _)| *at <= now).count() as u64;
        let future = state.scheduled.len() as u64 - due;

        Ok(QueueStatus {
            total_pending: visible + due,
            scheduled: future,
            processing: state.processing.len() as u64,
            completed: state.completed_count,
            failed: state.failed_count,
            dlq_size: state.dead.len() as u64,
        })
    }

    async fn register_worker(&self, info: &WorkerInfo) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.workers.insert(info.id.clone(), info.clone());
        Ok(())
    }

    async fn update_worker(&self, info: &WorkerInfo) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.workers.insert(info.id.clone(), info.clone());
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.workers.remove(worker_id);
        Ok(())
    }

    async fn list_workers(&self) -> QueueResult<Vec<WorkerInfo>> {
        let state = self.state.lock().await;
        Ok(state.workers.values().cloned().collect())
    }

    async fn clear_all(&self) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.tasks.clear();
        state.pending.clear();
        state.scheduled.clear();
        state.processing.clear();
        state.dead.clear();
        state.completed_count = 0;
        state.failed_count = 0;
        info!("Queue Store已清空");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn task(task_type: TaskType, priority: u8) -> Task {
        Task::new(task_type, json!({}), priority, None, 60, 3)
    }

    fn delayed_task(task_type: TaskType, priority: u8, delay_seconds: i64) -> Task {
        Task::new(
            task_type,
            json!({}),
            priority,
            Some(Utc::now() + chrono::Duration::seconds(delay_seconds)),
            60,
            3,
        )
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_fifo() {
        let store = MemoryQueueStore::new();
        let low_first = task(TaskType::ReportGeneration, 3);
        let low_second = task(TaskType::DataExport, 3);
        let high = task(TaskType::NotificationSend, 8);

        store.insert_task(&low_first).await.unwrap();
        store.insert_task(&low_second).await.unwrap();
        store.insert_task(&high).await.unwrap();

        let first = store.claim_next_task("w-1", None).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        let second = store.claim_next_task("w-1", None).await.unwrap().unwrap();
        assert_eq!(second.id, low_first.id);
        let third = store.claim_next_task("w-1", None).await.unwrap().unwrap();
        assert_eq!(third.id, low_second.id);
        assert!(store.claim_next_task("w-1", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_sets_processing_fields() {
        let store = MemoryQueueStore::new();
        let t = task(TaskType::NdviCalculation, 5);
        store.insert_task(&t).await.unwrap();

        let claimed = store.claim_next_task("w-9", None).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.worker_id.as_deref(), Some("w-9"));
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn test_allow_list_skips_other_types() {
        let store = MemoryQueueStore::new();
        let export = task(TaskType::DataExport, 5);
        let ndvi = task(TaskType::NdviCalculation, 5);
        store.insert_task(&export).await.unwrap();
        store.insert_task(&ndvi).await.unwrap();

        let allowed = [TaskType::NdviCalculation];
        let claimed = store
            .claim_next_task("w-1", Some(&allowed[..]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, ndvi.id);
        // 被跳过的任务仍然在队列里
        assert!(store
            .claim_next_task("w-1", Some(&allowed[..]))
            .await
            .unwrap()
            .is_none());
        let leftover = store.claim_next_task("w-1", None).await.unwrap().unwrap();
        assert_eq!(leftover.id, export.id);
    }

    #[tokio::test]
    async fn test_future_task_invisible_until_due() {
        let store = MemoryQueueStore::new();
        let t = delayed_task(TaskType::DataExport, 5, 60);
        store.insert_task(&t).await.unwrap();

        assert!(store.claim_next_task("w-1", None).await.unwrap().is_none());
        let status = store.queue_status().await.unwrap();
        assert_eq!(status.total_pending, 0);
        assert_eq!(status.scheduled, 1);
    }

    #[tokio::test]
    async fn test_due_delayed_task_is_promoted() {
        let store = MemoryQueueStore::new();
        let t = delayed_task(TaskType::DataExport, 5, -1);
        store.insert_task(&t).await.unwrap();

        let status = store.queue_status().await.unwrap();
        assert_eq!(status.total_pending, 1);
        let claimed = store.claim_next_task("w-1", None).await.unwrap().unwrap();
        assert_eq!(claimed.id, t.id);
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_distinct_tasks() {
        let store = Arc::new(MemoryQueueStore::new());
        for _ in 0..5 {
            store
                .insert_task(&task(TaskType::ModelInference, 5))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .claim_next_task(&format!("w-{i}"), None)
                    .await
                    .unwrap()
            }));
        }

        let mut claimed_ids = Vec::new();
        for handle in handles {
            if let Some(t) = handle.await.unwrap() {
                claimed_ids.push(t.id);
            }
        }
        claimed_ids.sort();
        claimed_ids.dedup();
        // 5个任务恰好被声明5次，无重复
        assert_eq!(claimed_ids.len(), 5);
    }

    #[tokio::test]
    async fn test_complete_cas() {
        let store = MemoryQueueStore::new();
        let t = task(TaskType::NdviCalculation, 5);
        store.insert_task(&t).await.unwrap();
        let claimed = store.claim_next_task("w-1", None).await.unwrap().unwrap();
        let claim = TaskClaim::of(&claimed);

        let done = store
            .complete_task(&claimed.id, &claim, json!({"ndvi_mean": 0.62}))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.worker_id.is_none());

        // 重复结算：声明已不再有效
        let err = store
            .complete_task(&claimed.id, &claim, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ClaimLost { .. }));
    }

    #[tokio::test]
    async fn test_fail_retry_path_reschedules() {
        let store = MemoryQueueStore::new();
        let t = task(TaskType::DiseaseDetection, 8);
        store.insert_task(&t).await.unwrap();
        let claimed = store.claim_next_task("w-1", None).await.unwrap().unwrap();
        let claim = TaskClaim::of(&claimed);

        let retry_at = Utc::now() + chrono::Duration::seconds(30);
        let outcome = store
            .fail_task(&claimed.id, &claim, "模型服务不可用", Some(retry_at))
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retried { .. }));

        let stored = store.get_task(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert!(stored.worker_id.is_none());

        let status = store.queue_status().await.unwrap();
        assert_eq!(status.processing, 0);
        assert_eq!(status.failed, 1);
        assert_eq!(status.scheduled, 1);
    }

    #[tokio::test]
    async fn test_fail_dead_letter_path() {
        let store = MemoryQueueStore::new();
        let t = task(TaskType::ReportGeneration, 3);
        store.insert_task(&t).await.unwrap();
        let claimed = store.claim_next_task("w-1", None).await.unwrap().unwrap();
        let claim = TaskClaim::of(&claimed);

        let outcome = store
            .fail_task(&claimed.id, &claim, "模板渲染崩溃", None)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered);

        let status = store.queue_status().await.unwrap();
        assert_eq!(status.dlq_size, 1);
        assert_eq!(status.total_pending, 0);

        // 声明失效后的并发失败结算只有一次生效
        let err = store
            .fail_task(&claimed.id, &claim, "重复清扫", None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ClaimLost { .. }));
        assert_eq!(store.queue_status().await.unwrap().dlq_size, 1);
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let store = MemoryQueueStore::new();
        let t = task(TaskType::DataExport, 3);
        store.insert_task(&t).await.unwrap();

        let cancelled = store.cancel_task(&t.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(store.claim_next_task("w-1", None).await.unwrap().is_none());

        let t2 = task(TaskType::DataExport, 3);
        store.insert_task(&t2).await.unwrap();
        store.claim_next_task("w-1", None).await.unwrap().unwrap();
        assert!(store.cancel_task(&t2.id).await.is_err());
    }

    #[tokio::test]
    async fn test_requeue_and_purge_dead_tasks() {
        let store = MemoryQueueStore::new();
        let t = task(TaskType::ModelInference, 5);
        store.insert_task(&t).await.unwrap();
        let claimed = store.claim_next_task("w-1", None).await.unwrap().unwrap();
        store
            .fail_task(&claimed.id, &TaskClaim::of(&claimed), "oom", None)
            .await
            .unwrap();

        // 非死信任务不能requeue
        let other = task(TaskType::ModelInference, 5);
        store.insert_task(&other).await.unwrap();
        assert!(store.requeue_dead_task(&other.id).await.is_err());

        let restored = store.requeue_dead_task(&t.id).await.unwrap();
        assert_eq!(restored.status, TaskStatus::Pending);
        assert_eq!(restored.attempts, 0);
        assert_eq!(store.queue_status().await.unwrap().dlq_size, 0);

        // 再次死信后purge
        let claimed = store.claim_next_task("w-1", None).await.unwrap().unwrap();
        assert_eq!(claimed.id, restored.id);
        store
            .fail_task(&claimed.id, &TaskClaim::of(&claimed), "oom", None)
            .await
            .unwrap();
        assert!(store.purge_dead_task(&t.id).await.unwrap());
        assert!(!store.purge_dead_task(&t.id).await.unwrap());
        assert!(store.get_task(&t.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_pagination() {
        let store = MemoryQueueStore::new();
        for _ in 0..5 {
            let t = task(TaskType::NotificationSend, 8);
            store.insert_task(&t).await.unwrap();
            let claimed = store.claim_next_task("w-1", None).await.unwrap().unwrap();
            store
                .fail_task(&claimed.id, &TaskClaim::of(&claimed), "网关拒绝", None)
                .await
                .unwrap();
        }

        let page = store.list_dead_tasks(0, 2).await.unwrap();
        assert_eq!(page.tasks.len(), 2);
        assert_eq!(page.total, 5);
        let page = store.list_dead_tasks(4, 2).await.unwrap();
        assert_eq!(page.tasks.len(), 1);
        let page = store.list_dead_tasks(10, 2).await.unwrap();
        assert!(page.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_clear_all_keeps_workers() {
        let store = MemoryQueueStore::new();
        store
            .insert_task(&task(TaskType::DataExport, 3))
            .await
            .unwrap();
        let info = WorkerInfo::new("w-1".into(), "host".into(), vec![], 4);
        store.register_worker(&info).await.unwrap();

        store.clear_all().await.unwrap();
        let status = store.queue_status().await.unwrap();
        assert_eq!(status.total_pending, 0);
        assert_eq!(store.list_workers().await.unwrap().len(), 1);
    }
}
