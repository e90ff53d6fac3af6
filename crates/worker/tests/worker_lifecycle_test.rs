use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use agrotask_domain::{
    HandlerResult, QueueStore, RetryPolicy, Task, TaskHandler, TaskStatus, TaskType,
};
use agrotask_infrastructure::MemoryQueueStore;
use agrotask_worker::{HandlerRegistry, Worker, WorkerManager, WorkerOptions};

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, task: &Task) -> HandlerResult {
        Ok(json!({"echo": task.payload}))
    }
}

fn full_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    for task_type in TaskType::ALL {
        registry.register(task_type, Arc::new(EchoHandler));
    }
    Arc::new(registry)
}

fn options() -> WorkerOptions {
    WorkerOptions {
        max_concurrent_tasks: 2,
        poll_interval: Duration::from_millis(10),
        settle_retry_interval: Duration::from_millis(50),
        allowed_types: None,
        retry_policy: RetryPolicy {
            base_delay_seconds: 0,
            max_delay_seconds: 0,
        },
    }
}

#[tokio::test]
async fn test_worker_lifecycle_and_registration() {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
    let worker = Arc::new(
        Worker::builder("w-life-0".to_string(), Arc::clone(&store), full_registry())
            .poll_interval(Duration::from_millis(10))
            .build(),
    );

    worker.start().await.unwrap();
    assert!(worker.is_running().await);
    // 重复启动被拒绝
    assert!(worker.start().await.is_err());

    let workers = store.list_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].id, "w-life-0");

    worker.stop().await.unwrap();
    assert!(!worker.is_running().await);
    assert!(store.list_workers().await.unwrap().is_empty());
    // 重复停止是空操作
    worker.stop().await.unwrap();

    // 停止后可以重新启动
    worker.start().await.unwrap();
    assert!(worker.is_running().await);
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_scale_workers_is_idempotent() {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
    let manager = WorkerManager::new(Arc::clone(&store), full_registry(), options());

    manager.scale_workers(3).await.unwrap();
    assert_eq!(manager.worker_count().await, 3);
    let before: Vec<String> = manager
        .get_worker_status()
        .await
        .workers
        .iter()
        .map(|w| w.worker_id.clone())
        .collect();

    // 相同目标不重建循环
    manager.scale_workers(3).await.unwrap();
    let after: Vec<String> = manager
        .get_worker_status()
        .await
        .workers
        .iter()
        .map(|w| w.worker_id.clone())
        .collect();
    assert_eq!(before, after);

    manager.scale_workers(1).await.unwrap();
    assert_eq!(manager.worker_count().await, 1);
    assert_eq!(store.list_workers().await.unwrap().len(), 1);

    manager.scale_workers(2).await.unwrap();
    assert_eq!(manager.worker_count().await, 2);
    // 缩容再扩容不会复用已停止Worker的id
    let ids: Vec<String> = manager
        .get_worker_status()
        .await
        .workers
        .iter()
        .map(|w| w.worker_id.clone())
        .collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    manager.shutdown_all().await.unwrap();
    assert_eq!(manager.worker_count().await, 0);
    assert!(store.list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pool_status_aggregates_counters() {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
    let manager = WorkerManager::new(Arc::clone(&store), full_registry(), options());
    manager.scale_workers(2).await.unwrap();

    for _ in 0..6 {
        let task = Task::new(TaskType::NotificationSend, json!({}), 8, None, 30, 3);
        store.insert_task(&task).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let pool = manager.get_worker_status().await;
        if pool.total_processed == 6 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "任务未在期限内处理完");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(store.queue_status().await.unwrap().completed, 6);
    let pool = manager.get_worker_status().await;
    assert_eq!(pool.total_workers, 2);
    assert_eq!(pool.total_processed, 6);
    assert_eq!(pool.total_succeeded, 6);
    assert_eq!(pool.total_failed, 0);
    assert_eq!(pool.total_in_flight, 0);

    manager.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_stopped_pool_leaves_tasks_pending() {
    let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
    let manager = WorkerManager::new(Arc::clone(&store), full_registry(), options());
    manager.scale_workers(1).await.unwrap();
    manager.shutdown_all().await.unwrap();

    let task = Task::new(TaskType::DataExport, json!({}), 3, None, 180, 3);
    store.insert_task(&task).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        store.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}
