use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use agrotask_config::AppConfig;
use agrotask_domain::RetryPolicy;
use agrotask_infrastructure::create_queue_store;
use agrotask_queue::{TaskQueue, TimeoutWatcher, TimeoutWatcherConfig};
use agrotask_worker::{HandlerRegistry, WorkerManager, WorkerOptions};

use crate::handlers::build_registry;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行Worker池
    Worker,
    /// 仅运行超时清扫
    Sweeper,
    /// 运行所有组件
    All,
}

/// 主应用程序
///
/// 按配置组装store、任务队列、处理器注册表、Worker池和超时清扫循环。
pub struct Application {
    config: AppConfig,
    task_queue: Arc<TaskQueue>,
    worker_manager: Arc<WorkerManager>,
    timeout_watcher: Arc<TimeoutWatcher>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = create_queue_store(&config.store)
            .await
            .context("创建Queue Store失败")?;

        let retry_policy = RetryPolicy {
            base_delay_seconds: config.queue.retry_base_delay_seconds,
            max_delay_seconds: config.queue.retry_max_delay_seconds,
        };

        let task_queue = Arc::new(TaskQueue::new(Arc::clone(&store), retry_policy));

        let registry: Arc<HandlerRegistry> =
            Arc::new(build_registry(&config).context("构建处理器注册表失败")?);

        let allowed_types = config
            .worker_task_types()
            .context("解析Worker任务类型限制失败")?;

        let worker_manager = Arc::new(WorkerManager::new(
            Arc::clone(&store),
            registry,
            WorkerOptions {
                max_concurrent_tasks: config.worker.max_concurrent_tasks,
                poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
                settle_retry_interval: Duration::from_secs(5),
                allowed_types,
                retry_policy,
            },
        ));

        let timeout_watcher = Arc::new(TimeoutWatcher::new(
            Arc::clone(&task_queue),
            TimeoutWatcherConfig {
                sweep_interval_seconds: config.queue.timeout_sweep_interval_seconds,
            },
        ));

        Ok(Self {
            config,
            task_queue,
            worker_manager,
            timeout_watcher,
        })
    }

    pub fn task_queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.task_queue)
    }

    pub fn worker_manager(&self) -> Arc<WorkerManager> {
        Arc::clone(&self.worker_manager)
    }

    /// 运行应用直到收到关闭信号
    pub async fn run(&self, mode: AppMode, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", mode);

        let run_workers = matches!(mode, AppMode::Worker | AppMode::All) && self.config.worker.enabled;
        let run_sweeper = matches!(mode, AppMode::Sweeper | AppMode::All);

        if run_workers {
            self.worker_manager
                .scale_workers(self.config.worker.workers)
                .await
                .context("启动Worker池失败")?;
        }
        if run_sweeper {
            self.timeout_watcher
                .start()
                .await
                .context("启动超时清扫失败")?;
        }

        if !run_workers && !run_sweeper {
            info!("当前模式下没有启用任何组件");
        }

        let _ = shutdown_rx.recv().await;
        info!("应用收到关闭信号");

        if run_sweeper {
            self.timeout_watcher.stop().await;
        }
        if run_workers {
            self.worker_manager
                .shutdown_all()
                .await
                .context("停止Worker池失败")?;
        }

        info!("应用已停止");
        Ok(())
    }
}
