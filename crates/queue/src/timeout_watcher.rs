use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{error, info};

use agrotask_domain::{QueueError, QueueResult};

use crate::task_queue::TaskQueue;

/// 超时清扫配置
#[derive(Debug, Clone)]
pub struct TimeoutWatcherConfig {
    /// 清扫间隔（秒）
    pub sweep_interval_seconds: u64,
}

impl Default for TimeoutWatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 30,
        }
    }
}

/// 超时清扫循环
///
/// 卡死任务（Worker崩溃在处理器中途）只能靠清扫回收，这是主动拉取的
/// sweep而不是推送通知。清扫本身幂等，多个实例并发运行也是安全的。
pub struct TimeoutWatcher {
    task_queue: Arc<TaskQueue>,
    config: TimeoutWatcherConfig,
    running: Arc<RwLock<bool>>,
    loop_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TimeoutWatcher {
    pub fn new(task_queue: Arc<TaskQueue>, config: TimeoutWatcherConfig) -> Self {
        Self {
            task_queue,
            config,
            running: Arc::new(RwLock::new(false)),
            loop_handle: tokio::sync::Mutex::new(None),
        }
    }

    /// 启动清扫循环
    pub async fn start(&self) -> QueueResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(QueueError::Internal("超时清扫循环已在运行".to_string()));
            }
            *running = true;
        }

        info!(
            "启动超时清扫循环，间隔 {}s",
            self.config.sweep_interval_seconds
        );

        let task_queue = Arc::clone(&self.task_queue);
        let running = Arc::clone(&self.running);
        let interval_duration = Duration::from_secs(self.config.sweep_interval_seconds);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                if !*running.read().await {
                    info!("收到停止信号，退出超时清扫循环");
                    break;
                }

                match task_queue.check_timeouts().await {
                    Ok(transitioned) => {
                        if !transitioned.is_empty() {
                            info!("清扫回收了 {} 个超时任务", transitioned.len());
                        }
                    }
                    Err(e) => {
                        error!("超时清扫失败: {}", e);
                    }
                }
            }
        });

        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    /// 停止清扫循环
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }

        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!("超时清扫循环已停止");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
