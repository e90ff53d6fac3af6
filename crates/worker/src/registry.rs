use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use agrotask_domain::{QueueError, QueueResult, TaskHandler, TaskType};

/// 处理器注册表
///
/// 任务类型到处理器的静态映射。Worker启动时整体校验：配置为可轮询的
/// 类型缺少处理器是致命配置错误，而不是留到运行期逐任务爆出。
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，重复注册以后者为准
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        if self.handlers.insert(task_type, handler).is_some() {
            warn!("任务类型 {} 的处理器被覆盖注册", task_type);
        } else {
            info!("注册任务处理器: {}", task_type);
        }
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// 校验给定类型集合全部有处理器，缺口一次性报出
    pub fn validate_for(&self, types: &[TaskType]) -> QueueResult<()> {
        let missing: Vec<&str> = types
            .iter()
            .filter(|t| !self.handlers.contains_key(t))
            .map(|t| t.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Configuration(format!(
                "以下任务类型没有注册处理器: {}",
                missing.join(", ")
            )))
        }
    }
}
