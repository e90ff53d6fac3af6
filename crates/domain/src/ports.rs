use async_trait::async_trait;

use crate::entities::{HandlerResult, Task};

/// 任务处理器端口
///
/// 外部协作者边界：收到不透明payload，返回结果或显式失败。重试会以
/// 完全相同的payload再次调用，处理器应尽量幂等。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> HandlerResult;
}
