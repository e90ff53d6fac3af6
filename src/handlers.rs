use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use agrotask_config::AppConfig;
use agrotask_domain::{HandlerFailure, HandlerResult, QueueResult, Task, TaskHandler};
use agrotask_worker::HandlerRegistry;

/// HTTP回调处理器
///
/// 具体的任务处理逻辑（影像处理、NDVI计算、病害检测等）运行在各自的
/// 服务里，这里只做委托：把payload POST到该类型配置的端点，按HTTP
/// 语义映射失败类别——5xx和传输错误可重试，4xx说明payload本身有问题，
/// 重试也不会变好。
pub struct HttpCallbackHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCallbackHandler {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl TaskHandler for HttpCallbackHandler {
    async fn handle(&self, task: &Task) -> HandlerResult {
        debug!(
            "回调处理器请求: task_id={}, endpoint={}",
            task.id, self.endpoint
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&task.payload)
            .header("x-agrotask-id", &task.id)
            .header("x-agrotask-attempt", (task.attempts + 1).to_string())
            .timeout(Duration::from_secs(task.timeout_seconds))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return Err(HandlerFailure::retryable(format!(
                    "回调请求失败: {e}"
                )));
            }
        };

        let status = response.status();
        if status.is_success() {
            // 非JSON响应体按原样包一层返回
            match response.json::<serde_json::Value>().await {
                Ok(body) => Ok(body),
                Err(_) => Ok(serde_json::json!({"status": status.as_u16()})),
            }
        } else if status.is_client_error() {
            Err(HandlerFailure::fatal(format!(
                "回调端点拒绝payload: HTTP {status}"
            )))
        } else {
            Err(HandlerFailure::retryable(format!(
                "回调端点异常: HTTP {status}"
            )))
        }
    }
}

/// 按配置的处理器回调表构建注册表
pub fn build_registry(config: &AppConfig) -> QueueResult<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    for (task_type, endpoint) in config.handler_endpoints()? {
        info!("任务类型 {} 委托到 {}", task_type, endpoint);
        registry.register(task_type, Arc::new(HttpCallbackHandler::new(endpoint)));
    }
    Ok(registry)
}
