use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use agrotask_domain::{QueueError, QueueResult, TaskType};

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub queue: QueueSettings,
    pub worker: WorkerPoolSettings,
    /// 任务类型 -> 处理器HTTP回调地址
    pub handlers: HashMap<String, String>,
    pub observability: ObservabilityConfig,
}

/// 存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreBackend {
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "redis")]
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// 键命名空间前缀，一个Redis实例可承载多套隔离部署
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "agrotask".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// 指数退避基础间隔（秒）
    pub retry_base_delay_seconds: u64,
    /// 退避间隔上限（秒）
    pub retry_max_delay_seconds: u64,
    /// 默认最大重试次数
    pub default_max_retries: u32,
    /// 超时清扫间隔（秒）
    pub timeout_sweep_interval_seconds: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            retry_base_delay_seconds: 60,
            retry_max_delay_seconds: 3600,
            default_max_retries: 3,
            timeout_sweep_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolSettings {
    pub enabled: bool,
    /// Worker轮询循环数量
    pub workers: usize,
    /// 每个Worker的最大并发处理数
    pub max_concurrent_tasks: usize,
    pub poll_interval_ms: u64,
    /// 允许处理的任务类型；None表示全部
    pub task_types: Option<Vec<String>>,
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            max_concurrent_tasks: 4,
            poll_interval_ms: 1000,
            task_types: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// 加载配置
    ///
    /// 优先级：环境变量（AGROTASK_前缀，__分隔嵌套键）> 配置文件 > 默认值。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/agrotask.toml", "agrotask.toml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("AGROTASK")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("解析配置失败")?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("配置验证失败: {e}"))?;

        Ok(config)
    }

    /// 配置验证，启动期一次性拒绝无效配置
    pub fn validate(&self) -> QueueResult<()> {
        if self.worker.workers == 0 && self.worker.enabled {
            return Err(QueueError::config_error("worker.workers 必须大于0"));
        }
        if self.worker.max_concurrent_tasks == 0 {
            return Err(QueueError::config_error(
                "worker.max_concurrent_tasks 必须大于0",
            ));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(QueueError::config_error("worker.poll_interval_ms 必须大于0"));
        }
        if self.queue.timeout_sweep_interval_seconds == 0 {
            return Err(QueueError::config_error(
                "queue.timeout_sweep_interval_seconds 必须大于0",
            ));
        }
        if self.queue.retry_max_delay_seconds < self.queue.retry_base_delay_seconds {
            return Err(QueueError::config_error(
                "queue.retry_max_delay_seconds 不能小于 retry_base_delay_seconds",
            ));
        }
        if self.store.key_prefix.is_empty() {
            return Err(QueueError::config_error("store.key_prefix 不能为空"));
        }

        self.worker_task_types()?;
        self.handler_endpoints()?;
        Ok(())
    }

    /// 解析Worker任务类型allow-list
    pub fn worker_task_types(&self) -> QueueResult<Option<Vec<TaskType>>> {
        match &self.worker.task_types {
            None => Ok(None),
            Some(names) => {
                let mut types = Vec::with_capacity(names.len());
                for name in names {
                    types.push(TaskType::from_str(name)?);
                }
                Ok(Some(types))
            }
        }
    }

    /// 解析处理器回调表
    pub fn handler_endpoints(&self) -> QueueResult<Vec<(TaskType, String)>> {
        let mut endpoints = Vec::with_capacity(self.handlers.len());
        for (name, url) in &self.handlers {
            let task_type = TaskType::from_str(name)?;
            if url.is_empty() {
                return Err(QueueError::config_error(format!(
                    "处理器 {name} 的回调地址不能为空"
                )));
            }
            endpoints.push((task_type, url.clone()));
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.queue.default_max_retries, 3);
        assert_eq!(config.worker.workers, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[store]
backend = "redis"
redis_url = "redis://queue-host:6379"
key_prefix = "farm_a"

[queue]
retry_base_delay_seconds = 5

[worker]
workers = 4
task_types = ["ndvi_calculation", "disease_detection"]

[handlers]
ndvi_calculation = "http://imaging:8000/ndvi"
disease_detection = "http://imaging:8000/disease"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.key_prefix, "farm_a");
        assert_eq!(config.queue.retry_base_delay_seconds, 5);
        assert_eq!(config.worker.workers, 4);

        let types = config.worker_task_types().unwrap().unwrap();
        assert_eq!(
            types,
            vec![TaskType::NdviCalculation, TaskType::DiseaseDetection]
        );
        assert_eq!(config.handler_endpoints().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_file_is_rejected() {
        assert!(AppConfig::load(Some("/no/such/agrotask.toml")).is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = AppConfig::default();
        config.worker.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.worker.task_types = Some(vec!["quantum_farming".to_string()]);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.queue.retry_max_delay_seconds = 1;
        config.queue.retry_base_delay_seconds = 60;
        assert!(config.validate().is_err());
    }
}
