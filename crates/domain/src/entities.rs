use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::QueueError;

/// 任务类型
///
/// 部署期固定的封闭集合。每个类型携带约定的默认优先级和默认超时时间，
/// 入队时可以按需覆盖。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskType {
    #[serde(rename = "satellite_image_processing")]
    SatelliteImageProcessing,
    #[serde(rename = "ndvi_calculation")]
    NdviCalculation,
    #[serde(rename = "disease_detection")]
    DiseaseDetection,
    #[serde(rename = "report_generation")]
    ReportGeneration,
    #[serde(rename = "notification_send")]
    NotificationSend,
    #[serde(rename = "data_export")]
    DataExport,
    #[serde(rename = "model_inference")]
    ModelInference,
}

impl TaskType {
    /// 全部任务类型
    pub const ALL: [TaskType; 7] = [
        TaskType::SatelliteImageProcessing,
        TaskType::NdviCalculation,
        TaskType::DiseaseDetection,
        TaskType::ReportGeneration,
        TaskType::NotificationSend,
        TaskType::DataExport,
        TaskType::ModelInference,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SatelliteImageProcessing => "satellite_image_processing",
            TaskType::NdviCalculation => "ndvi_calculation",
            TaskType::DiseaseDetection => "disease_detection",
            TaskType::ReportGeneration => "report_generation",
            TaskType::NotificationSend => "notification_send",
            TaskType::DataExport => "data_export",
            TaskType::ModelInference => "model_inference",
        }
    }

    /// 约定的默认优先级（1-10）
    pub fn default_priority(&self) -> u8 {
        match self {
            TaskType::SatelliteImageProcessing => 5,
            TaskType::NdviCalculation => 5,
            TaskType::DiseaseDetection => 8,
            TaskType::ReportGeneration => 3,
            TaskType::NotificationSend => 8,
            TaskType::DataExport => 3,
            TaskType::ModelInference => 5,
        }
    }

    /// 约定的默认超时时间（秒）
    pub fn default_timeout_seconds(&self) -> u64 {
        match self {
            TaskType::SatelliteImageProcessing => 600,
            TaskType::NdviCalculation => 120,
            TaskType::DiseaseDetection => 120,
            TaskType::ReportGeneration => 180,
            TaskType::NotificationSend => 30,
            TaskType::DataExport => 180,
            TaskType::ModelInference => 300,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "satellite_image_processing" => Ok(TaskType::SatelliteImageProcessing),
            "ndvi_calculation" => Ok(TaskType::NdviCalculation),
            "disease_detection" => Ok(TaskType::DiseaseDetection),
            "report_generation" => Ok(TaskType::ReportGeneration),
            "notification_send" => Ok(TaskType::NotificationSend),
            "data_export" => Ok(TaskType::DataExport),
            "model_inference" => Ok(TaskType::ModelInference),
            _ => Err(QueueError::Validation(format!("未知的任务类型: {s}"))),
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    /// 终态不再参与任何状态迁移
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务记录
///
/// 队列的核心实体。所有权威状态都保存在Queue Store中，进程内持有的Task
/// 只是一次读取的快照。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    /// 优先级 1（低）- 10（紧急）
    pub priority: u8,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// 已失败的执行次数，活跃期间满足 attempts <= max_retries
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    /// 到达该时刻后任务才对Worker可见
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
    /// 仅在PROCESSING期间持有，其余状态必须为空（独占不变式）
    pub worker_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        task_type: TaskType,
        payload: serde_json::Value,
        priority: u8,
        scheduled_at: Option<DateTime<Utc>>,
        timeout_seconds: u64,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            priority,
            payload,
            status: TaskStatus::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            scheduled_at: scheduled_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            timeout_seconds,
            worker_id: None,
            result: None,
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Processing)
    }

    /// PROCESSING任务是否已超过其超时预算
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (TaskStatus::Processing, Some(started)) => {
                (now - started).num_milliseconds() > (self.timeout_seconds as i64) * 1000
            }
            _ => false,
        }
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 '{}' (类型: {}, 优先级: {})",
            self.id, self.task_type, self.priority
        )
    }
}

/// 结算操作的CAS期望值
///
/// complete/fail必须携带声明时观察到的worker_id和attempts，两者任一不匹配
/// 说明声明已经易主（例如超时清扫先行一步），结算方收到ClaimLost而不是
/// 覆盖别人的状态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskClaim {
    pub worker_id: String,
    pub attempts: u32,
}

impl TaskClaim {
    pub fn of(task: &Task) -> Self {
        Self {
            worker_id: task.worker_id.clone().unwrap_or_default(),
            attempts: task.attempts,
        }
    }
}

/// 处理器失败
///
/// 处理器的结果是显式的Result值而不是异常控制流；retryable=false的失败
/// 直接进入死信队列，不消耗剩余重试预算。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub message: String,
    pub retryable: bool,
}

impl HandlerFailure {
    pub fn retryable<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// 处理器返回值
pub type HandlerResult = Result<serde_json::Value, HandlerFailure>;

/// 失败结算的去向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// 已按退避时间重新调度
    Retried { scheduled_at: DateTime<Utc> },
    /// 重试预算耗尽或不可重试，已进入死信队列
    DeadLettered,
}

/// 队列状态聚合
///
/// 逐字段各自正确的时点快照，字段之间不保证事务一致。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    /// 当前可被声明的待处理任务数
    pub total_pending: u64,
    /// 延迟集合中尚未到期的任务数
    pub scheduled: u64,
    pub processing: u64,
    /// 累计完成数
    pub completed: u64,
    /// 累计失败执行次数
    pub failed: u64,
    pub dlq_size: u64,
}

/// Worker状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStatus {
    #[serde(rename = "ALIVE")]
    Alive,
    #[serde(rename = "STOPPED")]
    Stopped,
}

/// Worker注册信息
///
/// 保存在store的worker注册表中，只是可丢弃的本地身份缓存，重启后重建。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub hostname: String,
    /// 空表示接受全部任务类型
    pub supported_task_types: Vec<TaskType>,
    pub max_concurrent_tasks: usize,
    pub current_task_count: usize,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(
        id: String,
        hostname: String,
        supported_task_types: Vec<TaskType>,
        max_concurrent_tasks: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            hostname,
            supported_task_types,
            max_concurrent_tasks,
            current_task_count: 0,
            status: WorkerStatus::Alive,
            registered_at: now,
            last_seen_at: now,
        }
    }

    pub fn accepts(&self, task_type: TaskType) -> bool {
        self.supported_task_types.is_empty() || self.supported_task_types.contains(&task_type)
    }
}

/// 死信队列分页结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterPage {
    pub tasks: Vec<Task>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_type_roundtrip() {
        for task_type in TaskType::ALL {
            let parsed: TaskType = task_type.as_str().parse().unwrap();
            assert_eq!(parsed, task_type);
        }
        assert!("image_magic".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_task_type_defaults_table() {
        assert_eq!(TaskType::SatelliteImageProcessing.default_priority(), 5);
        assert_eq!(TaskType::SatelliteImageProcessing.default_timeout_seconds(), 600);
        assert_eq!(TaskType::NotificationSend.default_priority(), 8);
        assert_eq!(TaskType::NotificationSend.default_timeout_seconds(), 30);
        assert_eq!(TaskType::ReportGeneration.default_priority(), 3);
        assert_eq!(TaskType::ModelInference.default_timeout_seconds(), 300);
    }

    #[test]
    fn test_status_wire_names() {
        let s = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(s, "\"PROCESSING\"");
        let back: TaskStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(back, TaskStatus::Cancelled);
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new(
            TaskType::NdviCalculation,
            json!({"field_id": 42}),
            5,
            None,
            120,
            3,
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.worker_id.is_none());
        assert_eq!(task.scheduled_at, task.created_at);
        assert!(task.is_active());
    }

    #[test]
    fn test_task_json_roundtrip_without_optional_fields() {
        let task = Task::new(TaskType::DataExport, json!({}), 3, None, 180, 3);
        let raw = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.task_type, TaskType::DataExport);
        assert!(back.started_at.is_none());
    }

    #[test]
    fn test_is_timed_out() {
        let mut task = Task::new(TaskType::NotificationSend, json!({}), 8, None, 30, 3);
        let now = Utc::now();
        assert!(!task.is_timed_out(now));

        task.status = TaskStatus::Processing;
        task.started_at = Some(now - chrono::Duration::seconds(31));
        assert!(task.is_timed_out(now));

        task.started_at = Some(now - chrono::Duration::seconds(10));
        assert!(!task.is_timed_out(now));
    }

    #[test]
    fn test_worker_info_accepts() {
        let all = WorkerInfo::new("w-1".into(), "host".into(), vec![], 4);
        assert!(all.accepts(TaskType::DataExport));

        let limited = WorkerInfo::new(
            "w-2".into(),
            "host".into(),
            vec![TaskType::NotificationSend],
            4,
        );
        assert!(limited.accepts(TaskType::NotificationSend));
        assert!(!limited.accepts(TaskType::DataExport));
    }
}
