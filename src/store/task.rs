//! 任务记录与状态机

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 任务 ID
pub type TaskId = String;

/// 任务状态
///
/// queued → in_progress → {done, failed, cancelled}；终态不可再迁移。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待领取
    Queued,
    /// 正被某个工作者执行
    InProgress,
    /// 已完成
    Done,
    /// 执行失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// 任务优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn from_i64(v: i64) -> Self {
        match v {
            0 => TaskPriority::Low,
            2 => TaskPriority::High,
            3 => TaskPriority::Urgent,
            _ => TaskPriority::Normal,
        }
    }
}

/// 任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub thread_id: String,
    pub status: TaskStatus,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    pub updated_at: i64,
    pub priority: TaskPriority,
    pub tags: Vec<String>,
    pub requester_id: Option<String>,
    /// 提交时附带的上下文
    pub input_context: Value,
    /// 执行中收到的取消请求，由执行者在边界处协作检查
    pub cancel_requested: bool,
    /// 当前持有者的租约；仅持有该租约的执行者可以写终态
    pub lease_id: Option<String>,
    /// 被领取的次数（租约过期重新领取时递增）
    pub attempts: u32,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

impl Task {
    pub fn new(thread_id: impl Into<String>, request: &NewTask) -> Self {
        let now = now_millis();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            thread_id: thread_id.into(),
            status: TaskStatus::Queued,
            created_at: now,
            updated_at: now,
            priority: request.priority,
            tags: request.tags.clone(),
            requester_id: request.requester_id.clone(),
            input_context: Value::Object(request.context.clone()),
            cancel_requested: false,
            lease_id: None,
            attempts: 0,
            result: None,
            error_message: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 新任务的提交参数
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub thread_id: String,
    pub message: String,
    pub context: Map<String, Value>,
    pub priority: TaskPriority,
    pub tags: Vec<String>,
    pub requester_id: Option<String>,
}

/// 执行结束时的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Done {
        result: String,
        action_items: Vec<String>,
    },
    Failed(String),
    Cancelled,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Done { .. } => TaskStatus::Done,
            TaskOutcome::Failed(_) => TaskStatus::Failed,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// 领取结果
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// 已标记为 in_progress，租约属于调用者
    Claimed(Task),
    /// 任务已处于终态（例如排队期间被取消），调用者应直接确认并丢弃
    Skip(TaskStatus),
}

pub(crate) const CANCELLED_MESSAGE: &str = "Task cancelled";

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
