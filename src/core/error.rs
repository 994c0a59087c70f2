//! 错误类型
//!
//! 按边界划分：工具调用（ToolError）、任务/线程存储（StoreError）、对外接口（ServiceError）、
//! 外部控制循环（LoopError）。工具错误在路由边界被捕获并以结构化结果交回控制循环，不会终止进程。

use thiserror::Error;

/// 工具调用错误
///
/// NotFound / InvalidArguments 属于「请求本身无效」，Provider / Timeout 属于「后端失败」，
/// 调用方可通过 `is_request_error` 区分。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool {tool} failed: {detail}")]
    Provider { tool: String, detail: String },

    #[error("Tool {tool} timed out after {attempts} attempt(s)")]
    Timeout { tool: String, attempts: u32 },

    /// 注册期配置错误（名称冲突、非法名称等）
    #[error("Tool configuration error: {0}")]
    Configuration(String),

    #[error("Provider {provider} could not be acquired: {detail}")]
    Acquire { provider: String, detail: String },
}

impl ToolError {
    pub fn is_request_error(&self) -> bool {
        matches!(self, ToolError::NotFound(_) | ToolError::InvalidArguments { .. })
    }

    /// 结构化结果中的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "tool_not_found",
            ToolError::InvalidArguments { .. } => "invalid_arguments",
            ToolError::Provider { .. } => "provider_error",
            ToolError::Timeout { .. } => "timeout",
            ToolError::Configuration(_) => "configuration",
            ToolError::Acquire { .. } => "acquire_failed",
        }
    }
}

/// 任务/线程存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    /// 线程上已有未结束的任务，或任务已处于终态
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// 租约已过期并被其他工作者接管
    #[error("Lease lost for task {0}")]
    LeaseLost(String),

    #[error("Database error: {0}")]
    Database(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Database(format!("serialization: {e}"))
    }
}

/// 对外接口（提交、查询、取消、续写）错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl ServiceError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ServiceError::Conflict(_))
    }

    /// 网关错误消息中的 code 字段
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::TaskNotFound(_) => "task_not_found",
            ServiceError::ThreadNotFound(_) => "thread_not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::Store(_) => "store_error",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TaskNotFound(id) => ServiceError::TaskNotFound(id),
            StoreError::ThreadNotFound(id) => ServiceError::ThreadNotFound(id),
            StoreError::Conflict(msg) => ServiceError::Conflict(msg),
            other => ServiceError::Store(other),
        }
    }
}

/// 外部控制循环可上报的错误；任一错误都会使任务进入 failed
#[derive(Error, Debug, Clone)]
pub enum LoopError {
    #[error("Control loop failed: {0}")]
    Fatal(String),

    #[error("LLM error: {0}")]
    Llm(String),
}
