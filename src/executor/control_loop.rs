//! 控制循环接口
//!
//! 决定「下一步做什么」的推理逻辑（LLM 或规则）在执行器之外实现；执行器只驱动它：
//! 每一步把当前状态交给 `next_step`，按返回的 `LoopStep` 记录进度、调用工具或结束任务。
//! 工具调用由执行器发起，从而在每次调用前检查取消。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::LoopError;
use crate::store::{Message, Task, Thread};
use crate::tools::ToolDefinition;

/// 一次工具调用请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }
}

/// 工具调用的观察结果
///
/// `result` 为结构化值：成功 `{status: "ok", cached, data}`，失败 `{status: "error", kind, detail}`。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub tool: String,
    pub args: Value,
    pub result: Value,
}

impl Observation {
    pub fn is_ok(&self) -> bool {
        self.result.get("status").and_then(|s| s.as_str()) == Some("ok")
    }

    pub fn data(&self) -> Option<&Value> {
        self.result.get("data")
    }
}

/// 控制循环的下一步
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStep {
    /// 叙述性进度
    Progress(String),
    /// 依次调用这些工具
    CallTools(Vec<ToolCall>),
    /// 结束并给出结果
    Finish {
        result: String,
        action_items: Vec<String>,
    },
}

/// 每步交给控制循环的状态
#[derive(Debug, Clone)]
pub struct LoopState {
    pub task_id: String,
    pub thread_id: String,
    /// 触发本任务的用户消息
    pub input: String,
    pub messages: Vec<Message>,
    pub context: Map<String, Value>,
    pub tools: Vec<ToolDefinition>,
    pub observations: Vec<Observation>,
    /// 当前是第几步（从 1 开始）
    pub iteration: usize,
}

impl LoopState {
    pub fn new(task: &Task, thread: &Thread, tools: Vec<ToolDefinition>) -> Self {
        let mut context = thread.context.clone();
        if let Value::Object(input_context) = &task.input_context {
            context.extend(input_context.clone());
        }
        Self {
            task_id: task.id.clone(),
            thread_id: thread.id.clone(),
            input: thread
                .last_user_message()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
            messages: thread.messages.clone(),
            context,
            tools,
            observations: Vec::new(),
            iteration: 0,
        }
    }
}

/// 外部控制循环
#[async_trait]
pub trait ControlLoop: Send + Sync {
    async fn next_step(&self, state: &LoopState) -> Result<LoopStep, LoopError>;
}
