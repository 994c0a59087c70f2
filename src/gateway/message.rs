//! 网关消息协议定义
//!
//! 统一的消息格式，客户端与网关之间都以 JSON 文本帧交换 `GatewayMessage`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::service::{SubmitReceipt, TaskStatusView};
use crate::store::{TaskPriority, TaskStatus};
use crate::update_log::{LogEntry, ThreadSnapshot, Update, UpdateType};

/// 消息类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// 订阅线程；带 cursor 时尝试从该位置续读
    Subscribe {
        thread_id: String,
        #[serde(default)]
        cursor: Option<u64>,
    },

    /// 提交任务
    SubmitTask {
        #[serde(default)]
        thread_id: Option<String>,
        message: String,
        #[serde(default)]
        context: Option<Map<String, Value>>,
        #[serde(default)]
        priority: Option<TaskPriority>,
        #[serde(default)]
        tags: Vec<String>,
    },

    /// 在已有线程上续写
    ContinueThread {
        thread_id: String,
        message: String,
        #[serde(default)]
        context: Option<Map<String, Value>>,
    },

    /// 查询任务状态
    GetTaskStatus {
        task_id: String,
    },

    /// 取消任务
    CancelTask {
        task_id: String,
    },

    /// 心跳 ping
    Ping {
        timestamp: u64,
    },

    /// 订阅后的第一条消息：快照及其后的 cursor
    InitialState {
        snapshot: ThreadSnapshot,
    },

    /// 任务状态变化
    StatusChange {
        seq: u64,
        status: Option<TaskStatus>,
        update: Update,
    },

    /// 进度、工具调用与错误等过程更新
    ThreadUpdate {
        seq: u64,
        update: Update,
    },

    /// 最终结果
    ResultSet {
        seq: u64,
        result: Option<String>,
        update: Update,
    },

    /// 服务端心跳，携带订阅当前 cursor
    Heartbeat {
        thread_id: String,
        cursor: u64,
    },

    /// 任务提交结果
    TaskSubmitted {
        receipt: SubmitReceipt,
    },

    /// 任务状态响应
    TaskStatus {
        view: TaskStatusView,
    },

    /// 取消请求已受理
    CancelAcknowledged {
        task_id: String,
        status: TaskStatus,
    },

    /// 错误
    Error {
        request_id: Option<String>,
        code: String,
        message: String,
    },

    /// 心跳 pong
    Pong {
        timestamp: u64,
    },
}

/// 网关消息（带元信息的完整消息）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// 消息 ID
    #[serde(default = "new_message_id")]
    pub id: String,
    /// 所属线程
    #[serde(default)]
    pub thread_id: Option<String>,
    /// 消息内容
    pub message: MessageType,
    /// 时间戳（毫秒）
    #[serde(default)]
    pub timestamp: u64,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl GatewayMessage {
    pub fn new(thread_id: Option<String>, message: MessageType) -> Self {
        Self {
            id: new_message_id(),
            thread_id,
            message,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::new(
            None,
            MessageType::Error {
                request_id: None,
                code: code.to_string(),
                message: message.to_string(),
            },
        )
    }

    /// 针对某条请求的错误回复
    pub fn reply_error(request_id: &str, code: &str, message: &str) -> Self {
        Self::new(
            None,
            MessageType::Error {
                request_id: Some(request_id.to_string()),
                code: code.to_string(),
                message: message.to_string(),
            },
        )
    }

    pub fn pong(timestamp: u64) -> Self {
        Self::new(None, MessageType::Pong { timestamp })
    }

    pub fn initial_state(snapshot: ThreadSnapshot) -> Self {
        Self::new(
            Some(snapshot.thread_id.clone()),
            MessageType::InitialState { snapshot },
        )
    }

    pub fn heartbeat(thread_id: &str, cursor: u64) -> Self {
        Self::new(
            Some(thread_id.to_string()),
            MessageType::Heartbeat {
                thread_id: thread_id.to_string(),
                cursor,
            },
        )
    }

    /// 把日志条目转成对应的推送消息
    pub fn from_entry(entry: LogEntry) -> Self {
        let LogEntry {
            seq,
            thread_id,
            update,
        } = entry;
        let message = match update.update_type {
            UpdateType::StatusChange => MessageType::StatusChange {
                seq,
                status: update.status(),
                update,
            },
            UpdateType::ResultSet => MessageType::ResultSet {
                seq,
                result: update.message.clone(),
                update,
            },
            _ => MessageType::ThreadUpdate { seq, update },
        };
        Self::new(Some(thread_id), message)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_defaults() {
        let msg: GatewayMessage = serde_json::from_value(json!({
            "message": {"type": "subscribe", "thread_id": "thread_1"}
        }))
        .unwrap();
        assert!(!msg.id.is_empty());
        assert_eq!(
            msg.message,
            MessageType::Subscribe {
                thread_id: "thread_1".into(),
                cursor: None
            }
        );
    }

    #[test]
    fn test_entry_mapping() {
        let entry = |update: Update| LogEntry {
            seq: 7,
            thread_id: "thread_1".into(),
            update,
        };

        let msg = GatewayMessage::from_entry(entry(Update::status_change("task_1", TaskStatus::Done)));
        assert!(matches!(
            msg.message,
            MessageType::StatusChange { seq: 7, status: Some(TaskStatus::Done), .. }
        ));

        let msg = GatewayMessage::from_entry(entry(Update::result_set("task_1", "all good")));
        assert!(matches!(msg.message, MessageType::ResultSet { ref result, .. } if result.as_deref() == Some("all good")));

        let msg = GatewayMessage::from_entry(entry(Update::progress("task_1", "working")));
        assert!(matches!(msg.message, MessageType::ThreadUpdate { .. }));
        assert_eq!(msg.thread_id.as_deref(), Some("thread_1"));

        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["message"]["type"], "thread_update");
    }
}
