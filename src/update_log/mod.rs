//! 线程更新日志
//!
//! 每个线程一份只追加的有序日志，位置从 1 开始单调递增；cursor 表示「下一个要读的位置」。
//! 读者各自持有 cursor，互不影响。日志按时间窗口与条数上限保留，超出保留的 cursor 读取时带 truncated 标记。
//!
//! 每个线程另有一把提交锁：存储中对快照可见的变更（创建任务、领取、取消、终态）与对应的日志追加
//! 在同一把锁内完成，快照也在这把锁内读取，因此快照总是对应日志的某个已提交前缀。
//! 锁只按线程划分，不同线程之间互不阻塞。

pub mod tail;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::config::UpdateLogSection;
use crate::core::StoreError;
use crate::store::{Message, TaskStatus, TaskStore};

pub use tail::LogTail;

/// 更新类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    StatusChange,
    Progress,
    ToolStart,
    ToolComplete,
    ResultSet,
    Error,
}

/// 一条进度事件，追加后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// 毫秒时间戳
    pub timestamp: i64,
    pub update_type: UpdateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Update {
    pub fn new(update_type: UpdateType, task_id: &str, message: Option<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            update_type,
            message,
            metadata: Some(json!({ "task_id": task_id })),
        }
    }

    /// 合并额外的元数据字段
    pub fn with_fields(mut self, fields: Value) -> Self {
        if let (Some(Value::Object(meta)), Value::Object(extra)) = (self.metadata.as_mut(), fields) {
            meta.extend(extra);
        }
        self
    }

    pub fn status_change(task_id: &str, status: TaskStatus) -> Self {
        Self::new(UpdateType::StatusChange, task_id, Some(status.to_string()))
            .with_fields(json!({ "status": status }))
    }

    pub fn progress(task_id: &str, text: impl Into<String>) -> Self {
        Self::new(UpdateType::Progress, task_id, Some(text.into()))
    }

    pub fn tool_start(task_id: &str, tool: &str, args: &Value) -> Self {
        Self::new(UpdateType::ToolStart, task_id, Some(format!("Calling {tool}")))
            .with_fields(json!({ "tool": tool, "args": args }))
    }

    pub fn tool_complete(task_id: &str, tool: &str, observation: &Value) -> Self {
        let ok = observation.get("status").and_then(|s| s.as_str()) == Some("ok");
        Self::new(
            UpdateType::ToolComplete,
            task_id,
            Some(format!("{tool} {}", if ok { "completed" } else { "failed" })),
        )
        .with_fields(json!({ "tool": tool, "ok": ok, "observation": observation }))
    }

    pub fn result_set(task_id: &str, result: &str) -> Self {
        Self::new(UpdateType::ResultSet, task_id, Some(result.to_string()))
    }

    pub fn error(task_id: &str, error: &str) -> Self {
        Self::new(UpdateType::Error, task_id, Some(error.to_string()))
    }

    /// 该更新所属的任务
    pub fn task_id(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("task_id")?.as_str()
    }

    /// status_change 携带的新状态
    pub fn status(&self) -> Option<TaskStatus> {
        let raw = self.metadata.as_ref()?.get("status")?.clone();
        serde_json::from_value(raw).ok()
    }
}

/// 日志中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub thread_id: String,
    pub update: Update,
}

/// 一次读取的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBatch {
    pub entries: Vec<LogEntry>,
    /// 下一次读取应使用的 cursor
    pub next_cursor: u64,
    /// cursor 已落在保留窗口之外（或来自已被清理的旧日志），中间有缺口
    pub truncated: bool,
}

/// 某个已提交前缀处的线程快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub thread_id: String,
    pub task_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub messages: Vec<Message>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub action_items: Vec<String>,
    /// 快照之后从这里开始读，不重不漏
    pub cursor: u64,
}

struct Ring {
    entries: VecDeque<(Instant, LogEntry)>,
    next_seq: u64,
    touched: Instant,
}

impl Ring {
    fn first_seq(&self) -> u64 {
        self.entries.front().map_or(self.next_seq, |(_, e)| e.seq)
    }

    fn trim(&mut self, retention: Duration, max_entries: usize) -> usize {
        let now = Instant::now();
        let mut dropped = 0;
        while let Some(at) = self.entries.front().map(|(at, _)| *at) {
            if self.entries.len() > max_entries || now.duration_since(at) > retention {
                self.entries.pop_front();
                dropped += 1;
            } else {
                break;
            }
        }
        dropped
    }

    fn read_from(&self, cursor: u64) -> ReadBatch {
        let first = self.first_seq();
        let truncated = cursor < first || cursor > self.next_seq;
        let start = if truncated { first } else { cursor };
        let entries = self
            .entries
            .iter()
            .skip((start - first) as usize)
            .map(|(_, e)| e.clone())
            .collect();
        ReadBatch {
            entries,
            next_cursor: self.next_seq,
            truncated,
        }
    }
}

pub(crate) struct ThreadLog {
    thread_id: String,
    commit: Arc<Mutex<()>>,
    ring: RwLock<Ring>,
    /// 广播当前的 next_seq；订阅者据此被唤醒
    head: watch::Sender<u64>,
}

impl ThreadLog {
    fn new(thread_id: &str, next_seq: u64) -> Self {
        let (head, _) = watch::channel(next_seq);
        Self {
            thread_id: thread_id.to_string(),
            commit: Arc::new(Mutex::new(())),
            ring: RwLock::new(Ring {
                entries: VecDeque::new(),
                next_seq,
                touched: Instant::now(),
            }),
            head,
        }
    }

    fn ring(&self) -> std::sync::RwLockReadGuard<'_, Ring> {
        self.ring.read().unwrap_or_else(|e| e.into_inner())
    }

    fn ring_mut(&self) -> std::sync::RwLockWriteGuard<'_, Ring> {
        self.ring.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn read_from(&self, cursor: u64) -> ReadBatch {
        self.ring().read_from(cursor)
    }

    pub(crate) fn head(&self) -> u64 {
        self.ring().next_seq
    }

    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.head.subscribe()
    }

    pub(crate) fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

/// 多线程更新日志
pub struct UpdateLog {
    logs: RwLock<HashMap<String, Arc<ThreadLog>>>,
    /// 已清理线程日志的 next_seq；同一线程重建日志时从这里续号，旧 cursor 不会指向新条目
    retired: std::sync::Mutex<HashMap<String, u64>>,
    retention: Duration,
    max_entries: usize,
}

impl UpdateLog {
    pub fn new(config: &UpdateLogSection) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            retired: std::sync::Mutex::new(HashMap::new()),
            retention: Duration::from_secs(config.retention_secs),
            max_entries: config.max_entries_per_thread.max(1),
        }
    }

    fn log_for(&self, thread_id: &str) -> Arc<ThreadLog> {
        if let Some(log) = self
            .logs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(thread_id)
        {
            return Arc::clone(log);
        }
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(logs.entry(thread_id.to_string()).or_insert_with(|| {
            let next_seq = self.retired_lock().remove(thread_id).unwrap_or(1);
            Arc::new(ThreadLog::new(thread_id, next_seq))
        }))
    }

    fn retired_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.retired.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 获取线程提交锁；持有期间的存储变更与日志追加对快照是原子的
    pub async fn lock_thread(&self, thread_id: &str) -> ThreadWriter {
        let log = self.log_for(thread_id);
        let guard = Arc::clone(&log.commit).lock_owned().await;
        ThreadWriter {
            log,
            retention: self.retention,
            max_entries: self.max_entries,
            _guard: guard,
        }
    }

    /// 追加一条更新，返回分配的位置
    pub async fn append(&self, thread_id: &str, update: Update) -> LogEntry {
        self.lock_thread(thread_id).await.append(update)
    }

    /// 从 cursor 开始读取当前已提交的全部条目
    pub fn read_from(&self, thread_id: &str, cursor: u64) -> ReadBatch {
        self.log_for(thread_id).read_from(cursor)
    }

    /// 下一个将被分配的位置
    pub fn head(&self, thread_id: &str) -> u64 {
        self.log_for(thread_id).head()
    }

    /// 从 cursor 开始跟随日志
    pub fn subscribe(&self, thread_id: &str, cursor: u64) -> LogTail {
        LogTail::new(self.log_for(thread_id), cursor)
    }

    /// 读取线程快照及其对应的 cursor；线程不存在时返回 None
    pub async fn snapshot(
        &self,
        store: &dyn TaskStore,
        thread_id: &str,
    ) -> Result<Option<ThreadSnapshot>, StoreError> {
        let writer = self.lock_thread(thread_id).await;
        let Some(thread) = store.get_thread(thread_id).await? else {
            return Ok(None);
        };
        let task = match &thread.current_task_id {
            Some(id) => store.get_task(id).await?,
            None => None,
        };
        Ok(Some(ThreadSnapshot {
            thread_id: thread.id,
            task_id: task.as_ref().map(|t| t.id.clone()),
            status: task.as_ref().map(|t| t.status),
            messages: thread.messages,
            result: thread.result,
            error_message: thread.error_message,
            action_items: thread.action_items,
            cursor: writer.cursor(),
        }))
    }

    /// 按保留窗口清理：丢弃过期条目，并移除空闲且无人订阅的线程日志。返回丢弃的条目数
    pub fn purge_expired(&self) -> usize {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        let mut retired = self.retired_lock();
        let mut dropped = 0;
        logs.retain(|thread_id, log| {
            let mut ring = log.ring_mut();
            dropped += ring.trim(self.retention, self.max_entries);
            let idle = ring.entries.is_empty() && ring.touched.elapsed() > self.retention;
            // 仍被写入句柄或订阅者引用的日志保留
            let in_use = Arc::strong_count(log) > 1 || log.head.receiver_count() > 0;
            let keep = !idle || in_use;
            if !keep {
                retired.insert(thread_id.clone(), ring.next_seq);
            }
            keep
        });
        if dropped > 0 {
            tracing::debug!(dropped, threads = logs.len(), "Update log purged");
        }
        dropped
    }

    pub fn thread_count(&self) -> usize {
        self.logs.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// 持有线程提交锁的写入句柄；drop 时释放锁
pub struct ThreadWriter {
    log: Arc<ThreadLog>,
    retention: Duration,
    max_entries: usize,
    _guard: OwnedMutexGuard<()>,
}

impl ThreadWriter {
    pub fn append(&self, update: Update) -> LogEntry {
        let mut ring = self.log.ring_mut();
        let entry = LogEntry {
            seq: ring.next_seq,
            thread_id: self.log.thread_id.clone(),
            update,
        };
        let now = Instant::now();
        ring.entries.push_back((now, entry.clone()));
        ring.next_seq += 1;
        ring.touched = now;
        ring.trim(self.retention, self.max_entries);
        self.log.head.send_replace(ring.next_seq);
        entry
    }

    /// 当前已提交前缀之后的位置
    pub fn cursor(&self) -> u64 {
        self.log.head()
    }

    pub fn thread_id(&self) -> &str {
        self.log.thread_id()
    }
}
