//! 任务/线程存储
//!
//! 任务与线程的持久记录。状态迁移规则集中在本模块的纯函数里，内存与 SQLite 两个后端共用，
//! 后端只负责在一次原子操作内「读取 → 迁移 → 写回」。

pub mod task;
pub mod thread;

#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::StoreSection;
use crate::core::StoreError;

pub use task::{ClaimOutcome, NewTask, Task, TaskId, TaskOutcome, TaskPriority, TaskStatus};
pub use thread::{Message, Role, Thread};

use task::{now_millis, CANCELLED_MESSAGE};

/// 任务/线程存储接口
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 创建线程；id 已存在时返回 Conflict
    async fn create_thread(&self, thread_id: &str, metadata: Value) -> Result<Thread, StoreError>;

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError>;

    /// 原子地：检查线程上没有未结束的任务 → 追加用户消息 → 合并上下文 → 清空上一次结果 → 插入 queued 任务
    async fn begin_task(&self, request: NewTask) -> Result<Task, StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    /// 线程上的全部任务，按创建时间升序
    async fn tasks_for_thread(&self, thread_id: &str) -> Result<Vec<Task>, StoreError>;

    /// 以给定租约领取任务（queued → in_progress，或租约过期后重新领取 in_progress）
    async fn claim(&self, task_id: &str, lease_id: &str) -> Result<ClaimOutcome, StoreError>;

    /// queued 直接取消；in_progress 仅设置取消标记；终态返回 Conflict
    async fn request_cancel(&self, task_id: &str) -> Result<Task, StoreError>;

    /// 写入终态；调用者必须仍持有 `lease_id`，否则返回 LeaseLost
    async fn finish(&self, task_id: &str, lease_id: &str, outcome: TaskOutcome) -> Result<Task, StoreError>;

    async fn append_message(&self, thread_id: &str, message: Message) -> Result<(), StoreError>;

    /// queued 与 in_progress 的任务，用于启动时重新入队
    async fn unfinished_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// 删除超过保留期的终态任务及其空闲线程，返回删除的任务数
    async fn purge_expired(&self, max_age: Duration) -> Result<usize, StoreError>;
}

pub(crate) fn check_can_begin(thread: &Thread, current: Option<&Task>) -> Result<(), StoreError> {
    match current {
        Some(task) if !task.is_finished() => Err(StoreError::Conflict(format!(
            "thread {} already has an active task {} ({})",
            thread.id, task.id, task.status
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn apply_begin(thread: &mut Thread, request: &NewTask) -> Task {
    let task = Task::new(&thread.id, request);
    thread.messages.push(Message::user(&request.message));
    for (k, v) in &request.context {
        thread.context.insert(k.clone(), v.clone());
    }
    thread.result = None;
    thread.error_message = None;
    thread.action_items.clear();
    thread.current_task_id = Some(task.id.clone());
    thread.updated_at = task.created_at;
    task
}

pub(crate) fn apply_claim(task: &mut Task, lease_id: &str) -> ClaimOutcome {
    match task.status {
        TaskStatus::Queued | TaskStatus::InProgress => {
            task.status = TaskStatus::InProgress;
            task.lease_id = Some(lease_id.to_string());
            task.attempts += 1;
            task.updated_at = now_millis();
            ClaimOutcome::Claimed(task.clone())
        }
        terminal => ClaimOutcome::Skip(terminal),
    }
}

pub(crate) fn apply_cancel(task: &mut Task, thread: Option<&mut Thread>) -> Result<(), StoreError> {
    match task.status {
        TaskStatus::Queued => {
            task.status = TaskStatus::Cancelled;
            task.error_message = Some(CANCELLED_MESSAGE.to_string());
            task.updated_at = now_millis();
            if let Some(thread) = thread.filter(|t| t.current_task_id.as_deref() == Some(task.id.as_str())) {
                thread.error_message = Some(CANCELLED_MESSAGE.to_string());
                thread.updated_at = task.updated_at;
            }
            Ok(())
        }
        TaskStatus::InProgress => {
            task.cancel_requested = true;
            task.updated_at = now_millis();
            Ok(())
        }
        terminal => Err(StoreError::Conflict(format!(
            "task {} is already {terminal}",
            task.id
        ))),
    }
}

pub(crate) fn apply_finish(
    task: &mut Task,
    thread: Option<&mut Thread>,
    lease_id: &str,
    outcome: TaskOutcome,
) -> Result<(), StoreError> {
    let to = outcome.status();
    if task.status.is_terminal() || task.status == TaskStatus::Queued {
        return Err(StoreError::InvalidTransition {
            task_id: task.id.clone(),
            from: task.status.to_string(),
            to: to.to_string(),
        });
    }
    if task.lease_id.as_deref() != Some(lease_id) {
        return Err(StoreError::LeaseLost(task.id.clone()));
    }

    task.status = to;
    task.updated_at = now_millis();
    let thread = thread.filter(|t| t.current_task_id.as_deref() == Some(task.id.as_str()));

    match outcome {
        TaskOutcome::Done {
            result,
            action_items,
        } => {
            task.result = Some(result.clone());
            if let Some(thread) = thread {
                thread.messages.push(Message::assistant(&result));
                thread.result = Some(result);
                thread.action_items = action_items;
                thread.updated_at = task.updated_at;
            }
        }
        TaskOutcome::Failed(error) => {
            task.error_message = Some(error.clone());
            if let Some(thread) = thread {
                thread.error_message = Some(error);
                thread.updated_at = task.updated_at;
            }
        }
        TaskOutcome::Cancelled => {
            task.error_message = Some(CANCELLED_MESSAGE.to_string());
            if let Some(thread) = thread {
                thread.error_message = Some(CANCELLED_MESSAGE.to_string());
                thread.updated_at = task.updated_at;
            }
        }
    }
    Ok(())
}

#[derive(Default)]
struct MemoryInner {
    threads: HashMap<String, Thread>,
    tasks: HashMap<TaskId, Task>,
}

/// 内存存储（默认）
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_thread(&self, thread_id: &str, metadata: Value) -> Result<Thread, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.threads.contains_key(thread_id) {
            return Err(StoreError::Conflict(format!("thread {thread_id} already exists")));
        }
        let thread = Thread::new(thread_id, metadata);
        inner.threads.insert(thread_id.to_string(), thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        Ok(self.inner.read().await.threads.get(thread_id).cloned())
    }

    async fn begin_task(&self, request: NewTask) -> Result<Task, StoreError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let thread = inner
            .threads
            .get_mut(&request.thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(request.thread_id.clone()))?;
        let current = thread
            .current_task_id
            .as_ref()
            .and_then(|id| inner.tasks.get(id));
        check_can_begin(thread, current)?;

        let task = apply_begin(thread, &request);
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().await.tasks.get(task_id).cloned())
    }

    async fn tasks_for_thread(&self, thread_id: &str) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.thread_id == thread_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn claim(&self, task_id: &str, lease_id: &str) -> Result<ClaimOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        Ok(apply_claim(task, lease_id))
    }

    async fn request_cancel(&self, task_id: &str) -> Result<Task, StoreError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        let thread = inner.threads.get_mut(&task.thread_id);
        apply_cancel(task, thread)?;
        Ok(task.clone())
    }

    async fn finish(&self, task_id: &str, lease_id: &str, outcome: TaskOutcome) -> Result<Task, StoreError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        let thread = inner.threads.get_mut(&task.thread_id);
        apply_finish(task, thread, lease_id, outcome)?;
        Ok(task.clone())
    }

    async fn append_message(&self, thread_id: &str, message: Message) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let thread = inner
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;
        thread.updated_at = message.timestamp;
        thread.messages.push(message);
        Ok(())
    }

    async fn unfinished_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| !t.is_finished())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(tasks)
    }

    async fn purge_expired(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = now_millis() - max_age.as_millis() as i64;
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let before = inner.tasks.len();
        inner
            .tasks
            .retain(|_, t| !(t.is_finished() && t.updated_at < cutoff));
        let removed = before - inner.tasks.len();

        let tasks = &inner.tasks;
        inner.threads.retain(|id, thread| {
            thread.updated_at >= cutoff || tasks.values().any(|t| &t.thread_id == id)
        });
        Ok(removed)
    }
}

/// 创建任务存储
///
/// 配置了 db_path 且启用 async-sqlite feature 时使用 SQLite，否则使用内存存储
pub async fn create_task_store(config: &StoreSection) -> Arc<dyn TaskStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = &config.db_path {
        match sqlite::SqliteTaskStore::new(path).await {
            Ok(store) => {
                tracing::info!(path = %path.display(), "Using SQLite task store");
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite task store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if config.db_path.is_some() {
        tracing::warn!("db_path configured but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory task store");
    Arc::new(MemoryTaskStore::new())
}
