//! 对外接口：提交、续写、查询、取消、快照与订阅
//!
//! 网关与二进制都只通过 `TaskService` 操作任务；所有对快照可见的存储变更都在线程提交锁内
//! 与对应的更新一起写入。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::cache::ToolCache;
use crate::core::{ServiceError, StoreError};
use crate::executor::CancelRegistry;
use crate::queue::TaskQueue;
use crate::store::{NewTask, TaskPriority, TaskStatus, TaskStore, Thread};
use crate::update_log::{LogEntry, LogTail, ThreadSnapshot, Update, UpdateLog};

/// 提交请求
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    /// 为空时新建线程；指定的线程不存在时以该 id 创建
    #[serde(default)]
    pub thread_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub context: Option<Map<String, Value>>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requester_id: Option<String>,
}

impl SubmitRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn on_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// 提交回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub thread_id: String,
    pub status: TaskStatus,
}

/// 任务状态视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub thread_id: String,
    pub status: TaskStatus,
    /// 保留窗口内属于该任务的更新
    pub updates: Vec<LogEntry>,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

/// 一次维护清理的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub log_entries_purged: usize,
    pub cache_entries_purged: usize,
    pub tasks_purged: usize,
    pub leases_reaped: usize,
}

/// 任务服务
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    log: Arc<UpdateLog>,
    queue: Arc<TaskQueue>,
    cancels: Arc<CancelRegistry>,
    cache: Option<Arc<ToolCache>>,
    store_retention: Duration,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        log: Arc<UpdateLog>,
        queue: Arc<TaskQueue>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            store,
            log,
            queue,
            cancels,
            cache: None,
            store_retention: Duration::from_secs(168 * 3600),
        }
    }

    /// 维护时一并清理工具缓存
    pub fn with_cache(mut self, cache: Arc<ToolCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_store_retention(mut self, retention: Duration) -> Self {
        self.store_retention = retention;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn update_log(&self) -> &Arc<UpdateLog> {
        &self.log
    }

    /// 提交任务
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, ServiceError> {
        validate_message(&request.message)?;
        let thread_id = match &request.thread_id {
            Some(id) if id.trim().is_empty() => {
                return Err(ServiceError::InvalidRequest("thread_id must not be empty".into()))
            }
            Some(id) => {
                self.ensure_thread(id, &request).await?;
                id.clone()
            }
            None => {
                let id = Thread::generate_id();
                self.store.create_thread(&id, thread_metadata(&request)).await?;
                id
            }
        };
        self.begin(thread_id, request).await
    }

    /// 在已有线程上续写；线程当前任务未结束时返回 Conflict
    pub async fn continue_thread(
        &self,
        thread_id: &str,
        request: SubmitRequest,
    ) -> Result<SubmitReceipt, ServiceError> {
        validate_message(&request.message)?;
        if self.store.get_thread(thread_id).await?.is_none() {
            return Err(ServiceError::ThreadNotFound(thread_id.to_string()));
        }
        self.begin(thread_id.to_string(), request).await
    }

    async fn ensure_thread(&self, thread_id: &str, request: &SubmitRequest) -> Result<(), ServiceError> {
        if self.store.get_thread(thread_id).await?.is_some() {
            return Ok(());
        }
        match self.store.create_thread(thread_id, thread_metadata(request)).await {
            Ok(_) | Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn begin(&self, thread_id: String, request: SubmitRequest) -> Result<SubmitReceipt, ServiceError> {
        let new_task = NewTask {
            thread_id: thread_id.clone(),
            message: request.message,
            context: request.context.unwrap_or_default(),
            priority: request.priority,
            tags: request.tags,
            requester_id: request.requester_id,
        };

        let task = {
            let writer = self.log.lock_thread(&thread_id).await;
            let task = self.store.begin_task(new_task).await?;
            writer.append(Update::status_change(&task.id, TaskStatus::Queued));
            task
        };
        self.queue.enqueue(&task.id, task.priority);

        tracing::info!(task_id = %task.id, thread_id = %thread_id, priority = ?task.priority, "Task submitted");
        Ok(SubmitReceipt {
            task_id: task.id,
            thread_id,
            status: task.status,
        })
    }

    /// 查询任务状态
    pub async fn status(&self, task_id: &str) -> Result<TaskStatusView, ServiceError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| ServiceError::TaskNotFound(task_id.to_string()))?;
        let updates = self
            .log
            .read_from(&task.thread_id, 1)
            .entries
            .into_iter()
            .filter(|e| e.update.task_id() == Some(task_id))
            .collect();
        Ok(TaskStatusView {
            task_id: task.id,
            thread_id: task.thread_id,
            status: task.status,
            updates,
            result: task.result,
            error_message: task.error_message,
        })
    }

    /// 请求取消
    ///
    /// 排队中的任务立即进入 cancelled 且永远不会被执行；执行中的任务在下一个边界处停下；
    /// 已结束的任务返回 Conflict。
    pub async fn cancel(&self, task_id: &str) -> Result<TaskStatus, ServiceError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| ServiceError::TaskNotFound(task_id.to_string()))?;

        let writer = self.log.lock_thread(&task.thread_id).await;
        let updated = self.store.request_cancel(task_id).await?;
        if updated.status == TaskStatus::Cancelled {
            self.queue.remove(task_id);
            writer.append(Update::status_change(task_id, TaskStatus::Cancelled));
            tracing::info!(task_id = %task_id, "Queued task cancelled");
        } else {
            writer.append(Update::progress(task_id, "Cancellation requested"));
            let signalled = self.cancels.cancel(task_id);
            tracing::info!(task_id = %task_id, signalled, "Cancellation requested for running task");
        }
        Ok(updated.status)
    }

    /// 线程快照及其后的 cursor
    pub async fn snapshot(&self, thread_id: &str) -> Result<ThreadSnapshot, ServiceError> {
        self.log
            .snapshot(self.store.as_ref(), thread_id)
            .await?
            .ok_or_else(|| ServiceError::ThreadNotFound(thread_id.to_string()))
    }

    /// 从 cursor 开始跟随线程日志
    pub fn subscribe(&self, thread_id: &str, cursor: u64) -> LogTail {
        self.log.subscribe(thread_id, cursor)
    }

    pub async fn thread_exists(&self, thread_id: &str) -> Result<bool, ServiceError> {
        Ok(self.store.get_thread(thread_id).await?.is_some())
    }

    /// 启动时把未结束的任务重新入队，返回入队数
    pub async fn recover(&self) -> Result<usize, ServiceError> {
        let tasks = self.store.unfinished_tasks().await?;
        let mut count = 0;
        for task in &tasks {
            if self.queue.enqueue(&task.id, task.priority) {
                count += 1;
            }
        }
        if count > 0 {
            tracing::info!(count, "Recovered unfinished tasks");
        }
        Ok(count)
    }

    /// 周期维护：清理日志、缓存与过期任务，回收过期租约
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, ServiceError> {
        let report = MaintenanceReport {
            log_entries_purged: self.log.purge_expired(),
            cache_entries_purged: self.cache.as_ref().map_or(0, |c| c.purge_expired()),
            tasks_purged: self.store.purge_expired(self.store_retention).await?,
            leases_reaped: self.queue.reap_expired().len(),
        };
        if report != MaintenanceReport::default() {
            tracing::info!(report = %json!(report), "Maintenance sweep");
        }
        Ok(report)
    }
}

fn validate_message(message: &str) -> Result<(), ServiceError> {
    if message.trim().is_empty() {
        return Err(ServiceError::InvalidRequest("message must not be empty".into()));
    }
    Ok(())
}

fn thread_metadata(request: &SubmitRequest) -> Value {
    match &request.requester_id {
        Some(id) => json!({ "requester_id": id }),
        None => Value::Null,
    }
}
