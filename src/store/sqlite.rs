//! SQLite 任务存储（需启用 async-sqlite feature）
//!
//! 每个变更操作在一个事务内完成「读取 → 迁移 → 写回」，迁移规则与内存存储共用。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::task::now_millis;
use super::{
    apply_begin, apply_cancel, apply_claim, apply_finish, check_can_begin, ClaimOutcome, Message,
    NewTask, Task, TaskOutcome, TaskPriority, TaskStatus, TaskStore, Thread,
};
use crate::core::StoreError;

const TASK_COLUMNS: &str = "id, thread_id, status, priority, tags, requester_id, input_context,
     cancel_requested, lease_id, attempts, result, error_message, created_at, updated_at";

/// SQLite 持久化存储
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                context TEXT NOT NULL,
                action_items TEXT NOT NULL,
                result TEXT,
                error_message TEXT,
                metadata TEXT NOT NULL,
                current_task_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS thread_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                metadata TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                tags TEXT NOT NULL,
                requester_id TEXT,
                input_context TEXT NOT NULL,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                lease_id TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_thread_messages_thread ON thread_messages(thread_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_thread ON tasks(thread_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task, StoreError> {
    let status: String = row.get("status");
    Ok(Task {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        status: status.parse().map_err(StoreError::Database)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        priority: TaskPriority::from_i64(row.get("priority")),
        tags: serde_json::from_str(&row.get::<String, _>("tags"))?,
        requester_id: row.get("requester_id"),
        input_context: serde_json::from_str(&row.get::<String, _>("input_context"))?,
        cancel_requested: row.get("cancel_requested"),
        lease_id: row.get("lease_id"),
        attempts: row.get::<i64, _>("attempts") as u32,
        result: row.get("result"),
        error_message: row.get("error_message"),
    })
}

async fn load_task(conn: &mut SqliteConnection, task_id: &str) -> Result<Option<Task>, StoreError> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
        .bind(task_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

async fn require_task(conn: &mut SqliteConnection, task_id: &str) -> Result<Task, StoreError> {
    load_task(conn, task_id)
        .await?
        .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
}

async fn save_task(conn: &mut SqliteConnection, task: &Task) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR REPLACE INTO tasks
         (id, thread_id, status, priority, tags, requester_id, input_context,
          cancel_requested, lease_id, attempts, result, error_message, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.id)
    .bind(&task.thread_id)
    .bind(task.status.as_str())
    .bind(task.priority as i64)
    .bind(serde_json::to_string(&task.tags)?)
    .bind(&task.requester_id)
    .bind(serde_json::to_string(&task.input_context)?)
    .bind(task.cancel_requested)
    .bind(&task.lease_id)
    .bind(task.attempts as i64)
    .bind(&task.result)
    .bind(&task.error_message)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// 读取线程；`with_messages` 为 false 时 messages 为空，仅用于随后追加新消息
async fn load_thread(
    conn: &mut SqliteConnection,
    thread_id: &str,
    with_messages: bool,
) -> Result<Option<Thread>, StoreError> {
    let Some(row) = sqlx::query(
        "SELECT id, context, action_items, result, error_message, metadata, current_task_id,
                created_at, updated_at
         FROM threads WHERE id = ?",
    )
    .bind(thread_id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    let mut thread = Thread {
        id: row.get("id"),
        messages: Vec::new(),
        context: serde_json::from_str(&row.get::<String, _>("context"))?,
        action_items: serde_json::from_str(&row.get::<String, _>("action_items"))?,
        result: row.get("result"),
        error_message: row.get("error_message"),
        metadata: serde_json::from_str(&row.get::<String, _>("metadata"))?,
        current_task_id: row.get("current_task_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    };

    if with_messages {
        let rows = sqlx::query(
            "SELECT role, content, timestamp, metadata FROM thread_messages
             WHERE thread_id = ? ORDER BY id ASC",
        )
        .bind(thread_id)
        .fetch_all(&mut *conn)
        .await?;

        for row in rows {
            let role: String = row.get("role");
            thread.messages.push(Message {
                role: role.parse().map_err(StoreError::Database)?,
                content: row.get("content"),
                timestamp: row.get("timestamp"),
                metadata: row
                    .get::<Option<String>, _>("metadata")
                    .and_then(|s| serde_json::from_str(&s).ok()),
            });
        }
    }
    Ok(Some(thread))
}

async fn save_thread(conn: &mut SqliteConnection, thread: &Thread) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR REPLACE INTO threads
         (id, context, action_items, result, error_message, metadata, current_task_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&thread.id)
    .bind(serde_json::to_string(&thread.context)?)
    .bind(serde_json::to_string(&thread.action_items)?)
    .bind(&thread.result)
    .bind(&thread.error_message)
    .bind(serde_json::to_string(&thread.metadata)?)
    .bind(&thread.current_task_id)
    .bind(thread.created_at)
    .bind(thread.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_messages(
    conn: &mut SqliteConnection,
    thread_id: &str,
    messages: &[Message],
) -> Result<(), StoreError> {
    for message in messages {
        let metadata = message.metadata.as_ref().map(|m| m.to_string());
        sqlx::query(
            "INSERT INTO thread_messages (thread_id, role, content, timestamp, metadata)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(thread_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(metadata)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_thread(&self, thread_id: &str, metadata: Value) -> Result<Thread, StoreError> {
        let mut tx = self.pool.begin().await?;
        if load_thread(&mut tx, thread_id, false).await?.is_some() {
            return Err(StoreError::Conflict(format!("thread {thread_id} already exists")));
        }
        let thread = Thread::new(thread_id, metadata);
        save_thread(&mut tx, &thread).await?;
        tx.commit().await?;
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        load_thread(&mut conn, thread_id, true).await
    }

    async fn begin_task(&self, request: NewTask) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut thread = load_thread(&mut tx, &request.thread_id, false)
            .await?
            .ok_or_else(|| StoreError::ThreadNotFound(request.thread_id.clone()))?;
        let current = match &thread.current_task_id {
            Some(id) => load_task(&mut tx, id).await?,
            None => None,
        };
        check_can_begin(&thread, current.as_ref())?;

        let task = apply_begin(&mut thread, &request);
        save_task(&mut tx, &task).await?;
        save_thread(&mut tx, &thread).await?;
        insert_messages(&mut tx, &thread.id, &thread.messages).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        load_task(&mut conn, task_id).await
    }

    async fn tasks_for_thread(&self, thread_id: &str) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE thread_id = ? ORDER BY created_at ASC"
        ))
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn claim(&self, task_id: &str, lease_id: &str) -> Result<ClaimOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut task = require_task(&mut tx, task_id).await?;
        let outcome = apply_claim(&mut task, lease_id);
        if matches!(outcome, ClaimOutcome::Claimed(_)) {
            save_task(&mut tx, &task).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn request_cancel(&self, task_id: &str) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut task = require_task(&mut tx, task_id).await?;
        let mut thread = load_thread(&mut tx, &task.thread_id, false).await?;
        apply_cancel(&mut task, thread.as_mut())?;
        save_task(&mut tx, &task).await?;
        if let Some(thread) = &thread {
            save_thread(&mut tx, thread).await?;
        }
        tx.commit().await?;
        Ok(task)
    }

    async fn finish(&self, task_id: &str, lease_id: &str, outcome: TaskOutcome) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut task = require_task(&mut tx, task_id).await?;
        let mut thread = load_thread(&mut tx, &task.thread_id, false).await?;
        apply_finish(&mut task, thread.as_mut(), lease_id, outcome)?;
        save_task(&mut tx, &task).await?;
        if let Some(thread) = &thread {
            save_thread(&mut tx, thread).await?;
            insert_messages(&mut tx, &thread.id, &thread.messages).await?;
        }
        tx.commit().await?;
        Ok(task)
    }

    async fn append_message(&self, thread_id: &str, message: Message) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE threads SET updated_at = ? WHERE id = ?")
            .bind(message.timestamp)
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }
        insert_messages(&mut tx, thread_id, std::slice::from_ref(&message)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn unfinished_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status IN ('{}', '{}')
             ORDER BY priority DESC, created_at ASC",
            TaskStatus::Queued.as_str(),
            TaskStatus::InProgress.as_str()
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn purge_expired(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = now_millis() - max_age.as_millis() as i64;
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM tasks WHERE status IN ('done', 'failed', 'cancelled') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "DELETE FROM thread_messages WHERE thread_id IN (
                SELECT id FROM threads WHERE updated_at < ?
                AND id NOT IN (SELECT DISTINCT thread_id FROM tasks))",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM threads WHERE updated_at < ? AND id NOT IN (SELECT DISTINCT thread_id FROM tasks)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if removed > 0 {
            tracing::info!(removed, "Purged expired tasks");
        }
        Ok(removed as usize)
    }
}
