//! 任务领取队列
//!
//! 按优先级（高优先）+ 入队顺序出队。领取是单次投递：出队的同时生成租约，
//! 租约有效期内任何其他领取者都看不到该任务；租约过期后由 `reap_expired` 重新入队。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::store::{TaskId, TaskPriority};

/// 领取凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub task_id: TaskId,
    pub lease_id: String,
    pub expires_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
struct Pending {
    priority: TaskPriority,
    seq: u64,
    task_id: TaskId,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Held {
    lease: Lease,
    priority: TaskPriority,
}

#[derive(Default)]
struct QueueInner {
    ready: BinaryHeap<Pending>,
    /// 仍在 ready 中有效的任务；remove 只从这里删除，堆中的条目在出队时跳过
    queued: HashSet<TaskId>,
    leased: HashMap<TaskId, Held>,
    seq: u64,
}

/// 队列统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub leased: usize,
}

/// 带租约的任务队列
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    lease_duration: Duration,
}

impl TaskQueue {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            lease_duration,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 入队；已在队列中或已被领取的任务忽略并返回 false
    pub fn enqueue(&self, task_id: &str, priority: TaskPriority) -> bool {
        {
            let mut inner = self.lock();
            if inner.queued.contains(task_id) || inner.leased.contains_key(task_id) {
                return false;
            }
            push_ready(&mut inner, task_id.to_string(), priority);
        }
        self.notify.notify_one();
        true
    }

    /// 非阻塞领取
    pub fn try_claim(&self) -> Option<Lease> {
        let mut inner = self.lock();
        requeue_expired(&mut inner);
        while let Some(next) = inner.ready.pop() {
            if !inner.queued.remove(&next.task_id) {
                continue;
            }
            let lease = Lease {
                task_id: next.task_id.clone(),
                lease_id: uuid::Uuid::new_v4().to_string(),
                expires_at: Instant::now() + self.lease_duration,
            };
            inner.leased.insert(
                next.task_id,
                Held {
                    lease: lease.clone(),
                    priority: next.priority,
                },
            );
            return Some(lease);
        }
        None
    }

    /// 阻塞领取，直到有任务可领或 `cancel` 被触发（返回 None）
    ///
    /// 没有通知时也会周期性醒来，回收过期租约。
    pub async fn claim(&self, cancel: &CancellationToken) -> Option<Lease> {
        let poll = (self.lease_duration / 3).clamp(Duration::from_millis(100), Duration::from_secs(5));
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_claim() {
                return Some(lease);
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// 续租；租约已失效（已过期、被回收或已确认）时返回 false
    pub fn renew(&self, lease: &Lease) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.leased.get_mut(&lease.task_id) {
            Some(held) if held.lease.lease_id == lease.lease_id && held.lease.expires_at > now => {
                held.lease.expires_at = now + self.lease_duration;
                true
            }
            _ => false,
        }
    }

    /// 确认完成，释放租约
    pub fn ack(&self, lease: &Lease) -> bool {
        let mut inner = self.lock();
        match inner.leased.get(&lease.task_id) {
            Some(held) if held.lease.lease_id == lease.lease_id => {
                inner.leased.remove(&lease.task_id);
                true
            }
            _ => false,
        }
    }

    /// 从待领取集合中移除（排队中被取消）
    pub fn remove(&self, task_id: &str) -> bool {
        self.lock().queued.remove(task_id)
    }

    /// 回收过期租约并重新入队，返回被回收的任务
    pub fn reap_expired(&self) -> Vec<TaskId> {
        let reaped = requeue_expired(&mut self.lock());
        for _ in &reaped {
            self.notify.notify_one();
        }
        reaped
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            pending: inner.queued.len(),
            leased: inner.leased.len(),
        }
    }
}

fn push_ready(inner: &mut QueueInner, task_id: TaskId, priority: TaskPriority) {
    inner.seq += 1;
    let seq = inner.seq;
    inner.queued.insert(task_id.clone());
    inner.ready.push(Pending {
        priority,
        seq,
        task_id,
    });
}

fn requeue_expired(inner: &mut QueueInner) -> Vec<TaskId> {
    let now = Instant::now();
    let expired: Vec<TaskId> = inner
        .leased
        .iter()
        .filter(|(_, held)| held.lease.expires_at <= now)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &expired {
        if let Some(held) = inner.leased.remove(id) {
            tracing::warn!(task_id = %id, lease_id = %held.lease.lease_id, "Lease expired, task re-queued");
            push_ready(inner, id.clone(), held.priority);
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_priority_then_fifo() {
        let q = TaskQueue::new(Duration::from_secs(300));
        q.enqueue("a", TaskPriority::Normal);
        q.enqueue("b", TaskPriority::Urgent);
        q.enqueue("c", TaskPriority::Normal);
        let order: Vec<String> = std::iter::from_fn(|| q.try_claim().map(|l| l.task_id)).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_duplicate_enqueue_ignored_and_remove() {
        let q = TaskQueue::new(Duration::from_secs(300));
        assert!(q.enqueue("a", TaskPriority::Normal));
        assert!(!q.enqueue("a", TaskPriority::High));
        assert!(q.remove("a"));
        assert!(q.try_claim().is_none());
        assert_eq!(q.stats(), QueueStats { pending: 0, leased: 0 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claimers_get_distinct_tasks() {
        let q = Arc::new(TaskQueue::new(Duration::from_secs(300)));
        for i in 0..50 {
            q.enqueue(&format!("task_{i}"), TaskPriority::Normal);
        }
        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(lease) = q.try_claim() {
                    got.push(lease.task_id);
                    tokio::task::yield_now().await;
                }
                got
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.await.unwrap() {
                assert!(seen.insert(id), "task delivered twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_reclaimable() {
        let q = TaskQueue::new(Duration::from_secs(300));
        q.enqueue("a", TaskPriority::Normal);
        let first = q.try_claim().unwrap();
        assert!(q.try_claim().is_none());

        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(q.renew(&first));
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(q.try_claim().is_none());

        tokio::time::advance(Duration::from_secs(101)).await;
        let second = q.try_claim().unwrap();
        assert_eq!(second.task_id, "a");
        assert_ne!(second.lease_id, first.lease_id);
        assert!(!q.renew(&first));
        assert!(!q.ack(&first));
        assert!(q.ack(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_cannot_be_renewed_before_reaping() {
        let q = TaskQueue::new(Duration::from_secs(30));
        q.enqueue("a", TaskPriority::Normal);
        let lease = q.try_claim().unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!q.renew(&lease));
        assert_eq!(q.reap_expired(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_blocking_claim_wakes_on_enqueue_and_cancel() {
        let q = Arc::new(TaskQueue::new(Duration::from_secs(300)));
        let cancel = CancellationToken::new();

        let waiter = {
            let q = Arc::clone(&q);
            let cancel = cancel.clone();
            tokio::spawn(async move { q.claim(&cancel).await })
        };
        tokio::task::yield_now().await;
        q.enqueue("a", TaskPriority::Low);
        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.task_id, "a");

        let waiter = {
            let q = Arc::clone(&q);
            let cancel = cancel.clone();
            tokio::spawn(async move { q.claim(&cancel).await })
        };
        cancel.cancel();
        assert!(waiter.await.unwrap().is_none());
    }
}
