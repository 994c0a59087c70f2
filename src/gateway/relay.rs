//! 线程订阅中继：快照 + 日志尾 + 心跳
//!
//! 与传输层无关，只往一个有界 channel 里写 `GatewayMessage`。每个订阅持有自己的 cursor，
//! 发送失败（接收端已关闭）只结束本订阅。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::message::GatewayMessage;
use crate::core::ServiceError;
use crate::service::TaskService;
use crate::update_log::LogTail;

/// 订阅结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// 连接或订阅被主动取消
    Cancelled,
    /// 接收端已关闭
    Disconnected,
}

/// 线程中继
#[derive(Clone)]
pub struct ThreadRelay {
    service: Arc<TaskService>,
    heartbeat: Duration,
}

impl ThreadRelay {
    pub fn new(service: Arc<TaskService>, heartbeat: Duration) -> Self {
        Self {
            service,
            heartbeat: heartbeat.max(Duration::from_millis(10)),
        }
    }

    /// 运行一个订阅直到取消或接收端关闭
    ///
    /// `cursor` 仍在保留窗口内时直接续读，不再发送快照；否则先发送 `initial_state`。
    /// 线程不存在时立即返回错误，不发送任何消息。
    pub async fn run(
        &self,
        thread_id: &str,
        cursor: Option<u64>,
        tx: mpsc::Sender<GatewayMessage>,
        cancel: CancellationToken,
    ) -> Result<RelayEnd, ServiceError> {
        if !self.service.thread_exists(thread_id).await? {
            return Err(ServiceError::ThreadNotFound(thread_id.to_string()));
        }

        let mut tail = self.service.subscribe(thread_id, cursor.unwrap_or(0));
        if cursor.is_none() && !self.resync(&mut tail, &tx).await? {
            return Ok(RelayEnd::Disconnected);
        }
        tracing::debug!(thread_id = %thread_id, cursor = tail.cursor(), "Relay started");

        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(RelayEnd::Cancelled),
                batch = tail.next_batch() => {
                    if batch.truncated {
                        tracing::debug!(thread_id = %thread_id, "Cursor outside retention, resending snapshot");
                        if !self.resync(&mut tail, &tx).await? {
                            return Ok(RelayEnd::Disconnected);
                        }
                        continue;
                    }
                    for entry in batch.entries {
                        if tx.send(GatewayMessage::from_entry(entry)).await.is_err() {
                            return Ok(RelayEnd::Disconnected);
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if tx.send(GatewayMessage::heartbeat(thread_id, tail.cursor())).await.is_err() {
                        return Ok(RelayEnd::Disconnected);
                    }
                }
            }
        }
    }

    /// 发送新快照并把 tail 移到快照之后；接收端关闭时返回 false
    async fn resync(
        &self,
        tail: &mut LogTail,
        tx: &mpsc::Sender<GatewayMessage>,
    ) -> Result<bool, ServiceError> {
        let snapshot = self.service.snapshot(tail.thread_id()).await?;
        tail.seek(snapshot.cursor);
        Ok(tx.send(GatewayMessage::initial_state(snapshot)).await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateLogSection;
    use crate::executor::CancelRegistry;
    use crate::gateway::message::MessageType;
    use crate::queue::TaskQueue;
    use crate::service::SubmitRequest;
    use crate::store::{MemoryTaskStore, TaskStatus};
    use crate::update_log::{Update, UpdateLog};

    fn service() -> Arc<TaskService> {
        Arc::new(TaskService::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(UpdateLog::new(&UpdateLogSection::default())),
            Arc::new(TaskQueue::new(Duration::from_secs(300))),
            Arc::new(CancelRegistry::new()),
        ))
    }

    fn spawn_relay(
        svc: &Arc<TaskService>,
        thread_id: &str,
        cursor: Option<u64>,
    ) -> (
        mpsc::Receiver<GatewayMessage>,
        CancellationToken,
        tokio::task::JoinHandle<Result<RelayEnd, ServiceError>>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let relay = ThreadRelay::new(Arc::clone(svc), Duration::from_secs(30));
        let thread_id = thread_id.to_string();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { relay.run(&thread_id, cursor, tx, token).await });
        (rx, cancel, handle)
    }

    #[tokio::test]
    async fn test_snapshot_then_tail() {
        let svc = service();
        let receipt = svc.submit(SubmitRequest::new("check memory")).await.unwrap();
        let (mut rx, cancel, handle) = spawn_relay(&svc, &receipt.thread_id, None);

        let first = rx.recv().await.unwrap();
        let MessageType::InitialState { snapshot } = first.message else {
            panic!("expected initial_state, got {:?}", first.message);
        };
        assert_eq!(snapshot.status, Some(TaskStatus::Queued));
        assert_eq!(snapshot.cursor, 2);

        svc.update_log()
            .append(&receipt.thread_id, Update::progress(&receipt.task_id, "working"))
            .await;
        let next = rx.recv().await.unwrap();
        assert!(matches!(next.message, MessageType::ThreadUpdate { seq: 2, .. }));

        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), RelayEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_resume_from_retained_cursor() {
        let svc = service();
        let receipt = svc.submit(SubmitRequest::new("x")).await.unwrap();
        let (mut rx, cancel, _handle) = spawn_relay(&svc, &receipt.thread_id, Some(1));

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first.message,
            MessageType::StatusChange { seq: 1, status: Some(TaskStatus::Queued), .. }
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stale_cursor_gets_fresh_snapshot() {
        let svc = service();
        let receipt = svc.submit(SubmitRequest::new("x")).await.unwrap();
        let (mut rx, cancel, _handle) = spawn_relay(&svc, &receipt.thread_id, Some(999));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.message, MessageType::InitialState { .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_thread_rejected() {
        let svc = service();
        let (mut rx, _cancel, handle) = spawn_relay(&svc, "thread_missing", None);
        assert!(matches!(
            handle.await.unwrap(),
            Err(ServiceError::ThreadNotFound(_))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_carries_cursor() {
        let svc = service();
        let receipt = svc.submit(SubmitRequest::new("x")).await.unwrap();
        let (mut rx, cancel, _handle) = spawn_relay(&svc, &receipt.thread_id, None);

        let _initial = rx.recv().await.unwrap();
        let beat = rx.recv().await.unwrap();
        assert!(matches!(beat.message, MessageType::Heartbeat { cursor: 2, .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_closed_receiver_ends_only_that_relay() {
        let svc = service();
        let receipt = svc.submit(SubmitRequest::new("x")).await.unwrap();
        let (rx_a, _cancel_a, handle_a) = spawn_relay(&svc, &receipt.thread_id, Some(2));
        let (mut rx_b, cancel_b, handle_b) = spawn_relay(&svc, &receipt.thread_id, Some(2));
        drop(rx_a);

        svc.update_log()
            .append(&receipt.thread_id, Update::progress(&receipt.task_id, "tick"))
            .await;
        assert_eq!(handle_a.await.unwrap().unwrap(), RelayEnd::Disconnected);

        let msg = rx_b.recv().await.unwrap();
        assert!(matches!(msg.message, MessageType::ThreadUpdate { seq: 2, .. }));
        cancel_b.cancel();
        assert_eq!(handle_b.await.unwrap().unwrap(), RelayEnd::Cancelled);
    }
}
