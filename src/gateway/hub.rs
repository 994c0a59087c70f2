//! Hub：WebSocket 接入
//!
//! 每个连接一个读循环和一个写任务；订阅由 `ThreadRelay` 驱动，结果经有界 channel
//! 交给写任务。任何连接上的错误只关闭该连接。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::message::{GatewayMessage, MessageType};
use super::relay::ThreadRelay;
use crate::config::GatewaySection;
use crate::service::{SubmitRequest, TaskService};

/// Hub（网关入口）
pub struct Hub {
    config: GatewaySection,
    service: Arc<TaskService>,
    active: Arc<AtomicUsize>,
}

/// 连接计数守卫，连接结束时自动减一
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Hub {
    pub fn new(config: &GatewaySection, service: Arc<TaskService>) -> Self {
        Self {
            config: config.clone(),
            service,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 绑定监听地址
    pub async fn bind(&self) -> Result<TcpListener, String> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| format!("Invalid bind address: {}", e))?;
        TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind: {}", e))
    }

    /// 接受连接直到 `shutdown` 被触发
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Gateway listening on ws://{}", addr);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr, shutdown.child_token()),
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
            }
        }
        tracing::info!("Gateway stopped accepting connections");
    }

    /// 绑定并运行
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), String> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// 当前活跃连接数
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) {
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        let slot = ConnectionSlot(Arc::clone(&self.active));
        if previous >= self.config.max_connections {
            tracing::warn!(%addr, limit = self.config.max_connections, "Connection limit reached, rejecting");
            return;
        }

        let ctx = ConnectionContext {
            service: Arc::clone(&self.service),
            relay: ThreadRelay::new(
                Arc::clone(&self.service),
                Duration::from_secs(self.config.heartbeat_interval_secs),
            ),
            outbound_buffer: self.config.outbound_buffer.max(1),
        };
        tokio::spawn(async move {
            let _slot = slot;
            if let Err(e) = handle_connection(stream, addr, ctx, cancel).await {
                tracing::warn!("Connection error from {}: {}", addr, e);
            }
        });
    }
}

struct ConnectionContext {
    service: Arc<TaskService>,
    relay: ThreadRelay,
    outbound_buffer: usize,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ConnectionContext,
    cancel: CancellationToken,
) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<GatewayMessage>(ctx.outbound_buffer);

    tracing::info!("New WebSocket connection from {}", addr);

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(msg.to_json())).await.is_err() {
                break;
            }
        }
        // 写失败或读循环结束：停止本连接的所有订阅
        writer_cancel.cancel();
        let _ = ws_tx.close().await;
    });

    let mut subscriptions: HashMap<String, CancellationToken> = HashMap::new();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                tracing::warn!("WebSocket receive error: {}", e);
                break;
            }
            None => break,
        };

        match msg {
            WsMessage::Text(text) => {
                let request: GatewayMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        let _ = tx.send(GatewayMessage::error("parse_error", &e.to_string())).await;
                        continue;
                    }
                };
                handle_request(request, &ctx, &tx, &cancel, &mut subscriptions).await;
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    cancel.cancel();
    drop(tx);
    let _ = writer.await;

    tracing::info!("WebSocket connection closed: {}", addr);
    Ok(())
}

async fn handle_request(
    request: GatewayMessage,
    ctx: &ConnectionContext,
    tx: &mpsc::Sender<GatewayMessage>,
    cancel: &CancellationToken,
    subscriptions: &mut HashMap<String, CancellationToken>,
) {
    let request_id = request.id;
    let reply = match request.message {
        MessageType::Subscribe { thread_id, cursor } => {
            // 同一线程重复订阅时替换旧订阅
            let token = cancel.child_token();
            if let Some(old) = subscriptions.insert(thread_id.clone(), token.clone()) {
                old.cancel();
            }
            let relay = ctx.relay.clone();
            let relay_tx = tx.clone();
            let subscribe_id = request_id.clone();
            tokio::spawn(async move {
                match relay.run(&thread_id, cursor, relay_tx.clone(), token).await {
                    Ok(end) => tracing::debug!(thread_id = %thread_id, ?end, "Subscription ended"),
                    Err(e) => {
                        let _ = relay_tx
                            .send(GatewayMessage::reply_error(&subscribe_id, e.code(), &e.to_string()))
                            .await;
                    }
                }
            });
            None
        }

        MessageType::SubmitTask {
            thread_id,
            message,
            context,
            priority,
            tags,
        } => {
            let submit = SubmitRequest {
                thread_id,
                message,
                context,
                priority: priority.unwrap_or_default(),
                tags,
                requester_id: None,
            };
            Some(ctx.service.submit(submit).await.map(|receipt| {
                GatewayMessage::new(
                    Some(receipt.thread_id.clone()),
                    MessageType::TaskSubmitted { receipt },
                )
            }))
        }

        MessageType::ContinueThread {
            thread_id,
            message,
            context,
        } => {
            let mut submit = SubmitRequest::new(message);
            submit.context = context;
            Some(ctx.service.continue_thread(&thread_id, submit).await.map(|receipt| {
                GatewayMessage::new(
                    Some(receipt.thread_id.clone()),
                    MessageType::TaskSubmitted { receipt },
                )
            }))
        }

        MessageType::GetTaskStatus { task_id } => Some(ctx.service.status(&task_id).await.map(|view| {
            GatewayMessage::new(Some(view.thread_id.clone()), MessageType::TaskStatus { view })
        })),

        MessageType::CancelTask { task_id } => Some(ctx.service.cancel(&task_id).await.map(|status| {
            GatewayMessage::new(None, MessageType::CancelAcknowledged { task_id, status })
        })),

        MessageType::Ping { timestamp } => Some(Ok(GatewayMessage::pong(timestamp))),

        _ => Some(Ok(GatewayMessage::reply_error(
            &request_id,
            "unexpected_message",
            "Message type is not accepted from clients",
        ))),
    };

    if let Some(reply) = reply {
        let msg = reply.unwrap_or_else(|e| GatewayMessage::reply_error(&request_id, e.code(), &e.to_string()));
        let _ = tx.send(msg).await;
    }
}
