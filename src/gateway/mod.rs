//! 实时更新网关
//!
//! 客户端通过长连接订阅某个线程：先收到一条 `initial_state` 快照，然后按追加顺序
//! 收到之后的每一条更新，空闲时收到心跳。断线后可带 cursor 重连续读；cursor 已超出
//! 保留窗口时改发新快照。
//!
//! - `message`：消息协议
//! - `relay`：与传输无关的订阅中继
//! - `hub`：WebSocket 服务端（`gateway` feature）

#[cfg(feature = "gateway")]
mod hub;
mod message;
mod relay;

#[cfg(feature = "gateway")]
pub use hub::Hub;
pub use message::{GatewayMessage, MessageType};
pub use relay::{RelayEnd, ThreadRelay};
