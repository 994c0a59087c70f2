//! Triage - AI 运维助手执行底座
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭
//! - **cache**: 工具调用结果缓存（TTL + 覆盖规则）
//! - **tools**: 工具提供方、作用域命名、参数校验与路由
//! - **store**: 任务 / 线程状态机与存储（内存 / SQLite）
//! - **queue**: 带租约的任务领取队列
//! - **update_log**: 按线程追加的更新日志（cursor、保留窗口、快照）
//! - **executor**: 工作者池与控制循环
//! - **service**: 提交、续写、查询、取消
//! - **gateway**: 实时更新网关（快照 + 日志尾 + 心跳）
//! - **observability**: tracing 初始化

pub mod cache;
pub mod config;
pub mod core;
pub mod executor;
pub mod gateway;
pub mod observability;
pub mod queue;
pub mod service;
pub mod store;
pub mod tools;
pub mod update_log;

pub use service::{SubmitReceipt, SubmitRequest, TaskService};
