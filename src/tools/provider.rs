//! 工具提供方接口
//!
//! 每个提供方对应一个目标实例（某套 Prometheus、某台主机……），声明若干操作。
//! 启动时显式调用 `ToolRouter::register` 注册，不做运行时反射装配。

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 能力标签；Write（有副作用）的操作永不缓存
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
}

/// 提供方声明的单个操作
#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub capability: Capability,
}

impl OperationSpec {
    pub fn read(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_object_schema(),
            capability: Capability::Read,
        }
    }

    pub fn write(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_object_schema(),
            capability: Capability::Write,
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    /// 由参数结构体派生 JSON Schema
    pub fn with_typed_parameters<T: JsonSchema>(self) -> Self {
        let schema = serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| empty_object_schema());
        self.with_parameters(schema)
    }

    pub fn is_cacheable(&self) -> bool {
        self.capability == Capability::Read
    }
}

fn empty_object_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// 暴露给控制循环的工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
    pub capability_tag: Capability,
}

/// 工具提供方
///
/// `acquire` / `release` 界定一次执行会话的资源生命周期（连接、凭证等）；
/// 无论执行成功与否，路由器都会在会话结束时调用 `release`。
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// 提供方名（小写字母数字和连字符）
    fn name(&self) -> &str;

    /// 目标实例标识，例如 URL 或主机名；参与作用域哈希与缓存分区
    fn instance_scope(&self) -> &str;

    fn operations(&self) -> Vec<OperationSpec>;

    async fn acquire(&self) -> Result<(), String> {
        Ok(())
    }

    async fn release(&self) {}

    async fn call(&self, operation: &str, args: Value) -> Result<Value, String>;
}
