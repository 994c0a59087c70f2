//! TTL 解析策略
//!
//! 顺序：配置覆盖（子串匹配未带作用域的操作名，首个命中生效）→ 常见操作的内置默认 → 全局默认。
//! 作用域名里嵌有每个实例的哈希，固定的覆盖列表无法匹配完整名称，所以只匹配操作名部分。

use std::collections::HashMap;
use std::time::Duration;

use crate::config::{CacheSection, TtlOverride};
use crate::tools::naming::unscoped_operation;

/// 常见只读操作的内置 TTL（秒）
const BUILTIN_TTLS: &[(&str, u64)] = &[
    ("list_targets", 300),
    ("list_services", 300),
    ("describe_service", 600),
    ("query_metrics", 60),
    ("query_range", 60),
    ("query_logs", 30),
    ("search_logs", 30),
    ("get_alerts", 15),
    ("memory_usage", 10),
    ("load_average", 10),
];

#[derive(Debug, Clone)]
pub struct TtlPolicy {
    overrides: Vec<TtlOverride>,
    builtin: HashMap<&'static str, Duration>,
    global: Duration,
}

impl TtlPolicy {
    pub fn new(config: &CacheSection) -> Self {
        Self {
            overrides: config.overrides.clone(),
            builtin: BUILTIN_TTLS
                .iter()
                .map(|(op, secs)| (*op, Duration::from_secs(*secs)))
                .collect(),
            global: Duration::from_secs(config.default_ttl_secs),
        }
    }

    /// 按未带作用域的操作名解析 TTL；Duration::ZERO 表示不缓存
    pub fn ttl_for_operation(&self, operation: &str) -> Duration {
        if let Some(o) = self
            .overrides
            .iter()
            .find(|o| !o.pattern.is_empty() && operation.contains(o.pattern.as_str()))
        {
            return Duration::from_secs(o.ttl_secs);
        }
        if let Some(ttl) = self.builtin.get(operation) {
            return *ttl;
        }
        self.global
    }

    /// 按完整（带作用域）工具名解析 TTL
    pub fn ttl_for_tool(&self, tool_name: &str) -> Duration {
        self.ttl_for_operation(unscoped_operation(tool_name))
    }
}
