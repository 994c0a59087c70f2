//! 工具注册表与路由
//!
//! 多个提供方的操作被展开到一个扁平命名空间（作用域名），注册期检测冲突；
//! invoke 解析名称 → 校验参数 → 可缓存时先查缓存 → 经 CallPolicy 分发到提供方。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::cache::{CacheKey, ToolCache};
use crate::core::ToolError;
use crate::tools::executor::{audit, CallPolicy};
use crate::tools::naming::{
    is_valid_operation_name, is_valid_provider_name, scoped_name,
};
use crate::tools::provider::{ToolDefinition, ToolProvider};
use crate::tools::validate::validate_args;

/// 成功调用的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub value: Value,
    /// 是否来自缓存
    pub cached: bool,
}

struct RoutedTool {
    definition: ToolDefinition,
    provider: Arc<dyn ToolProvider>,
    operation: String,
    cacheable: bool,
}

/// 工具路由器
pub struct ToolRouter {
    tools: HashMap<String, RoutedTool>,
    providers: Vec<Arc<dyn ToolProvider>>,
    cache: Arc<ToolCache>,
    policy: CallPolicy,
}

impl ToolRouter {
    pub fn new(cache: Arc<ToolCache>, policy: CallPolicy) -> Self {
        Self {
            tools: HashMap::new(),
            providers: Vec::new(),
            cache,
            policy,
        }
    }

    /// 注册提供方；名称非法或展开后冲突时返回配置错误，且不做部分注册
    pub fn register(&mut self, provider: Arc<dyn ToolProvider>) -> Result<(), ToolError> {
        let provider_name = provider.name().to_string();
        if !is_valid_provider_name(&provider_name) {
            return Err(ToolError::Configuration(format!(
                "invalid provider name '{provider_name}'"
            )));
        }

        let mut staged: Vec<(String, RoutedTool)> = Vec::new();
        for op in provider.operations() {
            if !is_valid_operation_name(&op.name) {
                return Err(ToolError::Configuration(format!(
                    "invalid operation name '{}' on provider '{}'",
                    op.name, provider_name
                )));
            }
            let name = scoped_name(&provider_name, provider.instance_scope(), &op.name);
            if self.tools.contains_key(&name) || staged.iter().any(|(n, _)| n == &name) {
                return Err(ToolError::Configuration(format!(
                    "tool name collision: '{name}' (provider '{provider_name}', scope '{}')",
                    provider.instance_scope()
                )));
            }
            let cacheable = op.is_cacheable();
            staged.push((
                name.clone(),
                RoutedTool {
                    definition: ToolDefinition {
                        name,
                        description: op.description,
                        parameter_schema: op.parameters,
                        capability_tag: op.capability,
                    },
                    provider: Arc::clone(&provider),
                    operation: op.name,
                    cacheable,
                },
            ));
        }

        tracing::info!(
            provider = %provider_name,
            scope = %provider.instance_scope(),
            operations = staged.len(),
            "tool provider registered"
        );
        self.tools.extend(staged);
        self.providers.push(provider);
        Ok(())
    }

    /// 按名称排序的工具定义列表
    pub fn schema_list(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn cache(&self) -> &Arc<ToolCache> {
        &self.cache
    }

    /// 调用工具
    pub async fn invoke(&self, tool_name: &str, args: Value) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;

        validate_args(&tool.definition.parameter_schema, &args).map_err(|reason| {
            ToolError::InvalidArguments {
                tool: tool_name.to_string(),
                reason,
            }
        })?;

        let scope = tool.provider.instance_scope();
        let use_cache = tool.cacheable && self.cache.is_enabled();
        let key = use_cache.then(|| CacheKey::new(tool_name, &args));

        if let Some(key) = &key {
            if let Some(value) = self.cache.get(key, scope) {
                audit(tool_name, "ok", 0, Duration::ZERO, true, &args);
                return Ok(ToolOutput {
                    value,
                    cached: true,
                });
            }
        }

        let provider = Arc::clone(&tool.provider);
        let operation = tool.operation.as_str();
        let value = self
            .policy
            .run(tool_name, &args, || provider.call(operation, args.clone()))
            .await?;

        if let Some(key) = key {
            let ttl = self.cache.policy().ttl_for_tool(tool_name);
            self.cache.put(key, scope, value.clone(), ttl);
        }

        Ok(ToolOutput {
            value,
            cached: false,
        })
    }

    /// 打开一次执行会话：依次 acquire 所有提供方，任一失败则释放已获取的并返回错误
    pub async fn open_session(self: &Arc<Self>) -> Result<ToolSession, ToolError> {
        let mut acquired: Vec<Arc<dyn ToolProvider>> = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            if let Err(detail) = provider.acquire().await {
                tracing::warn!(provider = %provider.name(), error = %detail, "provider acquire failed");
                for p in acquired.iter().rev() {
                    p.release().await;
                }
                return Err(ToolError::Acquire {
                    provider: provider.name().to_string(),
                    detail,
                });
            }
            acquired.push(Arc::clone(provider));
        }
        Ok(ToolSession {
            router: Arc::clone(self),
            acquired,
        })
    }
}

/// 一次执行会话；`release` 释放全部提供方，未显式释放时在 drop 中补做
pub struct ToolSession {
    router: Arc<ToolRouter>,
    acquired: Vec<Arc<dyn ToolProvider>>,
}

impl ToolSession {
    pub async fn invoke(&self, tool_name: &str, args: Value) -> Result<ToolOutput, ToolError> {
        self.router.invoke(tool_name, args).await
    }

    pub fn schema_list(&self) -> Vec<ToolDefinition> {
        self.router.schema_list()
    }

    pub async fn release(mut self) {
        let providers = std::mem::take(&mut self.acquired);
        release_all(providers).await;
    }
}

async fn release_all(providers: Vec<Arc<dyn ToolProvider>>) {
    for p in providers.iter().rev() {
        p.release().await;
    }
}

impl Drop for ToolSession {
    fn drop(&mut self) {
        if self.acquired.is_empty() {
            return;
        }
        let providers = std::mem::take(&mut self.acquired);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_all(providers));
            }
            Err(_) => tracing::warn!("tool session dropped outside runtime; providers not released"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSection, ToolsSection};
    use crate::tools::provider::OperationSpec;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        name: &'static str,
        scope: &'static str,
        calls: AtomicUsize,
        acquired: AtomicUsize,
        released: AtomicUsize,
        fail_acquire: bool,
    }

    impl CountingProvider {
        fn new(name: &'static str, scope: &'static str) -> Self {
            Self {
                name,
                scope,
                calls: AtomicUsize::new(0),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                fail_acquire: false,
            }
        }
    }

    #[async_trait]
    impl ToolProvider for CountingProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn instance_scope(&self) -> &str {
            self.scope
        }

        fn operations(&self) -> Vec<OperationSpec> {
            vec![
                OperationSpec::read("query", "Run a query").with_parameters(json!({
                    "type": "object",
                    "properties": {"expr": {"type": "string"}},
                    "required": ["expr"]
                })),
                OperationSpec::write("restart", "Restart the service"),
            ]
        }

        async fn acquire(&self) -> Result<(), String> {
            if self.fail_acquire {
                return Err("credentials expired".into());
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        async fn call(&self, operation: &str, args: Value) -> Result<Value, String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"op": operation, "args": args, "call": n}))
        }
    }

    fn router() -> ToolRouter {
        ToolRouter::new(
            Arc::new(ToolCache::new(&CacheSection::default())),
            CallPolicy::new(&ToolsSection::default()),
        )
    }

    #[test]
    fn test_same_operation_on_two_scopes_registers() {
        let mut r = router();
        r.register(Arc::new(CountingProvider::new("prom", "http://a"))).unwrap();
        r.register(Arc::new(CountingProvider::new("prom", "http://b"))).unwrap();
        assert_eq!(r.schema_list().len(), 4);
    }

    #[test]
    fn test_collision_is_configuration_error() {
        let mut r = router();
        r.register(Arc::new(CountingProvider::new("prom", "http://a"))).unwrap();
        let err = r
            .register(Arc::new(CountingProvider::new("prom", "http://a")))
            .unwrap_err();
        assert!(matches!(err, ToolError::Configuration(_)));
        assert_eq!(r.schema_list().len(), 2);
    }

    #[test]
    fn test_invalid_provider_name_rejected() {
        let mut r = router();
        let err = r
            .register(Arc::new(CountingProvider::new("my_prom", "x")))
            .unwrap_err();
        assert!(matches!(err, ToolError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_calls_are_request_errors() {
        let mut r = router();
        r.register(Arc::new(CountingProvider::new("prom", "http://a"))).unwrap();

        let err = r.invoke("prom_deadbeef_query", json!({"expr": "up"})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
        assert!(err.is_request_error());

        let err = r.invoke("query", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));

        let name = scoped_name("prom", "http://a", "query");
        let err = r.invoke(&name, json!({"expr": 5})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_identical_calls_hit_cache() {
        let provider = Arc::new(CountingProvider::new("prom", "http://a"));
        let mut r = router();
        r.register(provider.clone()).unwrap();
        let name = scoped_name("prom", "http://a", "query");

        let first = r.invoke(&name, json!({"expr": "up", "unused": null})).await.unwrap();
        let second = r.invoke(&name, json!({"expr": "up"})).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.value, second.value);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let stats = r.cache().stats(Some("http://a"));
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_write_operations_bypass_cache() {
        let provider = Arc::new(CountingProvider::new("prom", "http://a"));
        let mut r = router();
        r.register(provider.clone()).unwrap();
        let name = scoped_name("prom", "http://a", "restart");

        r.invoke(&name, json!({})).await.unwrap();
        let again = r.invoke(&name, json!({})).await.unwrap();
        assert!(!again.cached);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(r.cache().stats(None).entries, 0);
    }

    #[tokio::test]
    async fn test_session_acquires_and_releases() {
        let provider = Arc::new(CountingProvider::new("prom", "http://a"));
        let mut r = router();
        r.register(provider.clone()).unwrap();
        let r = Arc::new(r);

        let session = r.open_session().await.unwrap();
        assert_eq!(provider.acquired.load(Ordering::SeqCst), 1);
        session
            .invoke(&scoped_name("prom", "http://a", "query"), json!({"expr": "up"}))
            .await
            .unwrap();
        session.release().await;
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_acquire_releases_earlier_providers() {
        let good = Arc::new(CountingProvider::new("prom", "http://a"));
        let mut bad = CountingProvider::new("loki", "http://l");
        bad.fail_acquire = true;
        let mut r = router();
        r.register(good.clone()).unwrap();
        r.register(Arc::new(bad)).unwrap();
        let r = Arc::new(r);

        let err = r.open_session().await.err().unwrap();
        assert!(matches!(err, ToolError::Acquire { ref provider, .. } if provider == "loki"));
        assert_eq!(good.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(good.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_session_still_releases() {
        let provider = Arc::new(CountingProvider::new("prom", "http://a"));
        let mut r = router();
        r.register(provider.clone()).unwrap();
        let r = Arc::new(r);

        let session = r.open_session().await.unwrap();
        drop(session);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
    }
}
