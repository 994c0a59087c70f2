//! 工具调用策略：超时 + 有界重试 + 审计日志
//!
//! 每次尝试施加超时；仅超时触发重试（固定次数、固定间隔），提供方返回的错误直接上抛。
//! 每次调用输出一条结构化审计日志（JSON）。

use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::config::ToolsSection;
use crate::core::ToolError;

/// 包在基础调用外层的中间件
#[derive(Debug, Clone)]
pub struct CallPolicy {
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl CallPolicy {
    pub fn new(config: &ToolsSection) -> Self {
        Self {
            timeout: Duration::from_secs(config.tool_timeout_secs),
            attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 执行一次调用；`call` 每次尝试都会被重新调用
    pub async fn run<F, Fut>(&self, tool_name: &str, args: &Value, call: F) -> Result<Value, ToolError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        let start = Instant::now();
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            match timeout(self.timeout, call()).await {
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(detail)) => {
                    break Err(ToolError::Provider {
                        tool: tool_name.to_string(),
                        detail,
                    })
                }
                Err(_) if attempt < self.attempts => {
                    tracing::warn!(
                        tool = %tool_name,
                        attempt,
                        max_attempts = self.attempts,
                        "tool call timed out, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(_) => {
                    break Err(ToolError::Timeout {
                        tool: tool_name.to_string(),
                        attempts: attempt,
                    })
                }
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ToolError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        audit(tool_name, outcome, attempt, start.elapsed(), false, args);
        result
    }
}

/// 输出工具审计日志
pub(crate) fn audit(tool: &str, outcome: &str, attempts: u32, elapsed: Duration, cached: bool, args: &Value) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "ok": outcome == "ok",
        "outcome": outcome,
        "attempts": attempts,
        "cached": cached,
        "duration_ms": elapsed.as_millis() as u64,
        "args_preview": args_preview(args),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(attempts: u32) -> CallPolicy {
        CallPolicy::new(&ToolsSection {
            tool_timeout_secs: 1,
            retry_attempts: attempts,
            retry_delay_ms: 10,
            ..ToolsSection::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_then_fails() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = policy(3)
            .run("slow_00000000_op", &json!({}), || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!(null))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            result,
            Err(ToolError::Timeout {
                tool: "slow_00000000_op".into(),
                attempts: 3
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_one_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = policy(3)
            .run("flaky_00000000_op", &json!({}), || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(json!("ok"))
                }
            })
            .await;
        assert_eq!(result, Ok(json!("ok")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_provider_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = policy(3)
            .run("bad_00000000_op", &json!({}), || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("connection refused".to_string())
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ToolError::Provider { detail, .. }) if detail == "connection refused"));
    }
}
