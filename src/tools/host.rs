//! 本机提供方：内存、负载与白名单命令
//!
//! 让二进制在没有外部监控后端时也能跑通完整链路。memory_usage / load_average 只读可缓存；
//! run_command 是 Write 能力，永不缓存，仅允许配置中的命令名（首词），并拦截危险子串。
//! 命令按空白切分后直接执行，不经过 shell；带 shell 元字符的命令一律拒绝。

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::ShellSection;
use crate::tools::provider::{OperationSpec, ToolProvider};

/// 即使白名单中有同名命令，也不允许带这些子串
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 不经 shell 执行，但这些字符出现即说明调用方想要 shell 语义，直接拒绝
const SHELL_METACHARS: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '\\', '\'', '"', '*', '?', '\n', '\r',
];

/// run_command 参数
#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct RunCommandArgs {
    /// 要执行的命令，首词必须在白名单中
    command: String,
}

pub struct HostProvider {
    hostname: String,
    proc_root: PathBuf,
    allowed_commands: HashSet<String>,
}

impl HostProvider {
    pub fn new(hostname: impl Into<String>, shell: &ShellSection) -> Self {
        Self {
            hostname: hostname.into(),
            proc_root: PathBuf::from("/proc"),
            allowed_commands: shell
                .allowed_commands
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    /// 使用替代的 /proc 目录（测试）
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    async fn memory_usage(&self) -> Result<Value, String> {
        let raw = tokio::fs::read_to_string(self.proc_root.join("meminfo"))
            .await
            .map_err(|e| format!("read meminfo: {e}"))?;
        let field = |name: &str| -> Option<u64> {
            raw.lines()
                .find(|l| l.starts_with(name))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse().ok())
        };
        let total = field("MemTotal:").ok_or("MemTotal missing")?;
        let available = field("MemAvailable:")
            .or_else(|| field("MemFree:"))
            .ok_or("MemAvailable missing")?;
        let used = total.saturating_sub(available);
        let used_percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 1000.0).round() / 10.0
        };
        Ok(json!({
            "host": self.hostname,
            "total_kb": total,
            "available_kb": available,
            "used_kb": used,
            "used_percent": used_percent,
        }))
    }

    async fn load_average(&self) -> Result<Value, String> {
        let raw = tokio::fs::read_to_string(self.proc_root.join("loadavg"))
            .await
            .map_err(|e| format!("read loadavg: {e}"))?;
        let parts: Vec<f64> = raw
            .split_whitespace()
            .take(3)
            .filter_map(|v| v.parse().ok())
            .collect();
        if parts.len() != 3 {
            return Err(format!("unexpected loadavg format: {}", raw.trim()));
        }
        Ok(json!({
            "host": self.hostname,
            "load_1m": parts[0],
            "load_5m": parts[1],
            "load_15m": parts[2],
        }))
    }

    fn check_command(&self, raw: &str) -> Result<(), String> {
        if let Some(c) = raw.chars().find(|c| SHELL_METACHARS.contains(c)) {
            return Err(format!("Shell metacharacter not allowed: {c:?}"));
        }
        let lower = raw.to_lowercase();
        if let Some(f) = FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(*f)) {
            return Err(format!("Forbidden pattern: {f}"));
        }
        let name = lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(format!("Command '{name}' not in allowlist"))
        }
    }

    async fn run_command(&self, args: &Value) -> Result<Value, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.check_command(command)?;
        tracing::info!(command = %command, host = %self.hostname, "host run_command");

        let mut words = command.split_whitespace();
        let program = words.next().unwrap_or_default();
        // 超时后调用被丢弃时连同子进程一起结束
        let output = Command::new(program)
            .args(words)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("Execution failed: {e}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(format!("Exit {:?}: {}", output.status.code(), stderr.trim()));
        }
        Ok(json!({ "stdout": stdout, "stderr": stderr }))
    }
}

#[async_trait]
impl ToolProvider for HostProvider {
    fn name(&self) -> &str {
        "host"
    }

    fn instance_scope(&self) -> &str {
        &self.hostname
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![
            OperationSpec::read("memory_usage", "Memory totals and usage percentage of the host"),
            OperationSpec::read("load_average", "1/5/15 minute load averages of the host"),
            OperationSpec::write("run_command", "Run an allowlisted diagnostic command on the host")
                .with_typed_parameters::<RunCommandArgs>(),
        ]
    }

    async fn call(&self, operation: &str, args: Value) -> Result<Value, String> {
        match operation {
            "memory_usage" => self.memory_usage().await,
            "load_average" => self.load_average().await,
            "run_command" => self.run_command(&args).await,
            other => Err(format!("unsupported operation: {other}")),
        }
    }
}
