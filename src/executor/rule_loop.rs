//! 规则控制循环：按关键词挑选诊断工具
//!
//! 未接入 LLM 时使用。第一步报告匹配到的诊断，第二步对每个目标实例调用对应工具，
//! 拿到观察结果后汇总为最终结果；内存使用率过高时附带行动项。

use async_trait::async_trait;
use serde_json::{json, Value};

use super::control_loop::{ControlLoop, LoopState, LoopStep, Observation, ToolCall};
use crate::core::LoopError;
use crate::tools::naming::unscoped_operation;

/// 超过该使用率（百分比）时生成行动项
const MEMORY_PRESSURE_PERCENT: f64 = 90.0;

struct Rule {
    keywords: &'static [&'static str],
    operation: &'static str,
    args: fn() -> Value,
}

fn no_args() -> Value {
    json!({})
}

fn disk_usage_args() -> Value {
    json!({ "command": "df -h" })
}

const RULES: &[Rule] = &[
    Rule {
        keywords: &["memory", "mem", "ram", "oom", "内存"],
        operation: "memory_usage",
        args: no_args,
    },
    Rule {
        keywords: &["load", "cpu", "slow", "负载"],
        operation: "load_average",
        args: no_args,
    },
    Rule {
        keywords: &["disk", "df", "磁盘"],
        operation: "run_command",
        args: disk_usage_args,
    },
    Rule {
        keywords: &["alert", "告警"],
        operation: "get_alerts",
        args: no_args,
    },
];

/// 关键词规则循环
#[derive(Debug, Default, Clone)]
pub struct KeywordLoop;

impl KeywordLoop {
    pub fn new() -> Self {
        Self
    }

    /// 按输入挑选工具调用，每个匹配的操作覆盖所有目标实例
    pub fn select_calls(&self, state: &LoopState) -> Vec<ToolCall> {
        let input = state.input.to_lowercase();
        let mut calls = Vec::new();
        for rule in RULES {
            if !rule.keywords.iter().any(|k| input.contains(k)) {
                continue;
            }
            for tool in &state.tools {
                if unscoped_operation(&tool.name) == rule.operation {
                    calls.push(ToolCall::new(&tool.name, (rule.args)()));
                }
            }
        }
        calls
    }

    fn summarize(&self, state: &LoopState) -> (String, Vec<String>) {
        let mut lines = vec![format!("Diagnostics for \"{}\":", state.input.trim())];
        let mut action_items = Vec::new();

        for obs in &state.observations {
            let operation = unscoped_operation(&obs.tool);
            if !obs.is_ok() {
                let detail = obs.result.get("detail").and_then(|d| d.as_str()).unwrap_or("unknown error");
                lines.push(format!("- {operation} failed: {detail}"));
                continue;
            }
            let data = obs.data().cloned().unwrap_or(Value::Null);
            lines.push(format!("- {}", describe(operation, &data)));
            if let Some(item) = action_item(operation, &data) {
                action_items.push(item);
            }
        }
        (lines.join("\n"), action_items)
    }
}

fn describe(operation: &str, data: &Value) -> String {
    let host = data.get("host").and_then(|h| h.as_str()).unwrap_or("target");
    match operation {
        "memory_usage" => format!(
            "memory on {host}: {}% used ({} of {} kB)",
            data["used_percent"], data["used_kb"], data["total_kb"]
        ),
        "load_average" => format!(
            "load on {host}: {} / {} / {} (1m / 5m / 15m)",
            data["load_1m"], data["load_5m"], data["load_15m"]
        ),
        "run_command" => format!(
            "command output:\n{}",
            data.get("stdout").and_then(|s| s.as_str()).unwrap_or("").trim_end()
        ),
        other => format!("{other}: {data}"),
    }
}

fn action_item(operation: &str, data: &Value) -> Option<String> {
    if operation != "memory_usage" {
        return None;
    }
    let used = data.get("used_percent")?.as_f64()?;
    (used >= MEMORY_PRESSURE_PERCENT).then(|| {
        let host = data.get("host").and_then(|h| h.as_str()).unwrap_or("target");
        format!("Investigate memory pressure on {host} ({used}% used)")
    })
}

#[async_trait]
impl ControlLoop for KeywordLoop {
    async fn next_step(&self, state: &LoopState) -> Result<LoopStep, LoopError> {
        if !state.observations.is_empty() {
            let (result, action_items) = self.summarize(state);
            return Ok(LoopStep::Finish {
                result,
                action_items,
            });
        }

        let calls = self.select_calls(state);
        if calls.is_empty() {
            let available: Vec<&str> = state
                .tools
                .iter()
                .map(|t| unscoped_operation(&t.name))
                .collect();
            return Ok(LoopStep::Finish {
                result: format!(
                    "No diagnostics matched \"{}\". Available operations: {}",
                    state.input.trim(),
                    available.join(", ")
                ),
                action_items: Vec::new(),
            });
        }

        if state.iteration <= 1 {
            let names: Vec<&str> = calls.iter().map(|c| unscoped_operation(&c.tool)).collect();
            return Ok(LoopStep::Progress(format!(
                "Running diagnostics: {}",
                names.join(", ")
            )));
        }
        Ok(LoopStep::CallTools(calls))
    }
}

/// 把一次观察转成简短文本，供日志或消息使用
pub fn observation_preview(obs: &Observation) -> String {
    let s = obs.result.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Capability, ToolDefinition};
    use serde_json::Map;

    fn state(input: &str) -> LoopState {
        let tool = |name: &str| ToolDefinition {
            name: name.to_string(),
            description: String::new(),
            parameter_schema: json!({"type": "object"}),
            capability_tag: Capability::Read,
        };
        LoopState {
            task_id: "task_1".into(),
            thread_id: "thread_1".into(),
            input: input.into(),
            messages: Vec::new(),
            context: Map::new(),
            tools: vec![
                tool("host_aaaaaaaa_memory_usage"),
                tool("host_bbbbbbbb_memory_usage"),
                tool("host_aaaaaaaa_load_average"),
            ],
            observations: Vec::new(),
            iteration: 1,
        }
    }

    #[tokio::test]
    async fn test_progress_then_calls_every_scope() {
        let loop_ = KeywordLoop::new();
        let mut s = state("Please check memory on web-1");
        assert!(matches!(loop_.next_step(&s).await.unwrap(), LoopStep::Progress(_)));

        s.iteration = 2;
        let LoopStep::CallTools(calls) = loop_.next_step(&s).await.unwrap() else {
            panic!("expected tool calls");
        };
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.tool.ends_with("_memory_usage")));
    }

    #[tokio::test]
    async fn test_no_match_finishes_immediately() {
        let loop_ = KeywordLoop::new();
        let step = loop_.next_step(&state("hello")).await.unwrap();
        assert!(matches!(step, LoopStep::Finish { ref result, .. } if result.contains("No diagnostics")));
    }

    #[tokio::test]
    async fn test_summary_and_action_items() {
        let loop_ = KeywordLoop::new();
        let mut s = state("check memory");
        s.observations.push(Observation {
            tool: "host_aaaaaaaa_memory_usage".into(),
            args: json!({}),
            result: json!({"status": "ok", "cached": false, "data": {
                "host": "web-1", "used_percent": 95.5, "used_kb": 955, "total_kb": 1000
            }}),
        });
        s.observations.push(Observation {
            tool: "host_bbbbbbbb_memory_usage".into(),
            args: json!({}),
            result: json!({"status": "error", "kind": "timeout", "detail": "timed out"}),
        });
        let LoopStep::Finish { result, action_items } = loop_.next_step(&s).await.unwrap() else {
            panic!("expected finish");
        };
        assert!(result.contains("memory on web-1: 95.5% used"));
        assert!(result.contains("memory_usage failed: timed out"));
        assert_eq!(action_items.len(), 1);
    }
}
