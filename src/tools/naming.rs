//! 作用域工具名：`{provider}_{scope_hash}_{operation}`
//!
//! 两个不同目标实例上同名的操作（例如两套 Prometheus 的 `query`）在同一会话里同时存在时
//! 不会冲突。scope_hash 取实例作用域字符串 SHA-256 的前 8 位十六进制。

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// scope_hash 长度（十六进制字符）
pub const SCOPE_HASH_LEN: usize = 8;

static SCOPED_NAME_RE: OnceLock<Regex> = OnceLock::new();
static PROVIDER_NAME_RE: OnceLock<Regex> = OnceLock::new();
static OPERATION_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn scoped_name_re() -> &'static Regex {
    SCOPED_NAME_RE.get_or_init(|| {
        Regex::new(r"^([a-z][a-z0-9-]*)_([0-9a-f]{8})_([a-z][a-z0-9_]*)$").expect("valid regex")
    })
}

/// 提供方名：小写字母开头，仅字母数字和连字符（不含下划线，保证可逆解析）
pub fn is_valid_provider_name(name: &str) -> bool {
    PROVIDER_NAME_RE
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]*$").expect("valid regex"))
        .is_match(name)
}

pub fn is_valid_operation_name(name: &str) -> bool {
    OPERATION_NAME_RE
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid regex"))
        .is_match(name)
}

pub fn scope_hash(instance_scope: &str) -> String {
    let digest = Sha256::digest(instance_scope.as_bytes());
    hex::encode(digest)[..SCOPE_HASH_LEN].to_string()
}

pub fn scoped_name(provider: &str, instance_scope: &str, operation: &str) -> String {
    format!("{}_{}_{}", provider, scope_hash(instance_scope), operation)
}

/// 解析后的作用域名
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopedName<'a> {
    pub provider: &'a str,
    pub scope_hash: &'a str,
    pub operation: &'a str,
}

pub fn parse_scoped_name(name: &str) -> Option<ScopedName<'_>> {
    let caps = scoped_name_re().captures(name)?;
    Some(ScopedName {
        provider: caps.get(1)?.as_str(),
        scope_hash: caps.get(2)?.as_str(),
        operation: caps.get(3)?.as_str(),
    })
}

/// 去掉提供方与哈希前缀；不是作用域名时原样返回
pub fn unscoped_operation(name: &str) -> &str {
    parse_scoped_name(name).map_or(name, |p| p.operation)
}
