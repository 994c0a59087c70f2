//! 缓存键：参数规范化 + 内容哈希
//!
//! 语义相同的调用（键顺序不同、`1.0` 与 `1`、显式 null 与缺省）必须落到同一个键上。

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// 规范化参数：对象键排序、去掉值为 null 的成员、整数值的浮点数转为整数；数组保持顺序
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                let v = &obj[key.as_str()];
                if v.is_null() {
                    continue;
                }
                out.insert(key.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => Value::Number(normalize_number(n)),
        other => other.clone(),
    }
}

fn normalize_number(n: &Number) -> Number {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                return Number::from(f as i64);
            }
        }
    }
    n.clone()
}

/// 规范化后的紧凑 JSON 文本（键有序）
///
/// serde_json 的 Map 在未开启 preserve_order 时本身按键排序，这里显式排序以不依赖该特性。
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&canonicalize(value), &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&obj[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// 缓存键：SHA-256(tool_name, canonical_args) 的十六进制
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(tool_name: &str, args: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tool_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(args).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 分片下标
    pub(crate) fn shard(&self, shards: usize) -> usize {
        let prefix = self.0.get(..8).unwrap_or("0");
        usize::from_str_radix(prefix, 16).unwrap_or(0) % shards.max(1)
    }
}
