//! 工具结果缓存
//!
//! 内容寻址 + TTL：键为 (工具名, 规范化参数) 的哈希，值写入后不可变直至过期。
//! 存储按键分片，每片一把读写锁，不存在全局锁；命中/未命中按作用域（目标实例）计数，
//! 可按作用域清空以强制刷新某个实例而不影响其他实例。

pub mod key;
pub mod policy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::CacheSection;

pub use key::{canonical_json, canonicalize, CacheKey};
pub use policy::TtlPolicy;

const SHARDS: usize = 16;

/// 单条缓存
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub expires_at: Instant,
    /// 目标实例作用域
    pub scope: String,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// 命中统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// 工具结果缓存
pub struct ToolCache {
    enabled: bool,
    policy: TtlPolicy,
    shards: Vec<RwLock<HashMap<CacheKey, CacheEntry>>>,
    totals: Counters,
    per_scope: RwLock<HashMap<String, Arc<Counters>>>,
}

impl ToolCache {
    pub fn new(config: &CacheSection) -> Self {
        Self {
            enabled: config.enabled,
            policy: TtlPolicy::new(config),
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            totals: Counters::default(),
            per_scope: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    fn shard(&self, key: &CacheKey) -> &RwLock<HashMap<CacheKey, CacheEntry>> {
        &self.shards[key.shard(self.shards.len())]
    }

    fn scope_counters(&self, scope: &str) -> Arc<Counters> {
        if let Ok(map) = self.per_scope.read() {
            if let Some(c) = map.get(scope) {
                return Arc::clone(c);
            }
        }
        match self.per_scope.write() {
            Ok(mut map) => Arc::clone(map.entry(scope.to_string()).or_default()),
            Err(_) => Arc::new(Counters::default()),
        }
    }

    fn record(&self, scope: &str, hit: bool) {
        let scoped = self.scope_counters(scope);
        let (total, per) = if hit {
            (&self.totals.hits, &scoped.hits)
        } else {
            (&self.totals.misses, &scoped.misses)
        };
        total.fetch_add(1, Ordering::Relaxed);
        per.fetch_add(1, Ordering::Relaxed);
    }

    /// 查询；过期条目视为未命中并顺带移除
    pub fn get(&self, key: &CacheKey, scope: &str) -> Option<Value> {
        let now = Instant::now();
        let found = self
            .shard(key)
            .read()
            .ok()
            .and_then(|shard| shard.get(key).map(|e| (e.is_live(now), e.value.clone())));

        match found {
            Some((true, value)) => {
                self.record(scope, true);
                Some(value)
            }
            Some((false, _)) => {
                if let Ok(mut shard) = self.shard(key).write() {
                    if shard.get(key).is_some_and(|e| !e.is_live(now)) {
                        shard.remove(key);
                    }
                }
                self.record(scope, false);
                None
            }
            None => {
                self.record(scope, false);
                None
            }
        }
    }

    /// 写入；已有未过期条目时保持原值（条目写入后不可变）。ttl 为零不写入
    pub fn put(&self, key: CacheKey, scope: &str, value: Value, ttl: Duration) {
        if !self.enabled || ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            expires_at: now + ttl,
            scope: scope.to_string(),
        };
        if let Ok(mut shard) = self.shard(&key).write() {
            match shard.get(&key) {
                Some(existing) if existing.is_live(now) => {}
                _ => {
                    shard.insert(key, entry);
                }
            }
        }
    }

    /// 清空缓存；scope 为 None 时清空全部。返回移除条数
    pub fn clear(&self, scope: Option<&str>) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            if let Ok(mut shard) = shard.write() {
                let before = shard.len();
                match scope {
                    Some(s) => shard.retain(|_, e| e.scope != s),
                    None => shard.clear(),
                }
                removed += before - shard.len();
            }
        }
        tracing::info!(scope = ?scope, removed, "tool cache cleared");
        removed
    }

    /// 统计；entries 只计未过期条目
    pub fn stats(&self, scope: Option<&str>) -> CacheStats {
        let now = Instant::now();
        let entries = self
            .shards
            .iter()
            .filter_map(|s| s.read().ok())
            .map(|shard| {
                shard
                    .values()
                    .filter(|e| e.is_live(now) && scope.map_or(true, |s| e.scope == s))
                    .count()
            })
            .sum();

        let (hits, misses) = match scope {
            None => (
                self.totals.hits.load(Ordering::Relaxed),
                self.totals.misses.load(Ordering::Relaxed),
            ),
            Some(s) => self
                .per_scope
                .read()
                .ok()
                .and_then(|map| {
                    map.get(s).map(|c| {
                        (
                            c.hits.load(Ordering::Relaxed),
                            c.misses.load(Ordering::Relaxed),
                        )
                    })
                })
                .unwrap_or((0, 0)),
        };

        CacheStats {
            hits,
            misses,
            entries,
        }
    }

    /// 移除所有过期条目
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            if let Ok(mut shard) = shard.write() {
                let before = shard.len();
                shard.retain(|_, e| e.is_live(now));
                removed += before - shard.len();
            }
        }
        removed
    }
}
