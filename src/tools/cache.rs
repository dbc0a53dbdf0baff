//! 工具结果 TTL 缓存
//!
//! 键为 (工具名, 归一化参数)，归一化时对象键递归排序，使 `{"a":1,"b":2}` 与 `{"b":2,"a":1}` 命中同一条目。
//! DashMap 分片锁支持所有 Worker 并发 GET/PUT；过期条目读取时忽略并惰性清除，Worker 池的扫描循环定期整体清理。

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

use crate::tools::DiagnosticEnvelope;

struct CacheEntry {
    envelope: DiagnosticEnvelope,
    inserted: Instant,
}

pub struct ToolCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ToolCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, tool: &str, args: &Value) -> Option<DiagnosticEnvelope> {
        let key = cache_key(tool, args);
        // Ref 在闭包结束时释放，之后才能 remove（同分片持锁 remove 会死锁）
        let hit = self
            .entries
            .get(&key)
            .map(|entry| (entry.inserted.elapsed() < self.ttl).then(|| entry.envelope.clone()));
        match hit {
            Some(Some(envelope)) => Some(envelope),
            Some(None) => {
                self.entries.remove_if(&key, |_, e| e.inserted.elapsed() >= self.ttl);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, tool: &str, args: &Value, envelope: DiagnosticEnvelope) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.insert(
            cache_key(tool, args),
            CacheEntry {
                envelope,
                inserted: Instant::now(),
            },
        );
    }

    /// 清除所有过期条目，返回剩余条目数
    pub fn purge_expired(&self) -> usize {
        self.entries.retain(|_, e| e.inserted.elapsed() < self.ttl);
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn cache_key(tool: &str, args: &Value) -> String {
    format!("{tool}:{}", normalize_args(args))
}

/// 参数归一化：对象键递归排序后输出紧凑 JSON
pub fn normalize_args(args: &Value) -> String {
    let mut out = String::new();
    write_canonical(args, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
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
        // null 与空对象等价：都表示无参数
        Value::Null => out.push_str("{}"),
        other => out.push_str(&other.to_string()),
    }
}
