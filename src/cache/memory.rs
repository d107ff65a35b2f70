//! 进程内 TTL 缓存（基于 DashMap）
//! 单节点部署与测试使用；过期时间来自注入的时钟

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::{CacheError, KvCache};
use crate::clock::Clock;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// 清理已过期的键，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn deadline(&self, ttl: Duration) -> Result<DateTime<Utc>, CacheError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| CacheError::Malformed {
            key: String::new(),
            reason: format!("ttl out of range: {e}"),
        })?;
        Ok(self.clock.now() + ttl)
    }

    fn malformed(key: &str, reason: &str) -> CacheError {
        CacheError::Malformed {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now();
        let found = match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => None,
            Some(entry) => match &entry.value {
                Value::Str(s) => Some(Ok(s.clone())),
                Value::Set(_) => Some(Err(Self::malformed(key, "expected string, found set"))),
            },
            None => return Ok(None),
        };

        match found {
            Some(result) => result.map(Some),
            None => {
                self.entries.remove_if(key, |_, entry| entry.is_expired(now));
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = self.deadline(ttl)?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, CacheError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn incr(&self, key: &str, window: Duration) -> Result<i64, CacheError> {
        let now = self.clock.now();
        let expires_at = self.deadline(window)?;
        let fresh = || Entry {
            value: Value::Str("0".to_string()),
            expires_at: Some(expires_at),
        };

        // 条目锁内完成创建、设置过期与自增
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(fresh);
        if entry.is_expired(now) {
            *entry = fresh();
        }

        match &mut entry.value {
            Value::Str(current) => {
                let next = current
                    .parse::<i64>()
                    .map_err(|_| Self::malformed(key, "value is not an integer"))?
                    + 1;
                *current = next.to_string();
                Ok(next)
            }
            Value::Set(_) => Err(Self::malformed(key, "expected counter, found set")),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = self.clock.now();
        let expires_at = self.deadline(ttl)?;
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), CacheError> {
        let now = self.clock.now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });

        if entry.is_expired(now) {
            *entry = Entry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            };
        }

        match &mut entry.value {
            Value::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            Value::Str(_) => Err(Self::malformed(key, "expected set, found string")),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), CacheError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if let Value::Set(members) = &mut entry.value {
                members.remove(member);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Set(members) => Ok(members.iter().cloned().collect()),
                Value::Str(_) => Err(Self::malformed(key, "expected set, found string")),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now();
        match self.entries.remove(key) {
            Some((_, entry)) if !entry.is_expired(now) => match entry.value {
                Value::Str(s) => Ok(Some(s)),
                Value::Set(_) => Err(Self::malformed(key, "expected string, found set")),
            },
            _ => Ok(None),
        }
    }
}
