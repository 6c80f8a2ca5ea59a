use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::DedupConfig;

/// 消息去重器
///
/// 以 `message_id:sha256(payload)` 为键记录最后一次出现的时间。
/// 在 TTL 窗口内再次出现视为重复；缓存按 TTL 过期清理，并且总数超过上限时
/// 按时间从旧到新淘汰到上限的 75%。
pub struct Deduplicator {
    /// 去重键 -> 最后出现时间
    entries: DashMap<String, Instant>,
    /// 去重窗口
    ttl: Duration,
    /// 最大缓存条数
    max_entries: usize,
}

/// 去重统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupStats {
    pub entries: usize,
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Deduplicator {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.ttl(), config.max_entries)
    }

    /// 计算内容的 SHA-256 十六进制摘要
    pub fn content_hash(payload: &[u8]) -> String {
        hex::encode(Sha256::digest(payload))
    }

    /// 去重键
    pub fn dedup_key(message_id: &str, payload: &[u8]) -> String {
        format!("{}:{}", message_id, Self::content_hash(payload))
    }

    /// 检查是否重复
    ///
    /// 窗口内命中返回 true 且不刷新时间；否则写入当前时间并返回 false。
    pub fn is_duplicate(&self, message_id: &str, payload: &[u8]) -> bool {
        let key = Self::dedup_key(message_id, payload);
        let now = Instant::now();

        let duplicate = match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) <= self.ttl {
                    true
                } else {
                    entry.insert(now);
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                false
            }
        };

        if duplicate {
            debug!("🔄 检测到重复消息: message_id={}", message_id);
            return true;
        }

        if self.entries.len() > self.max_entries {
            self.evict_oldest();
        }
        false
    }

    /// 撤销一次登记，让同一条消息可以重新发送
    ///
    /// 用于 `is_duplicate` 之后发送没有真正进入队列的情况。
    pub fn forget(&self, message_id: &str, payload: &[u8]) -> bool {
        let removed = self
            .entries
            .remove(&Self::dedup_key(message_id, payload))
            .is_some();
        if removed {
            debug!("撤销去重登记: message_id={}", message_id);
        }
        removed
    }

    /// 清理过期记录，返回清理条数
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, seen| now.duration_since(*seen) <= self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!(
                "🧹 清理过期去重记录: 移除了 {} 条记录，剩余 {} 条",
                removed,
                self.entries.len()
            );
        }
        removed
    }

    /// 超过上限时淘汰最旧的记录到上限的 75%，返回淘汰条数
    pub fn evict_oldest(&self) -> usize {
        let len = self.entries.len();
        if len <= self.max_entries {
            return 0;
        }
        let target = self.max_entries * 3 / 4;

        let mut snapshot: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        snapshot.sort_by_key(|(_, seen)| *seen);

        let excess = snapshot.len().saturating_sub(target);
        for (key, _) in snapshot.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        info!("🧹 去重缓存超限，淘汰 {} 条最旧记录（上限 {}）", excess, self.max_entries);
        excess
    }

    /// 完整的一轮清理：先按 TTL，再按数量
    pub fn sweep(&self) {
        self.cleanup_expired();
        self.evict_oldest();
    }

    /// 启动后台定期清理
    ///
    /// 任务只持有弱引用，去重器被释放后自动退出。
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(dedup) => dedup.sweep(),
                    None => break,
                }
            }
            debug!("去重清理任务退出");
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
            ttl: self.ttl,
        }
    }

    /// 清空所有记录
    pub fn clear(&self) {
        self.entries.clear();
        info!("消息去重缓存已清空");
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::from_config(&DedupConfig::default())
    }
}
