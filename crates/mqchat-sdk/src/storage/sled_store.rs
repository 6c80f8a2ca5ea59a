//! 基于 sled 的消息记录存储
//!
//! 记录以 bincode 编码存放在 `messages` tree 中，键为消息 id。

use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{MessageRecord, RecordStore};
use crate::error::{MqChatError, Result};
use crate::message::MessageStatus;

const MESSAGES_TREE: &str = "messages";

#[derive(Debug)]
pub struct SledRecordStore {
    path: PathBuf,
    db: Db,
    messages: Tree,
    /// 插入后立即刷盘
    flush_on_insert: bool,
}

impl SledRecordStore {
    /// 打开（或创建）存储
    ///
    /// 上一个实例刚退出时文件锁可能还没释放，带退避重试几次。
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let path = base_path.as_ref().join("records");
        std::fs::create_dir_all(&path)?;

        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut attempt = 0;
        let db = loop {
            match sled::open(&path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(MqChatError::Storage(format!("打开 sled 数据库失败: {}", e)));
                    }
                    warn!("⚠️ 记录库被占用，第 {} 次重试", attempt);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS << attempt));
                }
            }
        };

        let messages = db.open_tree(MESSAGES_TREE)?;
        info!("✅ 消息记录库已打开: {} ({} 条记录)", path.display(), messages.len());

        Ok(Self {
            path,
            db,
            messages,
            flush_on_insert: true,
        })
    }

    /// 关闭插入后的强制刷盘（测试或批量导入时使用）
    pub fn with_flush_on_insert(mut self, flush: bool) -> Self {
        self.flush_on_insert = flush;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 刷盘
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn encode(record: &MessageRecord) -> Result<Vec<u8>> {
        Ok(bincode::serialize(record)?)
    }

    fn decode(bytes: &[u8]) -> Result<MessageRecord> {
        bincode::deserialize(bytes)
            .map_err(|e| MqChatError::Storage(format!("记录解码失败: {}", e)))
    }

    fn modify<F>(&self, id: &str, f: F) -> Result<bool>
    where
        F: Fn(&mut MessageRecord),
    {
        let mut found = false;
        self.messages.fetch_and_update(id.as_bytes(), |old| {
            let bytes = old?;
            match Self::decode(bytes) {
                Ok(mut record) => {
                    f(&mut record);
                    record.updated_at = chrono::Utc::now().timestamp_millis();
                    found = true;
                    Self::encode(&record).ok().or_else(|| Some(bytes.to_vec()))
                }
                Err(e) => {
                    warn!("⚠️ 记录损坏，保持原样: {}: {}", id, e);
                    Some(bytes.to_vec())
                }
            }
        })?;
        Ok(found)
    }
}

impl RecordStore for SledRecordStore {
    fn insert(&self, record: &MessageRecord) -> Result<()> {
        self.messages.insert(record.id.as_bytes(), Self::encode(record)?)?;
        if self.flush_on_insert {
            self.messages.flush()?;
        }
        debug!("💾 已持久化消息记录: {}", record.id);
        Ok(())
    }

    fn upsert(&self, record: &MessageRecord) -> Result<bool> {
        let previous = self.messages.insert(record.id.as_bytes(), Self::encode(record)?)?;
        Ok(previous.is_none())
    }

    fn update_status(&self, id: &str, status: MessageStatus) -> Result<bool> {
        self.modify(id, |record| record.status = status)
    }

    fn update_retry_count(&self, id: &str, retry_count: u32) -> Result<bool> {
        self.modify(id, |record| record.retry_count = retry_count)
    }

    fn get(&self, id: &str) -> Result<Option<MessageRecord>> {
        match self.messages.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn query_pending(&self) -> Result<Vec<MessageRecord>> {
        let mut pending = Vec::new();
        for item in self.messages.iter() {
            let (key, value) = item?;
            match Self::decode(&value) {
                Ok(record) if record.is_pending() => pending.push(record),
                Ok(_) => {}
                Err(e) => warn!(
                    "⚠️ 跳过损坏的记录 {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        pending.sort_by_key(|record| record.timestamp);
        Ok(pending)
    }

    fn count(&self) -> Result<usize> {
        Ok(self.messages.len())
    }
}
