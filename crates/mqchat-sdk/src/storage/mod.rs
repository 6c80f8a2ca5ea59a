//! 存储模块 - 消息记录的持久化层
//!
//! - `RecordStore`: 投递队列与入站分发依赖的窄接口
//! - `SledRecordStore`: 基于 sled 的持久化实现
//! - `MemoryRecordStore`: 进程内实现，用于测试和无持久化场景

pub mod sled_store;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{MqChatError, Result};
use crate::message::MessageStatus;
use crate::transport::Qos;

pub use sled_store::SledRecordStore;

/// 消息方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordDirection {
    /// 本端发出
    Outbound,
    /// 收到的
    Inbound,
}

/// 持久化的消息记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub topic: String,
    /// 消息时间戳（毫秒）
    pub timestamp: i64,
    /// 编码后的信封
    pub serialized_content: Vec<u8>,
    pub is_compressed: bool,
    pub high_priority: bool,
    pub qos: Qos,
    pub direction: RecordDirection,
    /// 最后修改时间（毫秒）
    pub updated_at: i64,
}

impl MessageRecord {
    pub fn is_pending(&self) -> bool {
        self.direction == RecordDirection::Outbound && self.status == MessageStatus::Sending
    }
}

/// 消息记录存储
///
/// 所有方法都是同步的：入队时必须在调用线程上先落盘，再进入内存队列。
pub trait RecordStore: Send + Sync {
    /// 插入记录，同 id 覆盖
    fn insert(&self, record: &MessageRecord) -> Result<()>;

    /// 按 id 写入，返回是否为新记录
    fn upsert(&self, record: &MessageRecord) -> Result<bool>;

    /// 更新状态，记录不存在时返回 false
    fn update_status(&self, id: &str, status: MessageStatus) -> Result<bool>;

    /// 更新重试次数，记录不存在时返回 false
    fn update_retry_count(&self, id: &str, retry_count: u32) -> Result<bool>;

    fn get(&self, id: &str) -> Result<Option<MessageRecord>>;

    /// 所有待投递（发出且状态为 Sending）的记录，按时间戳升序
    fn query_pending(&self) -> Result<Vec<MessageRecord>>;

    fn count(&self) -> Result<usize>;
}

/// 进程内记录存储
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, MessageRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的写操作全部失败
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MqChatError::Storage("simulated write failure".to_string()));
        }
        Ok(())
    }

    fn modify<F>(&self, id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut MessageRecord),
    {
        self.check_writable()?;
        let mut records = self.records.write();
        match records.get_mut(id) {
            Some(record) => {
                f(record);
                record.updated_at = chrono::Utc::now().timestamp_millis();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert(&self, record: &MessageRecord) -> Result<()> {
        self.check_writable()?;
        self.records.write().insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn upsert(&self, record: &MessageRecord) -> Result<bool> {
        self.check_writable()?;
        Ok(self
            .records
            .write()
            .insert(record.id.clone(), record.clone())
            .is_none())
    }

    fn update_status(&self, id: &str, status: MessageStatus) -> Result<bool> {
        self.modify(id, |record| record.status = status)
    }

    fn update_retry_count(&self, id: &str, retry_count: u32) -> Result<bool> {
        self.modify(id, |record| record.retry_count = retry_count)
    }

    fn get(&self, id: &str) -> Result<Option<MessageRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn query_pending(&self) -> Result<Vec<MessageRecord>> {
        let mut pending: Vec<MessageRecord> = self
            .records
            .read()
            .values()
            .filter(|record| record.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|record| record.timestamp);
        Ok(pending)
    }

    fn count(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;

    pub fn record(id: &str, status: MessageStatus, timestamp: i64) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            conversation_id: "conv-1".to_string(),
            status,
            retry_count: 0,
            topic: "chat/conv-1".to_string(),
            timestamp,
            serialized_content: vec![1, 2, 3],
            is_compressed: false,
            high_priority: false,
            qos: Qos::AtLeastOnce,
            direction: RecordDirection::Outbound,
            updated_at: timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::record;
    use super::*;

    #[test]
    fn test_memory_store_pending_query() {
        let store = MemoryRecordStore::new();
        store.insert(&record("m2", MessageStatus::Sending, 20)).unwrap();
        store.insert(&record("m1", MessageStatus::Sending, 10)).unwrap();
        store.insert(&record("m3", MessageStatus::Sent, 30)).unwrap();

        let mut inbound = record("m4", MessageStatus::Sending, 5);
        inbound.direction = RecordDirection::Inbound;
        store.insert(&inbound).unwrap();

        let pending: Vec<String> = store
            .query_pending()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(pending, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[test]
    fn test_memory_store_updates() {
        let store = MemoryRecordStore::new();
        store.insert(&record("m1", MessageStatus::Sending, 10)).unwrap();

        assert!(store.update_status("m1", MessageStatus::Sent).unwrap());
        assert!(store.update_retry_count("m1", 2).unwrap());
        assert!(!store.update_status("missing", MessageStatus::Sent).unwrap());

        let stored = store.get("m1").unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.retry_count, 2);
    }

    #[test]
    fn test_memory_store_upsert_and_failures() {
        let store = MemoryRecordStore::new();
        assert!(store.upsert(&record("m1", MessageStatus::Sent, 10)).unwrap());
        assert!(!store.upsert(&record("m1", MessageStatus::Sent, 10)).unwrap());
        assert_eq!(store.count().unwrap(), 1);

        store.set_fail_writes(true);
        assert!(matches!(
            store.insert(&record("m2", MessageStatus::Sending, 10)),
            Err(MqChatError::Storage(_))
        ));
    }
}
