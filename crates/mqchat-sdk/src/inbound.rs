//! 入站消息分发
//!
//! 传输层收到的帧交给一个专门的任务处理：校验、解码、落盘（按 id 幂等），
//! 然后分发给订阅者。解码或落盘失败只记录日志并丢弃，入站可靠性依赖传输层的 QoS。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::MessageCodec;
use crate::error::{MqChatError, Result};
use crate::events::{DispatchMode, MainContext, ObserverId, ObserverRegistry};
use crate::message::{Message, MessageStatus};
use crate::storage::{MessageRecord, RecordDirection, RecordStore};
use crate::transport::{InboundFrame, Qos};

/// 单条帧的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// 新消息，已分发
    Delivered(Message),
    /// 本地已有同 id 的消息，未重复分发
    AlreadySeen(String),
}

/// 入站统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundStats {
    pub received: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

pub struct InboundDispatcher {
    store: Arc<dyn RecordStore>,
    codec: Arc<MessageCodec>,
    subscribers: ObserverRegistry<Message>,
    /// 本端 uid，用于判断 `is_self`
    self_uid: Mutex<Option<String>>,
    sender: mpsc::UnboundedSender<InboundFrame>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<InboundFrame>>>,
    worker: Mutex<Option<JoinHandle<()>>>,

    received: AtomicU64,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
}

impl InboundDispatcher {
    pub fn new(store: Arc<dyn RecordStore>, codec: Arc<MessageCodec>, main: Arc<MainContext>) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            codec,
            subscribers: ObserverRegistry::new(main),
            self_uid: Mutex::new(None),
            sender,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// 设置本端 uid
    pub fn set_self_uid<S: Into<String>>(&self, uid: S) {
        *self.self_uid.lock() = Some(uid.into());
    }

    /// 注册消息订阅者
    pub fn add_subscriber<F>(&self, mode: DispatchMode, callback: F) -> ObserverId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.subscribers.add(mode, callback)
    }

    pub fn remove_subscriber(&self, id: ObserverId) -> bool {
        self.subscribers.remove(id)
    }

    /// 帧的入口，交给传输层的连接管理器
    pub fn sink(&self) -> mpsc::UnboundedSender<InboundFrame> {
        self.sender.clone()
    }

    /// 提交一帧给处理任务
    pub fn submit(&self, frame: InboundFrame) {
        if self.sender.send(frame).is_err() {
            warn!("⚠️ 入站处理任务已停止，丢弃消息");
        }
    }

    /// 启动处理任务，只能启动一次
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| MqChatError::Config("入站处理任务已启动".to_string()))?;

        let this = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                let dispatcher = match this.upgrade() {
                    Some(dispatcher) => dispatcher,
                    None => break,
                };
                dispatcher.handle_frame(frame);
            }
            debug!("入站处理任务退出");
        });
        *self.worker.lock() = Some(handle);
        info!("✅ 入站处理任务已启动");
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }

    fn handle_frame(&self, frame: InboundFrame) {
        if let Err(e) = self.process_received_message(&frame.topic, &frame.payload) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("⚠️ 丢弃入站消息 (topic={}): {}", frame.topic, e);
        }
    }

    /// 处理一帧：校验、解码、落盘、分发
    pub fn process_received_message(&self, topic: &str, raw: &[u8]) -> Result<InboundOutcome> {
        self.received.fetch_add(1, Ordering::Relaxed);
        if topic.is_empty() {
            return Err(MqChatError::Validation("主题为空".to_string()));
        }
        if raw.is_empty() {
            return Err(MqChatError::Validation("消息体为空".to_string()));
        }

        let mut message = self.codec.decode(raw, false)?;
        if let Some(uid) = self.self_uid.lock().as_deref() {
            message.is_self = message.from_uid == uid;
        }

        let record = MessageRecord {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            status: MessageStatus::Sent,
            retry_count: 0,
            topic: topic.to_string(),
            timestamp: message.timestamp,
            // 原始信封，压缩标记在信封内
            serialized_content: raw.to_vec(),
            is_compressed: false,
            high_priority: false,
            qos: Qos::default(),
            direction: RecordDirection::Inbound,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };

        // 本地已有同 id 记录（包括自己发出的消息回显）时不覆盖
        let exists = self.store.get(&record.id)?.is_some();
        let is_new = !exists
            && self.store.upsert(&record).map_err(|e| {
                error!("❌ 入站消息落盘失败: {}: {}", record.id, e);
                e
            })?;
        if !is_new {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!("重复投递的入站消息: {}", message.id);
            return Ok(InboundOutcome::AlreadySeen(message.id));
        }

        debug!("📨 收到消息: {} (topic={})", message.id, topic);
        self.subscribers.dispatch(&message);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(InboundOutcome::Delivered(message))
    }

    pub fn stats(&self) -> InboundStats {
        InboundStats {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
