//! 出站投递队列
//!
//! 两条 FIFO 通道（高优先级、普通），一个处理循环。每轮先处理高优先级通道，
//! 每个通道最多取 `batch_size` 条，并受 `batch_budget_ms` 时间预算限制。
//!
//! - 入队时先同步写入记录存储，再放入内存通道；两步之间崩溃也能从存储恢复
//! - 未连接：请求连接，固定延迟后放回原通道，不增加重试次数
//! - 已连接：publish，确认成功标记 Sent；失败则重试次数 +1，`基础延迟 * 重试次数` 后重新入队
//! - 重试次数超过上限：标记 Failed 并移出队列，只发生一次

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::LinearBackoff;
use crate::codec::MessageCodec;
use crate::config::QueueConfig;
use crate::connection::ConnectionManager;
use crate::error::{codes, MqChatError, Result};
use crate::events::{SendEvent, SendListenerRegistry};
use crate::message::{Message, MessageStatus, QueuedMessage};
use crate::storage::{MessageRecord, RecordDirection, RecordStore};
use crate::timer::TimerService;
use crate::transport::Qos;

/// 队列中的一项：消息加上编码好的信封
#[derive(Debug, Clone)]
struct QueueItem {
    queued: QueuedMessage,
    payload: Bytes,
}

/// 一条通道的收发两端
struct Lane {
    sender: Sender<QueueItem>,
    receiver: Receiver<QueueItem>,
}

impl Lane {
    fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }
}

/// 队列统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub high_lane: usize,
    pub normal_lane: usize,
    /// 队列持有的全部消息（通道中、等待重新入队、等待确认）
    pub outstanding: usize,
    pub in_flight: usize,
    pub enqueued: u64,
    pub sent: u64,
    pub failed: u64,
    pub retried: u64,
    pub canceled: u64,
}

pub struct DeliveryQueue {
    config: QueueConfig,
    /// 重试延迟 = 基础延迟 * 重试次数
    retry_backoff: LinearBackoff,
    store: Arc<dyn RecordStore>,
    connection: Arc<ConnectionManager>,
    codec: Arc<MessageCodec>,
    timer: Arc<TimerService>,
    listeners: Arc<SendListenerRegistry>,

    high: Lane,
    normal: Lane,
    /// 已取消、出队时直接丢弃的消息
    canceled_ids: DashSet<String>,

    outstanding: AtomicUsize,
    in_flight: AtomicUsize,
    enqueued_total: AtomicU64,
    sent_total: AtomicU64,
    failed_total: AtomicU64,
    retried_total: AtomicU64,
    canceled_total: AtomicU64,

    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryQueue {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn RecordStore>,
        connection: Arc<ConnectionManager>,
        codec: Arc<MessageCodec>,
        timer: Arc<TimerService>,
        listeners: Arc<SendListenerRegistry>,
    ) -> Arc<Self> {
        let retry_backoff = LinearBackoff::proportional(Duration::from_millis(config.retry_base_delay_ms));
        Arc::new(Self {
            config,
            retry_backoff,
            store,
            connection,
            codec,
            timer,
            listeners,
            high: Lane::new(),
            normal: Lane::new(),
            canceled_ids: DashSet::new(),
            outstanding: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            enqueued_total: AtomicU64::new(0),
            sent_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            retried_total: AtomicU64::new(0),
            canceled_total: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            worker: Mutex::new(None),
        })
    }

    /// 入队
    ///
    /// 在调用线程上同步落盘，成功后才放入内存通道。内存中的消息数达到
    /// `max_queue_size` 时返回 `QueueFull`，不写存储。
    pub fn enqueue(&self, message: Message, topic: &str, qos: Qos, high_priority: bool) -> Result<()> {
        let reserved = self.outstanding.fetch_add(1, Ordering::SeqCst);
        if reserved >= self.config.max_queue_size {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            warn!("⚠️ 投递队列已满 ({}), 拒绝消息: {}", self.config.max_queue_size, message.id);
            return Err(MqChatError::QueueFull(format!(
                "{} messages outstanding",
                self.config.max_queue_size
            )));
        }

        let queued = QueuedMessage::new(message, topic.to_string(), qos, high_priority);
        let item = match self.persist(&queued) {
            Ok(item) => item,
            Err(e) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                error!("❌ 消息落盘失败，未入队: {}: {}", queued.id(), e);
                return Err(e);
            }
        };

        let id = item.queued.id().to_string();
        self.enqueued_total.fetch_add(1, Ordering::Relaxed);
        self.push_lane(item);
        debug!(
            "📥 已入队: {} ({})",
            id,
            if high_priority { "高优先级" } else { "普通" }
        );
        self.notify_status(&id, MessageStatus::Sending);
        Ok(())
    }

    /// 写入记录存储，状态为 Sending
    fn persist(&self, queued: &QueuedMessage) -> Result<QueueItem> {
        let encoded = self.codec.encode(&queued.message)?;
        let record = MessageRecord {
            id: queued.message.id.clone(),
            conversation_id: queued.message.conversation_id.clone(),
            status: MessageStatus::Sending,
            retry_count: queued.retry_count,
            topic: queued.topic.clone(),
            timestamp: queued.message.timestamp,
            serialized_content: encoded.bytes.clone(),
            is_compressed: encoded.is_compressed,
            high_priority: queued.high_priority,
            qos: queued.qos,
            direction: RecordDirection::Outbound,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        self.store.insert(&record)?;
        Ok(QueueItem {
            queued: queued.clone(),
            payload: Bytes::from(encoded.bytes),
        })
    }

    /// 从记录存储恢复所有待投递的消息，按记录中的优先级放回对应通道
    pub fn restore_pending(&self) -> Result<usize> {
        let records = self.store.query_pending()?;
        let mut restored = 0;

        for record in records {
            let message = match self.codec.decode(&record.serialized_content, true) {
                Ok(message) => message.with_status(MessageStatus::Sending),
                Err(e) => {
                    error!("❌ 待投递记录无法解码，标记失败: {}: {}", record.id, e);
                    if let Err(e) = self.store.update_status(&record.id, MessageStatus::Failed) {
                        warn!("⚠️ 更新记录状态失败: {}: {}", record.id, e);
                    }
                    continue;
                }
            };

            let mut queued =
                QueuedMessage::new(message, record.topic.clone(), record.qos, record.high_priority);
            queued.retry_count = record.retry_count;

            self.outstanding.fetch_add(1, Ordering::SeqCst);
            self.push_lane(QueueItem {
                queued,
                payload: Bytes::from(record.serialized_content),
            });
            restored += 1;
        }

        if restored > 0 {
            info!("🔄 已从存储恢复 {} 条待投递消息", restored);
        }
        Ok(restored)
    }

    /// 取消一条尚未投递的消息，出队时丢弃
    ///
    /// 只有存储中仍为待投递的消息才会被标记，返回是否标记成功。
    pub fn cancel(&self, message_id: &str) -> bool {
        match self.store.get(message_id) {
            Ok(Some(record)) if record.is_pending() => {
                self.canceled_ids.insert(message_id.to_string());
                true
            }
            Ok(_) => {
                debug!("消息不在投递队列中，忽略取消: {}", message_id);
                false
            }
            Err(e) => {
                warn!("⚠️ 读取消息记录失败: {}: {}", message_id, e);
                false
            }
        }
    }

    /// 启动处理循环，已在运行时忽略
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("投递队列已在运行");
            return;
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();

        let this = Arc::clone(self);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let handle = tokio::spawn(async move {
            info!("✅ 投递队列处理循环已启动");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {
                        let processed = this.process_batch().await;
                        if processed > 0 {
                            debug!("本轮处理 {} 条消息", processed);
                        }
                    }
                }
            }
            info!("投递队列处理循环已停止");
        });
        *self.worker.lock() = Some(handle);
    }

    /// 停止处理循环；通道中的消息保留，已持久化的消息下次启动时恢复
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.lock().cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 处理一轮：先高优先级通道，再普通通道
    pub(crate) async fn process_batch(self: &Arc<Self>) -> usize {
        let deadline = Instant::now() + Duration::from_millis(self.config.batch_budget_ms);
        let mut processed = 0;

        for lane in [&self.high, &self.normal] {
            for _ in 0..self.config.batch_size {
                if Instant::now() >= deadline {
                    debug!("⏱️ 本轮时间预算用完");
                    return processed;
                }
                match lane.receiver.try_recv() {
                    Ok(item) => {
                        self.process_item(item).await;
                        processed += 1;
                    }
                    Err(_) => break,
                }
            }
        }
        processed
    }

    async fn process_item(self: &Arc<Self>, item: QueueItem) {
        let id = item.queued.id().to_string();

        if self.canceled_ids.remove(&id).is_some() {
            info!("已取消的消息出队，丢弃: {}", id);
            self.canceled_total.fetch_add(1, Ordering::Relaxed);
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        if item.queued.retry_count > self.config.max_retry_attempts {
            self.fail_terminal(item, "retry limit exceeded".to_string());
            return;
        }

        if !self.connection.is_connected() {
            self.requeue_when_disconnected(item);
            return;
        }

        let publish = self
            .connection
            .publish(&item.queued.topic, item.payload.clone(), item.queued.qos, &id)
            .await;

        match publish {
            Ok(ack) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                let timeout = Duration::from_secs(self.config.publish_timeout_secs);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    match ack.wait(timeout).await {
                        Ok(()) => this.on_delivered(item),
                        // 本地主动断开，不消耗重试次数
                        Err(MqChatError::TransientNetwork(_)) if this.connection.is_closing() => {
                            this.on_closed_in_flight(item)
                        }
                        Err(e) => this.on_delivery_failed(item, e),
                    }
                    this.in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            // 状态检查与 publish 之间连接断开
            Err(MqChatError::NotConnected) => self.requeue_when_disconnected(item),
            Err(e) => self.on_delivery_failed(item, e),
        }
    }

    /// 未连接：请求连接，固定延迟后放回原通道，重试次数不变
    fn requeue_when_disconnected(&self, item: QueueItem) {
        debug!("📡 未连接，稍后重新入队: {}", item.queued.id());
        self.connection.request_connect();
        self.reoffer(item, Duration::from_millis(self.config.reconnect_requeue_delay_ms));
    }

    /// 等待确认时连接被主动关闭：放回原通道，存储中保持 Sending，重试次数不变
    fn on_closed_in_flight(&self, item: QueueItem) {
        debug!("🔌 连接已关闭，等待确认的消息放回队列: {}", item.queued.id());
        self.reoffer(item, Duration::from_millis(self.config.reconnect_requeue_delay_ms));
    }

    fn on_delivered(&self, item: QueueItem) {
        let id = item.queued.id().to_string();
        self.canceled_ids.remove(&id);
        if let Err(e) = self.store.update_status(&id, MessageStatus::Sent) {
            error!("❌ 更新消息状态失败: {}: {}", id, e);
        }
        self.sent_total.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        info!("✅ 消息投递成功: {}", id);

        self.notify_status(&id, MessageStatus::Sent);
        self.listeners.dispatch(&SendEvent::SendSucceeded { message_id: id });
    }

    fn on_delivery_failed(&self, mut item: QueueItem, error: MqChatError) {
        item.queued.mark_retry();
        self.retried_total.fetch_add(1, Ordering::Relaxed);

        let id = item.queued.id().to_string();
        let retry_count = item.queued.retry_count;
        if let Err(e) = self.store.update_retry_count(&id, retry_count) {
            warn!("⚠️ 更新重试次数失败: {}: {}", id, e);
        }

        if retry_count > self.config.max_retry_attempts {
            self.fail_terminal(item, error.to_string());
            return;
        }

        let delay = self.retry_backoff.delay_for(retry_count);
        warn!(
            "⚠️ 投递失败，{}ms 后第 {} 次重试: {}: {}",
            delay.as_millis(),
            retry_count,
            id,
            error
        );
        self.reoffer(item, delay);
    }

    /// 标记为永久失败并移出队列
    fn fail_terminal(&self, item: QueueItem, last_error: String) {
        let id = item.queued.id().to_string();
        let attempts = item.queued.retry_count;
        self.canceled_ids.remove(&id);
        if let Err(e) = self.store.update_status(&id, MessageStatus::Failed) {
            error!("❌ 更新消息状态失败: {}: {}", id, e);
        }
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        error!("❌ 消息投递失败，已重试 {} 次: {}: {}", attempts, id, last_error);

        let error = MqChatError::RetryExhausted { attempts, last_error };
        self.notify_status(&id, MessageStatus::Failed);
        self.listeners.dispatch(&SendEvent::SendFailed {
            message_id: id,
            code: codes::RETRY_EXHAUSTED,
            reason: error.to_string(),
        });
    }

    fn reoffer(&self, item: QueueItem, delay: Duration) {
        let sender = if item.queued.high_priority {
            self.high.sender.clone()
        } else {
            self.normal.sender.clone()
        };
        self.timer.schedule(delay, move || {
            if sender.send(item).is_err() {
                warn!("⚠️ 投递队列已释放，放弃重新入队");
            }
        });
    }

    fn push_lane(&self, item: QueueItem) {
        let lane = if item.queued.high_priority {
            &self.high
        } else {
            &self.normal
        };
        // 发送端和接收端都由队列持有，不会断开
        let _ = lane.sender.send(item);
    }

    fn notify_status(&self, message_id: &str, status: MessageStatus) {
        self.listeners.dispatch(&SendEvent::StatusChanged {
            message_id: message_id.to_string(),
            status,
        });
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            high_lane: self.high.receiver.len(),
            normal_lane: self.normal.receiver.len(),
            outstanding: self.outstanding.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            enqueued: self.enqueued_total.load(Ordering::Relaxed),
            sent: self.sent_total.load(Ordering::Relaxed),
            failed: self.failed_total.load(Ordering::Relaxed),
            retried: self.retried_total.load(Ordering::Relaxed),
            canceled: self.canceled_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use crate::compression::Compressor;

    pub fn fast_queue_config() -> QueueConfig {
        QueueConfig {
            max_retry_attempts: 2,
            retry_base_delay_ms: 10,
            poll_interval_ms: 10,
            reconnect_requeue_delay_ms: 20,
            publish_timeout_secs: 2,
            ..QueueConfig::default()
        }
    }

    pub fn queue_with(
        config: QueueConfig,
        store: Arc<dyn RecordStore>,
        connection: Arc<ConnectionManager>,
        listeners: Arc<SendListenerRegistry>,
    ) -> Arc<DeliveryQueue> {
        DeliveryQueue::new(
            config,
            store,
            connection,
            Arc::new(MessageCodec::new(Arc::new(Compressor::new(1024, 3)))),
            TimerService::start(),
            listeners,
        )
    }
}
