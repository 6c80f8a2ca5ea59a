use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{ConnectOptions, Qos, Transport, TransportEvent, TransportEventSender};
use crate::error::{MqChatError, Result};

/// publish 之后 broker 的确认方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// 立即确认成功
    Success,
    /// 立即确认失败
    Failure,
    /// 不确认（模拟确认丢失）
    Silent,
}

/// 已发布的帧
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub message_id: String,
}

/// 进程内回环 broker
///
/// 发布到已订阅主题的消息会作为 `MessageArrived` 回送；可以注入连接失败、
/// publish 拒绝、确认失败和断线，用于测试与本地演示。
#[derive(Debug)]
pub struct MemoryTransport {
    events: Mutex<Option<TransportEventSender>>,
    connected: AtomicBool,
    /// 接下来需要失败的连接次数
    fail_connects: AtomicU32,
    connect_delay: Mutex<Duration>,
    reject_publish: AtomicBool,
    ack_mode: Mutex<AckMode>,
    subscriptions: Mutex<HashMap<String, Qos>>,
    published: Mutex<Vec<PublishedFrame>>,
    last_options: Mutex<Option<ConnectOptions>>,
    connect_calls: AtomicU32,
    publish_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    close_calls: AtomicU32,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(None),
            connected: AtomicBool::new(false),
            fail_connects: AtomicU32::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            reject_publish: AtomicBool::new(false),
            ack_mode: Mutex::new(AckMode::Success),
            subscriptions: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            last_options: Mutex::new(None),
            connect_calls: AtomicU32::new(0),
            publish_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
        }
    }

    /// 接下来 `count` 次连接失败
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    /// 每次连接前等待一段时间
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// publish 调用直接返回错误
    pub fn set_reject_publish(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::SeqCst);
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        *self.ack_mode.lock() = mode;
    }

    /// 模拟连接断开
    pub fn drop_connection(&self, reason: &str) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(TransportEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        }
    }

    /// 模拟 broker 推送一条消息
    pub fn inject_message(&self, topic: &str, payload: Bytes) {
        self.emit(TransportEvent::MessageArrived {
            topic: topic.to_string(),
            payload,
        });
    }

    /// 手动确认某条消息
    pub fn complete_delivery(&self, message_id: &str, result: std::result::Result<(), String>) {
        self.emit(TransportEvent::DeliveryComplete {
            message_id: message_id.to_string(),
            result,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishedFrame> {
        self.published.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.last_options.lock().clone()
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> u32 {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(sender) = self.events.lock().as_ref() {
            let _ = sender.send(event);
        }
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .keys()
            .any(|filter| topic_matches(filter, topic))
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// MQTT 主题过滤匹配，支持 `+` 与 `#`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, options: &ConnectOptions, events: TransportEventSender) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(options.clone());

        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(MqChatError::TransientNetwork("broker unreachable".to_string()));
        }

        *self.events.lock() = Some(events);
        self.connected.store(true, Ordering::SeqCst);
        debug!("memory broker 已连接: client_id={}", options.client_id);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: Qos, message_id: &str) -> Result<()> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(MqChatError::NotConnected);
        }
        if self.reject_publish.load(Ordering::SeqCst) {
            return Err(MqChatError::PublishFailure("broker rejected publish".to_string()));
        }

        self.published.lock().push(PublishedFrame {
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
            message_id: message_id.to_string(),
        });

        if self.is_subscribed(topic) {
            self.inject_message(topic, payload);
        }

        let mode = *self.ack_mode.lock();
        match mode {
            AckMode::Success => self.complete_delivery(message_id, Ok(())),
            AckMode::Failure => self.complete_delivery(message_id, Err("broker nack".to_string())),
            AckMode::Silent => {}
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<()> {
        if !self.is_connected() {
            return Err(MqChatError::NotConnected);
        }
        self.subscriptions.lock().insert(topic.to_string(), qos);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(MqChatError::NotConnected);
        }
        self.subscriptions.lock().remove(topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        *self.events.lock() = None;
        self.subscriptions.lock().clear();
        Ok(())
    }
}
