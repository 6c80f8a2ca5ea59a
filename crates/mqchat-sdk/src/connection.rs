//! broker 连接管理
//!
//! 状态机：
//!
//! ```text
//! Disconnected --connect()--> Connecting --成功--> Connected
//!                              Connecting --失败--> Disconnected（未超过次数则安排重连）
//! Connected --断开--> Disconnected（安排重连）
//! Disconnected --安排重连--> Reconnecting --定时器到期--> Connecting
//! ```
//!
//! 传输层事件（投递确认、断线、收到消息）来自传输层自己的任务，与投递队列并发；
//! 状态用原子量保存，待确认的 publish 用并发 map 保存。

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::ConnectionConfig;
use crate::error::{MqChatError, Result};
use crate::network::ReachabilityOracle;
use crate::timer::{TimerKey, TimerService};
use crate::transport::{
    ConnectOptions, CredentialsProvider, InboundFrame, Qos, Transport, TransportEvent,
    TransportEventReceiver,
};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// 未连接
    Disconnected = 0,
    /// 连接中
    Connecting = 1,
    /// 已连接
    Connected = 2,
    /// 等待重连定时器
    Reconnecting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "未连接"),
            ConnectionState::Connecting => write!(f, "连接中"),
            ConnectionState::Connected => write!(f, "已连接"),
            ConnectionState::Reconnecting => write!(f, "重连中"),
        }
    }
}

/// 安排重连的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// 连接尝试失败，计入退避次数
    TransportFailure,
    /// 已建立的连接断开，计入退避次数
    ConnectionLost,
    /// 网络不可用，固定延迟，不计入退避次数
    NetworkUnavailable,
}

/// 连接事件
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected,
    ConnectFailed {
        reason: String,
        attempts: u32,
    },
    ConnectionLost {
        reason: String,
    },
    ReconnectScheduled {
        delay: Duration,
        attempts: u32,
        reason: ReconnectReason,
    },
    /// 达到最大重连次数，不再自动重连
    ReconnectExhausted {
        attempts: u32,
    },
}

/// 连接统计
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub client_id: String,
    pub reconnect_attempts: u32,
    pub pending_publishes: usize,
    pub subscriptions: usize,
    pub reconnect_pending: bool,
}

type PendingMap = DashMap<String, oneshot::Sender<Result<()>>>;

/// 一次 publish 的确认句柄
pub struct PublishAck {
    message_id: String,
    receiver: oneshot::Receiver<Result<()>>,
    pending: Weak<PendingMap>,
}

impl PublishAck {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// 等待 broker 确认
    ///
    /// 超时后移除登记的回调并返回 `Timeout`。
    pub async fn wait(self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MqChatError::PublishFailure(format!(
                "确认通道已关闭: {}",
                self.message_id
            ))),
            Err(_) => {
                if let Some(pending) = self.pending.upgrade() {
                    pending.remove(&self.message_id);
                }
                Err(MqChatError::Timeout(format!("等待确认超时: {}", self.message_id)))
            }
        }
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    client_id: String,
    transport: Arc<dyn Transport>,
    reachability: Arc<dyn ReachabilityOracle>,
    credentials: Arc<dyn CredentialsProvider>,
    timer: Arc<TimerService>,
    backoff: ExponentialBackoff,

    state: AtomicU8,
    /// 传输层失败次数，连接成功后清零
    attempts: AtomicU32,
    /// 是否已有重连定时器
    reconnect_pending: AtomicBool,
    reconnect_key: Mutex<Option<TimerKey>>,
    /// 传输句柄已打开，需要关闭
    session_open: AtomicBool,
    /// 主动断开后不再自动重连
    closing: AtomicBool,

    /// 按 message id 登记的确认回调
    pending: Arc<PendingMap>,
    /// 已成功订阅的主题，重连后恢复
    subscriptions: DashMap<String, Qos>,

    events: broadcast::Sender<ConnectionEvent>,
    inbound_sink: Mutex<Option<mpsc::UnboundedSender<InboundFrame>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        reachability: Arc<dyn ReachabilityOracle>,
        credentials: Arc<dyn CredentialsProvider>,
        timer: Arc<TimerService>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let client_id = generate_client_id(&config.client_id_prefix);
        let backoff =
            ExponentialBackoff::from_millis(config.reconnect_base_delay_ms, config.reconnect_max_delay_ms);

        Arc::new(Self {
            config,
            client_id,
            transport,
            reachability,
            credentials,
            timer,
            backoff,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            attempts: AtomicU32::new(0),
            reconnect_pending: AtomicBool::new(false),
            reconnect_key: Mutex::new(None),
            session_open: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            pending: Arc::new(DashMap::new()),
            subscriptions: DashMap::new(),
            events,
            inbound_sink: Mutex::new(None),
            event_loop: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 手动清零重连次数（例如用户点击重试）
    pub fn reset_reconnect_attempts(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// 订阅连接事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// 是否正在主动断开（`disconnect()` 之后、下一次 `connect()` 之前）
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// 设置收到消息的去处
    pub fn set_inbound_sink(&self, sink: mpsc::UnboundedSender<InboundFrame>) {
        *self.inbound_sink.lock() = Some(sink);
    }

    /// 建立连接
    ///
    /// 已在连接中或已连接时直接返回。网络不可用时按固定延迟安排重连，
    /// 不计入退避次数。
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("连接已在进行或已建立，忽略 connect()");
                return Ok(());
            }
            _ => {}
        }
        self.closing.store(false, Ordering::SeqCst);

        if !self.reachability.is_available() {
            warn!("📡 网络不可用，稍后重试连接");
            self.schedule_reconnect(ReconnectReason::NetworkUnavailable);
            return Err(MqChatError::TransientNetwork("network unavailable".to_string()));
        }

        // 只有一个调用方能把状态切到 Connecting
        let entered = self.transition(ConnectionState::Disconnected, ConnectionState::Connecting)
            || self.transition(ConnectionState::Reconnecting, ConnectionState::Connecting);
        if !entered {
            debug!("并发 connect()，由另一个调用方处理");
            return Ok(());
        }

        let options = ConnectOptions {
            broker_url: self.config.broker_url.clone(),
            client_id: self.client_id.clone(),
            keep_alive: Duration::from_secs(self.config.keep_alive_secs),
            connect_timeout: self.config.connect_timeout(),
            clean_session: self.config.clean_session,
            max_inflight: self.config.max_inflight,
            credentials: self.credentials.credentials().await,
        };

        info!("🔗 正在连接 broker: {} (client_id={})", options.broker_url, options.client_id);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.start_event_loop(event_rx);
        self.session_open.store(true, Ordering::SeqCst);

        let result = match tokio::time::timeout(
            self.config.connect_timeout(),
            self.transport.connect(&options, event_tx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MqChatError::Timeout(format!(
                "连接超时 ({}s)",
                self.config.connect_timeout_secs
            ))),
        };

        match result {
            Ok(()) => {
                self.attempts.store(0, Ordering::SeqCst);
                if !self.transition(ConnectionState::Connecting, ConnectionState::Connected) {
                    // 连接过程中被主动断开
                    warn!("⚠️ 连接完成时已被断开，关闭传输句柄");
                    self.close_session().await;
                    return Err(MqChatError::NotConnected);
                }
                self.cancel_reconnect_timer();
                info!("✅ broker 连接成功");
                self.emit(ConnectionEvent::Connected);
                self.restore_subscriptions().await;
                Ok(())
            }
            Err(e) => {
                self.transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                let attempts = self.attempts.load(Ordering::SeqCst);
                error!("❌ broker 连接失败 (已重试 {} 次): {}", attempts, e);
                self.emit(ConnectionEvent::ConnectFailed {
                    reason: e.to_string(),
                    attempts,
                });
                self.schedule_reconnect(ReconnectReason::TransportFailure);
                Err(MqChatError::TransientNetwork(e.to_string()))
            }
        }
    }

    /// 在后台发起一次连接，已连接、连接中或等待重连时忽略
    pub fn request_connect(self: &Arc<Self>) {
        match self.state() {
            ConnectionState::Disconnected => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = this.connect().await;
                });
            }
            state => debug!("忽略连接请求，当前状态: {}", state),
        }
    }

    /// 安排一次重连，已有重连任务时拒绝并返回 false
    pub fn schedule_reconnect(self: &Arc<Self>, reason: ReconnectReason) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            debug!("已主动断开，不安排重连");
            return false;
        }
        if self
            .reconnect_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("已有重连任务，拒绝新的重连请求");
            return false;
        }

        let delay = match reason {
            ReconnectReason::NetworkUnavailable => {
                Duration::from_millis(self.config.unavailable_retry_delay_ms)
            }
            ReconnectReason::TransportFailure | ReconnectReason::ConnectionLost => {
                let attempts = self.attempts.load(Ordering::SeqCst);
                if attempts >= self.config.max_reconnect_attempts {
                    error!("❌ 已达到最大重连次数 {}，停止自动重连", attempts);
                    self.reconnect_pending.store(false, Ordering::SeqCst);
                    self.emit(ConnectionEvent::ReconnectExhausted { attempts });
                    return false;
                }
                let delay = self.backoff.delay_for(attempts);
                self.attempts.fetch_add(1, Ordering::SeqCst);
                delay
            }
        };

        self.transition(ConnectionState::Disconnected, ConnectionState::Reconnecting);
        let attempts = self.attempts.load(Ordering::SeqCst);
        info!("🔄 {}ms 后重连 (第 {} 次, 原因: {:?})", delay.as_millis(), attempts, reason);
        self.emit(ConnectionEvent::ReconnectScheduled {
            delay,
            attempts,
            reason,
        });

        let weak = Arc::downgrade(self);
        let key = self.timer.schedule_async(delay, async move {
            let this = match weak.upgrade() {
                Some(this) => this,
                None => return,
            };
            this.reconnect_pending.store(false, Ordering::SeqCst);
            this.reconnect_key.lock().take();
            if this.closing.load(Ordering::SeqCst) {
                return;
            }
            let _ = this.connect().await;
        });
        *self.reconnect_key.lock() = Some(key);
        true
    }

    /// 发布消息
    ///
    /// 先按 message id 登记确认回调再调用传输层，确认可能比 publish 调用先返回。
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
        message_id: &str,
    ) -> Result<PublishAck> {
        if !self.is_connected() {
            return Err(MqChatError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        if self.pending.insert(message_id.to_string(), tx).is_some() {
            warn!("⚠️ 同一消息的上一次 publish 尚未确认，覆盖: {}", message_id);
        }

        match self.transport.publish(topic, payload, qos, message_id).await {
            Ok(()) => {
                debug!("📤 已提交 publish: topic={}, message_id={}, {}", topic, message_id, qos);
                Ok(PublishAck {
                    message_id: message_id.to_string(),
                    receiver: rx,
                    pending: Arc::downgrade(&self.pending),
                })
            }
            Err(e) => {
                self.pending.remove(message_id);
                Err(e)
            }
        }
    }

    /// 订阅主题，未连接时忽略
    pub async fn subscribe(&self, topic: &str, qos: Qos) -> Result<()> {
        if !self.is_connected() {
            warn!("⚠️ 未连接，忽略订阅: {}", topic);
            return Ok(());
        }
        self.transport.subscribe(topic, qos).await?;
        self.subscriptions.insert(topic.to_string(), qos);
        info!("✅ 已订阅主题: {} ({})", topic, qos);
        Ok(())
    }

    /// 取消订阅，未连接时忽略
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions.remove(topic);
        if !self.is_connected() {
            warn!("⚠️ 未连接，忽略取消订阅: {}", topic);
            return Ok(());
        }
        self.transport.unsubscribe(topic).await?;
        info!("已取消订阅主题: {}", topic);
        Ok(())
    }

    /// 断开连接
    ///
    /// 可重复调用：取消重连定时器、清零重连次数、让所有等待确认的 publish 失败，
    /// 传输句柄只关闭一次。
    pub async fn disconnect(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.cancel_reconnect_timer();
        self.attempts.store(0, Ordering::SeqCst);

        let previous = ConnectionState::from_u8(
            self.state.swap(ConnectionState::Disconnected as u8, Ordering::SeqCst),
        );
        if previous != ConnectionState::Disconnected {
            self.emit(ConnectionEvent::StateChanged {
                from: previous,
                to: ConnectionState::Disconnected,
            });
        }

        let failed = self.fail_pending("connection closed");
        if failed > 0 {
            info!("已终止 {} 个等待确认的 publish", failed);
        }

        self.close_session().await;
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state(),
            client_id: self.client_id.clone(),
            reconnect_attempts: self.reconnect_attempts(),
            pending_publishes: self.pending.len(),
            subscriptions: self.subscriptions.len(),
            reconnect_pending: self.reconnect_pending.load(Ordering::SeqCst),
        }
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let changed = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if changed {
            debug!("连接状态: {} -> {}", from, to);
            self.emit(ConnectionEvent::StateChanged { from, to });
        }
        changed
    }

    fn emit(&self, event: ConnectionEvent) {
        // 没有订阅者时发送失败是正常情况
        let _ = self.events.send(event);
    }

    fn cancel_reconnect_timer(&self) {
        if let Some(key) = self.reconnect_key.lock().take() {
            self.timer.cancel(key);
        }
        self.reconnect_pending.store(false, Ordering::SeqCst);
    }

    fn fail_pending(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(MqChatError::TransientNetwork(reason.to_string())));
                failed += 1;
            }
        }
        failed
    }

    async fn close_session(&self) {
        if !self.session_open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("⚠️ 断开传输层失败: {}", e);
        }
        if let Err(e) = self.transport.close().await {
            warn!("⚠️ 关闭传输句柄失败: {}", e);
        }
        info!("🔌 传输句柄已关闭");
    }

    async fn restore_subscriptions(&self) {
        let topics: Vec<(String, Qos)> = self
            .subscriptions
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (topic, qos) in topics {
            match self.transport.subscribe(&topic, qos).await {
                Ok(()) => debug!("恢复订阅: {}", topic),
                Err(e) => warn!("⚠️ 恢复订阅失败: {}: {}", topic, e),
            }
        }
    }

    fn start_event_loop(self: &Arc<Self>, mut receiver: TransportEventReceiver) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let this = match weak.upgrade() {
                    Some(this) => this,
                    None => break,
                };
                this.handle_transport_event(event);
            }
        });
        if let Some(previous) = self.event_loop.lock().replace(handle) {
            previous.abort();
        }
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::DeliveryComplete { message_id, result } => {
                match self.pending.remove(&message_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(result.map_err(MqChatError::PublishFailure));
                    }
                    None => debug!("收到未登记的投递确认: {}", message_id),
                }
            }
            TransportEvent::ConnectionLost { reason } => self.on_connection_lost(reason),
            TransportEvent::MessageArrived { topic, payload } => {
                let sink = self.inbound_sink.lock().clone();
                match sink {
                    Some(sink) => {
                        if sink.send(InboundFrame { topic, payload }).is_err() {
                            warn!("⚠️ 入站处理已停止，丢弃消息");
                        }
                    }
                    None => debug!("没有入站处理器，丢弃消息: topic={}", topic),
                }
            }
        }
    }

    fn on_connection_lost(self: &Arc<Self>, reason: String) {
        if !self.transition(ConnectionState::Connected, ConnectionState::Disconnected) {
            debug!("非已连接状态下收到断线通知，忽略: {}", reason);
            return;
        }
        warn!("⚠️ broker 连接断开: {}", reason);
        self.emit(ConnectionEvent::ConnectionLost {
            reason: reason.clone(),
        });
        self.fail_pending(&reason);
        self.schedule_reconnect(ReconnectReason::ConnectionLost);
    }
}

fn generate_client_id(prefix: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(1000..10000);
    format!("{}-{}-{}", prefix, chrono::Utc::now().timestamp_millis(), suffix)
}


#[cfg(test)]
mod tests {
    use super::test_helpers::*;
    use super::*;
    use crate::network::{NetworkStatus, StaticReachability};
    use crate::transport::memory::AckMode;
    use crate::transport::MemoryTransport;

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_connect_delay(Duration::from_millis(50));
        let manager = manager_with(fast_config(), transport.clone(), Arc::new(StaticReachability::online()));

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.connect().await.unwrap();
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_connect_options_from_config() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = ConnectionManager::new(
            fast_config(),
            transport.clone(),
            Arc::new(StaticReachability::online()),
            Arc::new(crate::transport::StaticCredentials::new("alice", "token")),
            TimerService::start(),
        );
        manager.connect().await.unwrap();

        let options = transport.last_options().unwrap();
        assert!(options.client_id.starts_with("rust-client-"));
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert!(options.clean_session);
        assert_eq!(options.credentials.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_backoff_on_transport_failure_and_reset() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_connects(3);
        let manager = manager_with(fast_config(), transport.clone(), Arc::new(StaticReachability::online()));
        let mut events = manager.subscribe_events();

        assert!(manager.connect().await.is_err());

        let mut delays = Vec::new();
        while delays.len() < 3 {
            if let Ok(ConnectionEvent::ReconnectScheduled { delay, reason, .. }) = events.recv().await {
                assert_eq!(reason, ReconnectReason::TransportFailure);
                delays.push(delay);
            }
        }
        // 第 3 次失败发生在 attempts = 2 时：base * 2^2
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80)
            ]
        );

        assert!(wait_for(|| manager.is_connected()).await);
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(transport.connect_calls(), 4);
    }

    #[tokio::test]
    async fn test_backoff_is_capped() {
        let mut config = fast_config();
        config.max_reconnect_attempts = 20;
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(config, transport, Arc::new(StaticReachability::online()));

        manager.attempts.store(10, Ordering::SeqCst);
        let mut events = manager.subscribe_events();
        assert!(manager.schedule_reconnect(ReconnectReason::ConnectionLost));
        loop {
            if let Ok(ConnectionEvent::ReconnectScheduled { delay, .. }) = events.recv().await {
                assert_eq!(delay, Duration::from_millis(200));
                break;
            }
        }
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_network_unavailable_does_not_increment_attempts() {
        let transport = Arc::new(MemoryTransport::new());
        let reachability = Arc::new(StaticReachability::offline());
        let manager = manager_with(fast_config(), transport.clone(), reachability.clone());
        let mut events = manager.subscribe_events();

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(transport.connect_calls(), 0);
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        loop {
            if let Ok(ConnectionEvent::ReconnectScheduled { delay, reason, .. }) = events.recv().await {
                assert_eq!(reason, ReconnectReason::NetworkUnavailable);
                assert_eq!(delay, Duration::from_millis(30));
                break;
            }
        }

        reachability.set_status(NetworkStatus::Online);
        assert!(wait_for(|| manager.is_connected()).await);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_second_reconnect_request_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let mut config = fast_config();
        config.reconnect_base_delay_ms = 500;
        let manager = manager_with(config, transport, Arc::new(StaticReachability::online()));

        assert!(manager.schedule_reconnect(ReconnectReason::ConnectionLost));
        assert!(!manager.schedule_reconnect(ReconnectReason::ConnectionLost));
        assert!(!manager.schedule_reconnect(ReconnectReason::NetworkUnavailable));
        assert_eq!(manager.reconnect_attempts(), 1);
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_attempts_stops_reconnect() {
        let mut config = fast_config();
        config.max_reconnect_attempts = 2;
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_connects(10);
        let manager = manager_with(config, transport.clone(), Arc::new(StaticReachability::online()));
        let mut events = manager.subscribe_events();

        let _ = manager.connect().await;
        loop {
            if let Ok(ConnectionEvent::ReconnectExhausted { attempts }) = events.recv().await {
                assert_eq!(attempts, 2);
                break;
            }
        }
        assert_eq!(transport.connect_calls(), 3);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connection_lost_schedules_reconnect() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(fast_config(), transport.clone(), Arc::new(StaticReachability::online()));
        manager.connect().await.unwrap();
        manager.subscribe("chat/#", Qos::AtLeastOnce).await.unwrap();

        transport.drop_connection("keepalive timeout");
        assert!(wait_for(|| transport.connect_calls() == 2).await);
        assert!(wait_for(|| manager.is_connected()).await);
        assert_eq!(manager.reconnect_attempts(), 0);
        // 重连后恢复订阅
        assert!(wait_for(|| transport.subscriptions().contains(&"chat/#".to_string())).await);
    }

    #[tokio::test]
    async fn test_publish_requires_connected() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(fast_config(), transport.clone(), Arc::new(StaticReachability::online()));

        let result = manager
            .publish("t", Bytes::from_static(b"x"), Qos::AtLeastOnce, "m1")
            .await;
        assert!(matches!(result, Err(MqChatError::NotConnected)));
        assert_eq!(transport.publish_calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_ack_success_and_failure() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(fast_config(), transport.clone(), Arc::new(StaticReachability::online()));
        manager.connect().await.unwrap();

        let ack = manager
            .publish("t", Bytes::from_static(b"x"), Qos::AtLeastOnce, "m1")
            .await
            .unwrap();
        ack.wait(Duration::from_secs(1)).await.unwrap();

        transport.set_ack_mode(AckMode::Failure);
        let ack = manager
            .publish("t", Bytes::from_static(b"x"), Qos::AtLeastOnce, "m2")
            .await
            .unwrap();
        assert!(matches!(
            ack.wait(Duration::from_secs(1)).await,
            Err(MqChatError::PublishFailure(_))
        ));
        assert_eq!(manager.stats().pending_publishes, 0);
    }

    #[tokio::test]
    async fn test_publish_ack_timeout_forgets_callback() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_ack_mode(AckMode::Silent);
        let manager = manager_with(fast_config(), transport, Arc::new(StaticReachability::online()));
        manager.connect().await.unwrap();

        let ack = manager
            .publish("t", Bytes::from_static(b"x"), Qos::AtLeastOnce, "m1")
            .await
            .unwrap();
        assert_eq!(manager.stats().pending_publishes, 1);
        assert!(matches!(
            ack.wait(Duration::from_millis(30)).await,
            Err(MqChatError::Timeout(_))
        ));
        assert_eq!(manager.stats().pending_publishes, 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_ack_mode(AckMode::Silent);
        let manager = manager_with(fast_config(), transport.clone(), Arc::new(StaticReachability::online()));
        manager.connect().await.unwrap();

        let ack = manager
            .publish("t", Bytes::from_static(b"x"), Qos::AtLeastOnce, "m1")
            .await
            .unwrap();

        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();

        assert!(matches!(
            ack.wait(Duration::from_secs(1)).await,
            Err(MqChatError::TransientNetwork(_))
        ));
        assert_eq!(transport.close_calls(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_reconnect_timer() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_connects(1);
        let mut config = fast_config();
        config.reconnect_base_delay_ms = 50;
        let manager = manager_with(config, transport.clone(), Arc::new(StaticReachability::online()));

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        manager.disconnect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.connect_calls(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_when_disconnected_is_noop() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(fast_config(), transport.clone(), Arc::new(StaticReachability::online()));

        manager.subscribe("chat/room1", Qos::AtLeastOnce).await.unwrap();
        manager.unsubscribe("chat/room1").await.unwrap();
        assert!(transport.subscriptions().is_empty());
        assert_eq!(manager.stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_inbound_frames_forwarded() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager_with(fast_config(), transport.clone(), Arc::new(StaticReachability::online()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.set_inbound_sink(tx);
        manager.connect().await.unwrap();

        transport.inject_message("chat/room1", Bytes::from_static(b"frame"));
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.topic, "chat/room1");
        assert_eq!(&frame.payload[..], b"frame");
    }
}
