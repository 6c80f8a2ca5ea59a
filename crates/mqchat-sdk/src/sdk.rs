//! MqChat SDK 主入口
//!
//! [`MqChatSDK`] 持有并串联所有组件：记录存储、定时器、压缩/去重、
//! broker 连接、入站分发、投递队列和发送编排。传输层、可达性判断、
//! 凭据和上传器都由宿主通过 [`MqChatSDKBuilder`] 注入。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::MessageCodec;
use crate::compression::{CompressionStats, Compressor};
use crate::config::MqChatConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionStats};
use crate::dedup::{DedupStats, Deduplicator};
use crate::error::{MqChatError, Result};
use crate::events::{DispatchMode, MainContext, ObserverId, SendEvent, SendListenerRegistry};
use crate::inbound::{InboundDispatcher, InboundStats};
use crate::logging;
use crate::message::Message;
use crate::network::{ReachabilityOracle, StaticReachability};
use crate::queue::{DeliveryQueue, QueueStats};
use crate::sender::{SendOrchestrator, SendOutcome, SendRequest};
use crate::storage::{MessageRecord, RecordStore, SledRecordStore};
use crate::timer::TimerService;
use crate::transport::{CredentialsProvider, Qos, StaticCredentials, Transport};
use crate::upload::{FileUploader, HttpFileUploader};
use crate::version;

/// SDK 运行统计
#[derive(Debug, Clone)]
pub struct SdkStats {
    pub connection: ConnectionStats,
    pub queue: QueueStats,
    pub inbound: InboundStats,
    pub compression: CompressionStats,
    pub dedup: DedupStats,
}

/// SDK 构建器
///
/// 只有传输层是必须的，其他组件都有默认实现。
pub struct MqChatSDKBuilder {
    config: MqChatConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn RecordStore>>,
    reachability: Option<Arc<dyn ReachabilityOracle>>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    uploader: Option<Arc<dyn FileUploader>>,
    main_context: Option<Arc<MainContext>>,
    self_uid: Option<String>,
}

impl MqChatSDKBuilder {
    pub fn new(config: MqChatConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
            reachability: None,
            credentials: None,
            uploader: None,
            main_context: None,
            self_uid: None,
        }
    }

    /// broker 传输层（MQTT 客户端适配）
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 替换默认的 sled 记录存储
    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn reachability(mut self, reachability: Arc<dyn ReachabilityOracle>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// 替换默认的 HTTP 上传器
    pub fn uploader(mut self, uploader: Arc<dyn FileUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// 使用宿主自己的主线程上下文
    ///
    /// 宿主需要自己调用 [`MainContext::run_pending`]；不设置时 SDK 创建一个
    /// 并交给后台 runner 任务执行。
    pub fn main_context(mut self, main: Arc<MainContext>) -> Self {
        self.main_context = Some(main);
        self
    }

    /// 本端 uid，用于判断入站消息是否为自己发送
    pub fn self_uid<S: Into<String>>(mut self, uid: S) -> Self {
        self.self_uid = Some(uid.into());
        self
    }

    pub async fn initialize(self) -> Result<Arc<MqChatSDK>> {
        MqChatSDK::initialize_with(self).await
    }
}

pub struct MqChatSDK {
    config: MqChatConfig,

    store: Arc<dyn RecordStore>,
    /// 默认存储，关闭时刷盘
    sled_store: Option<Arc<SledRecordStore>>,
    timer: Arc<TimerService>,
    compressor: Arc<Compressor>,
    dedup: Arc<Deduplicator>,
    connection: Arc<ConnectionManager>,
    inbound: Arc<InboundDispatcher>,
    queue: Arc<DeliveryQueue>,
    sender: SendOrchestrator,
    listeners: Arc<SendListenerRegistry>,
    main_context: Arc<MainContext>,

    background: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for MqChatSDK {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqChatSDK")
            .field("broker_url", &self.config.connection.broker_url)
            .field("client_id", &self.connection.client_id())
            .field("state", &self.connection.state())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl MqChatSDK {
    pub fn builder(config: MqChatConfig) -> MqChatSDKBuilder {
        MqChatSDKBuilder::new(config)
    }

    async fn initialize_with(builder: MqChatSDKBuilder) -> Result<Arc<Self>> {
        let MqChatSDKBuilder {
            config,
            transport,
            store,
            reachability,
            credentials,
            uploader,
            main_context,
            self_uid,
        } = builder;

        if config.debug_mode {
            logging::init_logging(true);
        }
        info!("正在初始化 MqChat SDK {}...", version::version_string());

        config.validate()?;
        let transport =
            transport.ok_or_else(|| MqChatError::Config("未设置传输层 (transport)".to_string()))?;

        // === 第1层：记录存储 ===
        let (store, sled_store) = match store {
            Some(store) => {
                info!("使用宿主提供的记录存储");
                (store, None)
            }
            None => {
                let sled = Arc::new(SledRecordStore::open(&config.data_dir)?);
                (sled.clone() as Arc<dyn RecordStore>, Some(sled))
            }
        };
        info!("✅ 记录存储初始化完成");

        // === 第2层：定时器与回调上下文 ===
        let timer = TimerService::start();
        let mut background = Vec::new();
        let main_context = match main_context {
            Some(main) => main,
            None => {
                let main = MainContext::new();
                if let Some(handle) = main.spawn_runner() {
                    background.push(handle);
                }
                main
            }
        };
        let listeners = Arc::new(SendListenerRegistry::new(main_context.clone()));
        info!("✅ 定时器与回调上下文初始化完成");

        // === 第3层：压缩、编解码、去重 ===
        let compressor = Arc::new(Compressor::from_config(&config.dedup));
        let codec = Arc::new(MessageCodec::new(compressor.clone()));
        let dedup = Arc::new(Deduplicator::from_config(&config.dedup));
        background.push(dedup.start_sweeper(config.dedup.sweep_interval()));
        info!(
            "✅ 去重与压缩初始化完成 (阈值 {} bytes, 去重窗口 {}s)",
            config.dedup.compression_threshold, config.dedup.ttl_secs
        );

        // === 第4层：连接与入站分发 ===
        let reachability =
            reachability.unwrap_or_else(|| Arc::new(StaticReachability::online()) as Arc<dyn ReachabilityOracle>);
        let credentials = credentials
            .unwrap_or_else(|| Arc::new(StaticCredentials::anonymous()) as Arc<dyn CredentialsProvider>);
        let connection = ConnectionManager::new(
            config.connection.clone(),
            transport,
            reachability.clone(),
            credentials,
            timer.clone(),
        );
        let inbound = InboundDispatcher::new(store.clone(), codec.clone(), main_context.clone());
        if let Some(uid) = self_uid {
            inbound.set_self_uid(uid);
        }
        inbound.start()?;
        connection.set_inbound_sink(inbound.sink());
        info!("✅ 连接管理器初始化完成 (client_id={})", connection.client_id());

        // === 第5层：投递队列 ===
        let queue = DeliveryQueue::new(
            config.queue.clone(),
            store.clone(),
            connection.clone(),
            codec.clone(),
            timer.clone(),
            listeners.clone(),
        );
        match queue.restore_pending() {
            Ok(0) => {}
            Ok(count) => info!("🔄 恢复了 {} 条未完成的消息", count),
            Err(e) => warn!("⚠️ 恢复未完成消息失败: {}", e),
        }
        queue.start();
        info!("✅ 投递队列初始化完成");

        // === 第6层：发送编排 ===
        let uploader = match uploader {
            Some(uploader) => Some(uploader),
            None => match &config.send.upload_url {
                Some(url) => Some(Arc::new(HttpFileUploader::new(
                    url.clone(),
                    Duration::from_secs(config.send.upload_timeout_secs),
                )?) as Arc<dyn FileUploader>),
                None => {
                    debug!("未配置上传地址，附件只能使用远端 url 发送");
                    None
                }
            },
        };
        let sender = SendOrchestrator::new(
            config.send.clone(),
            connection.clone(),
            reachability,
            dedup.clone(),
            queue.clone(),
            store.clone(),
            codec,
            uploader,
            listeners.clone(),
            Duration::from_secs(config.queue.publish_timeout_secs),
        );
        info!("✅ 发送编排初始化完成");

        let sdk = Arc::new(Self {
            config,
            store,
            sled_store,
            timer,
            compressor,
            dedup,
            connection,
            inbound,
            queue,
            sender,
            listeners,
            main_context,
            background: Mutex::new(background),
            initialized: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
        });

        // 首次连接失败时连接管理器会自行安排重连
        if let Err(e) = sdk.connection.connect().await {
            warn!("⚠️ 首次连接失败，已安排重连: {}", e);
        }

        info!("🎉 MqChat SDK 初始化完成");
        Ok(sdk)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(MqChatError::ShuttingDown);
        }
        Ok(())
    }

    // ========== 发送 ==========

    /// 发送消息（经投递队列）
    pub async fn send_message(&self, request: SendRequest) -> Result<SendOutcome> {
        self.ensure_running()?;
        self.sender.send_message(request).await
    }

    /// 直接发布，不经过队列
    pub async fn send_direct(&self, request: SendRequest) -> Result<()> {
        self.ensure_running()?;
        self.sender.send_direct(request).await
    }

    pub fn cancel_send(&self, message_id: &str) -> bool {
        self.sender.cancel_send(message_id)
    }

    /// 查询本地消息记录
    pub fn message_record(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        self.store.get(message_id)
    }

    // ========== 订阅 ==========

    pub async fn subscribe_topic(&self, topic: &str, qos: u8) -> Result<()> {
        self.ensure_running()?;
        let qos = Qos::try_from(qos)?;
        self.connection.subscribe(topic, qos).await
    }

    pub async fn unsubscribe_topic(&self, topic: &str) -> Result<()> {
        self.ensure_running()?;
        self.connection.unsubscribe(topic).await
    }

    // ========== 观察者 ==========

    /// 注册入站消息订阅者
    pub fn add_message_subscriber<F>(&self, mode: DispatchMode, callback: F) -> ObserverId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inbound.add_subscriber(mode, callback)
    }

    pub fn remove_message_subscriber(&self, id: ObserverId) -> bool {
        self.inbound.remove_subscriber(id)
    }

    /// 注册发送事件监听
    pub fn add_send_listener<F>(&self, mode: DispatchMode, callback: F) -> ObserverId
    where
        F: Fn(&SendEvent) + Send + Sync + 'static,
    {
        self.listeners.add(mode, callback)
    }

    pub fn remove_send_listener(&self, id: ObserverId) -> bool {
        self.listeners.remove(id)
    }

    /// 连接事件流
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe_events()
    }

    pub fn set_self_uid<S: Into<String>>(&self, uid: S) {
        self.inbound.set_self_uid(uid);
    }

    // ========== 连接 ==========

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// 重连次数用尽后手动重试
    pub async fn reconnect(&self) -> Result<()> {
        self.ensure_running()?;
        self.connection.reset_reconnect_attempts();
        self.connection.connect().await
    }

    // ========== 访问器 ==========

    pub fn config(&self) -> &MqChatConfig {
        &self.config
    }

    pub fn main_context(&self) -> &Arc<MainContext> {
        &self.main_context
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub fn stats(&self) -> SdkStats {
        SdkStats {
            connection: self.connection.stats(),
            queue: self.queue.stats(),
            inbound: self.inbound.stats(),
            compression: self.compressor.stats(),
            dedup: self.dedup.stats(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// 关闭 SDK
    ///
    /// 停止投递队列与入站任务、断开连接、停止定时器并刷盘。
    /// 未完成的消息留在存储里，下次初始化时恢复。
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("SDK 已在关闭中");
            return Ok(());
        }
        info!("🔌 正在关闭 MqChat SDK...");

        let (_, disconnected) = futures::join!(self.queue.stop(), self.connection.disconnect());
        if let Err(e) = disconnected {
            warn!("⚠️ 断开连接失败: {}", e);
        }
        self.inbound.stop();

        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        self.timer.shutdown().await;

        if let Some(sled) = &self.sled_store {
            if let Err(e) = sled.flush() {
                error!("❌ 关闭时刷盘失败: {}", e);
            }
        }

        self.initialized.store(false, Ordering::SeqCst);
        info!("✅ MqChat SDK 关闭完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendConfig;
    use crate::connection::test_helpers::fast_config;
    use crate::message::{MessageContent, MessageStatus};
    use crate::queue::test_helpers::fast_queue_config;
    use crate::storage::MemoryRecordStore;
    use crate::transport::MemoryTransport;
    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn test_config(dir: &TempDir) -> MqChatConfig {
        MqChatConfig {
            data_dir: dir.path().to_path_buf(),
            connection: fast_config(),
            queue: fast_queue_config(),
            send: SendConfig {
                retry_fixed_delay_ms: 10,
                retry_step_delay_ms: 10,
                ..SendConfig::default()
            },
            ..MqChatConfig::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn text(id: &str, from: &str) -> Message {
        Message::new("conv-1", from, "bob", MessageContent::text("hello")).with_id(id)
    }

    #[tokio::test]
    async fn test_initialize_requires_transport() {
        let dir = TempDir::new().unwrap();
        let result = MqChatSDK::builder(test_config(&dir)).initialize().await;
        assert!(matches!(result, Err(MqChatError::Config(_))));
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.queue.batch_size = 0;
        let result = MqChatSDK::builder(config)
            .transport(Arc::new(MemoryTransport::new()))
            .initialize()
            .await;
        assert!(matches!(result, Err(MqChatError::Config(_))));
    }

    #[tokio::test]
    async fn test_send_message_end_to_end() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let sdk = MqChatSDK::builder(test_config(&dir))
            .transport(transport.clone())
            .initialize()
            .await
            .unwrap();
        assert!(sdk.is_connected());

        let succeeded = Arc::new(Mutex::new(Vec::new()));
        let sink = succeeded.clone();
        sdk.add_send_listener(DispatchMode::Inline, move |event| {
            if let SendEvent::SendSucceeded { message_id } = event {
                sink.lock().push(message_id.clone());
            }
        });

        let outcome = sdk
            .send_message(SendRequest::new(text("m1", "alice"), "chat/conv-1"))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Enqueued);

        assert!(wait_for(|| !succeeded.lock().is_empty()).await);
        let record = sdk.message_record("m1").unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Sent);
        assert_eq!(transport.published().len(), 1);
        assert_eq!(sdk.stats().queue.sent, 1);

        assert_ok!(sdk.shutdown().await);
        assert!(sdk.config().data_dir.join("records").exists());
    }

    #[tokio::test]
    async fn test_duplicate_send_is_reported() {
        let dir = TempDir::new().unwrap();
        let sdk = MqChatSDK::builder(test_config(&dir))
            .transport(Arc::new(MemoryTransport::new()))
            .record_store(Arc::new(MemoryRecordStore::new()))
            .initialize()
            .await
            .unwrap();

        let request = SendRequest::new(text("m1", "alice"), "chat/conv-1");
        assert_eq!(sdk.send_message(request.clone()).await.unwrap(), SendOutcome::Enqueued);
        assert_eq!(sdk.send_message(request).await.unwrap(), SendOutcome::Duplicate);
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_message_reaches_subscriber() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let main = MainContext::new();
        let sdk = MqChatSDK::builder(test_config(&dir))
            .transport(transport.clone())
            .record_store(Arc::new(MemoryRecordStore::new()))
            .main_context(main.clone())
            .self_uid("bob")
            .initialize()
            .await
            .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        sdk.add_message_subscriber(DispatchMode::Main, move |message| {
            sink.lock().push((message.id.clone(), message.is_self));
        });
        sdk.subscribe_topic("chat/+", 1).await.unwrap();

        let codec = MessageCodec::new(Arc::new(Compressor::new(1024, 3)));
        let payload = codec.encode(&text("in-1", "alice")).unwrap().bytes;
        transport.inject_message("chat/conv-1", Bytes::from(payload.clone()));
        transport.inject_message("chat/conv-1", Bytes::from(payload));

        assert!(wait_for(|| {
            let stats = sdk.stats().inbound;
            stats.delivered + stats.duplicates == 2
        })
        .await);
        // 回调在主线程上下文执行
        assert!(received.lock().is_empty());
        assert_eq!(main.run_pending(), 1);
        assert_eq!(*received.lock(), vec![("in-1".to_string(), false)]);
        assert_eq!(sdk.stats().inbound.duplicates, 1);

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_messages_survive_restart() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRecordStore::new());

        // 第一次运行：broker 不可达，消息停留在 Sending
        let offline = Arc::new(MemoryTransport::new());
        offline.fail_next_connects(1000);
        let first = MqChatSDK::builder(test_config(&dir))
            .transport(offline)
            .record_store(store.clone())
            .initialize()
            .await
            .unwrap();
        assert!(!first.is_connected());
        first
            .send_message(SendRequest::new(text("m1", "alice"), "chat/conv-1").high_priority())
            .await
            .unwrap();
        first.shutdown().await.unwrap();

        let record = store.get("m1").unwrap().unwrap();
        assert_eq!(record.status, MessageStatus::Sending);
        assert!(record.high_priority);

        // 第二次运行：恢复并投递
        let transport = Arc::new(MemoryTransport::new());
        let second = MqChatSDK::builder(test_config(&dir))
            .transport(transport.clone())
            .record_store(store.clone())
            .initialize()
            .await
            .unwrap();
        assert!(
            wait_for(|| matches!(
                store.get("m1").ok().flatten().map(|r| r.status),
                Some(MessageStatus::Sent)
            ))
            .await
        );
        assert_eq!(transport.published()[0].message_id, "m1");
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_calls_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let sdk = MqChatSDK::builder(test_config(&dir))
            .transport(transport.clone())
            .record_store(Arc::new(MemoryRecordStore::new()))
            .initialize()
            .await
            .unwrap();

        assert_ok!(sdk.shutdown().await);
        // 重复关闭无副作用
        assert_ok!(sdk.shutdown().await);
        assert!(!sdk.is_initialized());
        assert!(!sdk.is_connected());
        assert_eq!(transport.close_calls(), 1);

        let result = sdk
            .send_message(SendRequest::new(text("m1", "alice"), "chat/conv-1"))
            .await;
        assert!(matches!(result, Err(MqChatError::ShuttingDown)));
        assert_err!(sdk.subscribe_topic("chat/+", 1).await);
    }
}
