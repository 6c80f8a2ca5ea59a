//! MqChat SDK - 基于 MQTT broker 的可靠消息投递核心
//!
//! 本 SDK 负责把聊天消息可靠地送到 broker，并把收到的消息交给上层：
//! - 🔗 broker 连接管理：状态机、指数退避重连、订阅恢复
//! - 📤 持久化投递队列：高/普通优先级、线性退避重试、崩溃恢复
//! - 🧠 去重与压缩：TTL 窗口内的内容去重，超过阈值的内容 zstd 压缩
//! - 📎 附件上传：先上传再入队，支持进度与取消
//! - 📥 入站分发：解码、按 id 幂等落盘、分发给订阅者
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mqchat_sdk::{
//!     DispatchMode, MemoryTransport, Message, MessageContent, MqChatConfig, MqChatSDK,
//!     SendEvent, SendRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MqChatConfig::builder()
//!         .data_dir("/path/to/data")
//!         .broker_url("tcp://broker.example.com:1883")
//!         .build();
//!
//!     // 真实环境里替换为 MQTT 客户端适配的 Transport 实现
//!     let sdk = MqChatSDK::builder(config)
//!         .transport(Arc::new(MemoryTransport::new()))
//!         .self_uid("alice")
//!         .initialize()
//!         .await?;
//!
//!     sdk.add_send_listener(DispatchMode::Inline, |event| {
//!         if let SendEvent::SendFailed { message_id, reason, .. } = event {
//!             eprintln!("发送失败 {}: {}", message_id, reason);
//!         }
//!     });
//!     sdk.add_message_subscriber(DispatchMode::Main, |message| {
//!         println!("收到消息: {}", message.id);
//!     });
//!     sdk.subscribe_topic("chat/+", 1).await?;
//!
//!     let message = Message::new("conv-1", "alice", "bob", MessageContent::text("Hello"));
//!     sdk.send_message(SendRequest::new(message, "chat/conv-1")).await?;
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod version;
pub mod logging;
pub mod config;
pub mod message;
pub mod codec;
pub mod compression;
pub mod dedup;
pub mod events;
pub mod timer;
pub mod network;
pub mod transport;
pub mod backoff;
pub mod connection;
pub mod storage;
pub mod queue;
pub mod upload;
pub mod sender;
pub mod inbound;
pub mod sdk;

// 重新导出核心类型，方便使用
pub use error::{ErrorKind, MqChatError, Result};
pub use version::{sdk_version, SDK_VERSION};
pub use logging::init_logging;
pub use config::{ConnectionConfig, DedupConfig, MqChatConfig, MqChatConfigBuilder, QueueConfig, SendConfig};
pub use message::{
    ConversationType, Message, MessageContent, MessageStatus, QueuedMessage, ReplyInfo,
};
pub use codec::{EncodedMessage, MessageCodec};
pub use compression::{CompressionResult, CompressionStats, Compressor};
pub use dedup::{DedupStats, Deduplicator};
pub use events::{DispatchMode, MainContext, ObserverId, ObserverRegistry, SendEvent, SendListenerRegistry};
pub use timer::{TimerKey, TimerService};
pub use network::{NetworkStatus, ReachabilityOracle, StaticReachability};
pub use transport::{
    ConnectOptions, Credentials, CredentialsProvider, InboundFrame, MemoryTransport, Qos,
    StaticCredentials, Transport, TransportEvent,
};
pub use backoff::{ExponentialBackoff, LinearBackoff};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStats, PublishAck};
pub use storage::{MemoryRecordStore, MessageRecord, RecordDirection, RecordStore, SledRecordStore};
pub use queue::{DeliveryQueue, QueueStats};
pub use upload::{FileUploadResponse, FileUploader, HttpFileUploader, ProgressCallback, UploadRequest};
pub use sender::{retry_send_with_strategy, validate_request, SendOrchestrator, SendOutcome, SendRequest};
pub use inbound::{InboundDispatcher, InboundOutcome, InboundStats};
pub use sdk::{MqChatSDK, MqChatSDKBuilder, SdkStats};
