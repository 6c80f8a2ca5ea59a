//! 发送编排
//!
//! ```text
//! send_message
//!   ├─ 同步校验（失败立即返回，不入队）
//!   ├─ 网络可达性（仅记录日志）/ 未连接时发起连接
//!   ├─ 去重（重复消息静默丢弃）
//!   ├─ 附件上传（失败标记 Failed，不入队）
//!   └─ 投递队列入队
//! ```
//!
//! 每次发送有一个取消标记，在上传前、上传后和每次重试之间检查。

use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::LinearBackoff;
use crate::codec::MessageCodec;
use crate::config::SendConfig;
use crate::connection::ConnectionManager;
use crate::dedup::Deduplicator;
use crate::error::{MqChatError, Result};
use crate::events::{SendEvent, SendListenerRegistry};
use crate::message::{Message, MessageContent, MessageStatus};
use crate::network::ReachabilityOracle;
use crate::queue::DeliveryQueue;
use crate::storage::{MessageRecord, RecordDirection, RecordStore};
use crate::transport::Qos;
use crate::upload::{FileUploader, ProgressCallback, UploadRequest};

/// 发送请求
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub message: Message,
    pub topic: String,
    /// 0、1、2，其它值校验失败
    pub qos: u8,
    pub high_priority: bool,
}

impl SendRequest {
    pub fn new<S: Into<String>>(message: Message, topic: S) -> Self {
        Self {
            message,
            topic: topic.into(),
            qos: Qos::AtLeastOnce.as_u8(),
            high_priority: false,
        }
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }
}

/// `send_message` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 已进入投递队列
    Enqueued,
    /// TTL 窗口内的重复消息，已丢弃
    Duplicate,
}

/// 校验发送请求，返回解析后的 QoS
pub fn validate_request(request: &SendRequest) -> Result<Qos> {
    let message = &request.message;
    if message.id.trim().is_empty() {
        return Err(MqChatError::Validation("消息 id 为空".to_string()));
    }
    if message.conversation_id.trim().is_empty() {
        return Err(MqChatError::Validation("会话 id 为空".to_string()));
    }
    if request.topic.trim().is_empty() {
        return Err(MqChatError::Validation("主题为空".to_string()));
    }
    let qos = Qos::try_from(request.qos)?;

    match &message.content {
        MessageContent::Text { text } if text.trim().is_empty() => {
            return Err(MqChatError::Validation("文本内容为空".to_string()));
        }
        MessageContent::Sticker { sticker_id, .. } if sticker_id.is_empty() => {
            return Err(MqChatError::Validation("表情 id 为空".to_string()));
        }
        MessageContent::Opaque { content_type, bytes } if content_type.is_empty() || bytes.is_empty() => {
            return Err(MqChatError::Validation("透传内容缺少类型或数据".to_string()));
        }
        content if content.is_attachment() => {
            let has_remote = content.remote_url().map_or(false, |url| !url.is_empty());
            let has_local = content.local_path().map_or(false, |path| !path.is_empty())
                && content.file_size() > 0;
            if !has_remote && !has_local {
                return Err(MqChatError::Validation(format!(
                    "{} 消息需要远端地址或非空的本地文件",
                    content.type_name()
                )));
            }
        }
        _ => {}
    }
    Ok(qos)
}

/// 有限次数、可取消的重试
///
/// 共尝试 `max_retries + 1` 次，第 n 次失败后等待 `backoff.delay_for(n - 1)`。
/// 取消标记在每次尝试前和等待期间检查；次数用完返回 `RetryExhausted`。
pub async fn retry_send_with_strategy<T, F, Fut>(
    backoff: &LinearBackoff,
    max_retries: u32,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = String::new();
    for attempt in 0..=max_retries {
        if cancel.is_cancelled() {
            return Err(MqChatError::Canceled("发送已取消".to_string()));
        }
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(MqChatError::Canceled(reason)) => return Err(MqChatError::Canceled(reason)),
            Err(e) => {
                last_error = e.to_string();
                if attempt == max_retries {
                    break;
                }
                let delay = backoff.delay_for(attempt);
                warn!(
                    "⚠️ 发送失败，{}ms 后重试 ({}/{}): {}",
                    delay.as_millis(),
                    attempt + 1,
                    max_retries,
                    e
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(MqChatError::Canceled("发送已取消".to_string()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(MqChatError::RetryExhausted {
        attempts: max_retries + 1,
        last_error,
    })
}

pub struct SendOrchestrator {
    config: SendConfig,
    connection: Arc<ConnectionManager>,
    reachability: Arc<dyn ReachabilityOracle>,
    dedup: Arc<Deduplicator>,
    queue: Arc<DeliveryQueue>,
    store: Arc<dyn RecordStore>,
    codec: Arc<MessageCodec>,
    uploader: Option<Arc<dyn FileUploader>>,
    listeners: Arc<SendListenerRegistry>,
    /// 进行中发送的取消标记
    cancellations: DashMap<String, CancellationToken>,
    publish_timeout: Duration,
}

impl SendOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SendConfig,
        connection: Arc<ConnectionManager>,
        reachability: Arc<dyn ReachabilityOracle>,
        dedup: Arc<Deduplicator>,
        queue: Arc<DeliveryQueue>,
        store: Arc<dyn RecordStore>,
        codec: Arc<MessageCodec>,
        uploader: Option<Arc<dyn FileUploader>>,
        listeners: Arc<SendListenerRegistry>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            config,
            connection,
            reachability,
            dedup,
            queue,
            store,
            codec,
            uploader,
            listeners,
            cancellations: DashMap::new(),
            publish_timeout,
        }
    }

    /// 发送消息：校验、去重、必要时上传附件，然后入队
    pub async fn send_message(&self, request: SendRequest) -> Result<SendOutcome> {
        let qos = self.validate(&request)?;
        let message_id = request.message.id.clone();

        if !self.reachability.is_available() {
            warn!("📡 网络不可用，消息将在恢复后投递: {}", message_id);
        }
        if !self.connection.is_connected() {
            self.connection.request_connect();
        }

        let payload = request.message.content.dedup_payload();
        if self.dedup.is_duplicate(&message_id, &payload) {
            info!("重复消息，已忽略: {}", message_id);
            return Ok(SendOutcome::Duplicate);
        }

        let token = CancellationToken::new();
        self.cancellations.insert(message_id.clone(), token.clone());
        let result = self.prepare_and_enqueue(request, qos, &token).await;
        self.cancellations.remove(&message_id);
        if result.is_err() {
            // 没有进入队列，允许用同一 id 重发
            self.dedup.forget(&message_id, &payload);
        }
        result
    }

    async fn prepare_and_enqueue(
        &self,
        request: SendRequest,
        qos: Qos,
        token: &CancellationToken,
    ) -> Result<SendOutcome> {
        let SendRequest {
            mut message,
            topic,
            high_priority,
            ..
        } = request;

        if token.is_cancelled() {
            return Err(MqChatError::Canceled(message.id));
        }

        if message.content.requires_upload() {
            let url = self
                .upload_attachment(&message, &topic, qos, high_priority, token)
                .await?;
            let content = message.content.with_remote_url(&url);
            message = message.with_content(content);

            if token.is_cancelled() {
                return Err(MqChatError::Canceled(message.id));
            }
        }

        self.queue.enqueue(message, &topic, qos, high_priority)?;
        Ok(SendOutcome::Enqueued)
    }

    async fn upload_attachment(
        &self,
        message: &Message,
        topic: &str,
        qos: Qos,
        high_priority: bool,
        token: &CancellationToken,
    ) -> Result<String> {
        let uploader = match &self.uploader {
            Some(uploader) => uploader.clone(),
            None => {
                let error = MqChatError::UploadFailure("未配置上传器".to_string());
                self.fail_before_enqueue(message, topic, qos, high_priority, &error);
                return Err(error);
            }
        };

        let local_path = message.content.local_path().unwrap_or_default().to_string();
        let mut request = UploadRequest::new(message.id.clone(), local_path, message.content.file_size());
        if let MessageContent::File { file_name, mime_type, .. } = &message.content {
            if !file_name.is_empty() {
                request.file_name = file_name.clone();
            }
            if !mime_type.is_empty() {
                request = request.with_mime_type(mime_type.clone());
            }
        }

        self.notify_status(&message.id, MessageStatus::Uploading);
        let listeners = self.listeners.clone();
        let message_id = message.id.clone();
        let progress: ProgressCallback = Arc::new(move |progress| {
            listeners.dispatch(&SendEvent::UploadProgress {
                message_id: message_id.clone(),
                progress,
            });
        });

        let result = tokio::select! {
            _ = token.cancelled() => Err(MqChatError::Canceled(message.id.clone())),
            result = uploader.upload_file(&request, progress) => result,
        };

        match result {
            Ok(url) => {
                info!("✅ 附件上传完成: {} -> {}", message.id, url);
                Ok(url)
            }
            Err(MqChatError::Canceled(reason)) => {
                info!("附件上传已取消: {}", message.id);
                Err(MqChatError::Canceled(reason))
            }
            Err(e) => {
                let error = match e {
                    MqChatError::UploadFailure(_) => e,
                    other => MqChatError::UploadFailure(other.to_string()),
                };
                error!("❌ 附件上传失败: {}: {}", message.id, error);
                self.fail_before_enqueue(message, topic, qos, high_priority, &error);
                Err(error)
            }
        }
    }

    /// 直接发布（不经过投递队列），按固定 + 线性退避重试
    pub async fn send_direct(&self, request: SendRequest) -> Result<()> {
        let qos = self.validate(&request)?;
        let SendRequest {
            message,
            topic,
            high_priority,
            ..
        } = request;
        let message_id = message.id.clone();

        let encoded = self.codec.encode(&message)?;
        let payload = Bytes::from(encoded.bytes.clone());

        let token = CancellationToken::new();
        self.cancellations.insert(message_id.clone(), token.clone());
        self.notify_status(&message_id, MessageStatus::Sending);

        let backoff = LinearBackoff::new(
            Duration::from_millis(self.config.retry_fixed_delay_ms),
            Duration::from_millis(self.config.retry_step_delay_ms),
        );
        let result = retry_send_with_strategy(&backoff, self.config.max_retries, &token, |attempt| {
            let connection = self.connection.clone();
            let payload = payload.clone();
            let topic = topic.clone();
            let message_id = message_id.clone();
            let timeout = self.publish_timeout;
            if attempt > 0 {
                self.notify_status(&message_id, MessageStatus::Sending);
            }
            async move {
                if !connection.is_connected() {
                    connection.request_connect();
                    return Err(MqChatError::NotConnected);
                }
                let ack = connection.publish(&topic, payload, qos, &message_id).await?;
                ack.wait(timeout).await
            }
        })
        .await;
        self.cancellations.remove(&message_id);

        let status = match &result {
            Ok(()) => MessageStatus::Sent,
            Err(MqChatError::Canceled(_)) => MessageStatus::Canceled,
            Err(_) => MessageStatus::Failed,
        };
        let record = outbound_record(&message, &topic, qos, high_priority, status, encoded.bytes, encoded.is_compressed);
        if let Err(e) = self.store.upsert(&record) {
            warn!("⚠️ 保存直发记录失败: {}: {}", message_id, e);
        }

        match &result {
            Ok(()) => {
                info!("✅ 直发成功: {}", message_id);
                self.notify_status(&message_id, MessageStatus::Sent);
                self.listeners.dispatch(&SendEvent::SendSucceeded { message_id });
            }
            // cancel_send 已经通知过
            Err(MqChatError::Canceled(_)) => {}
            Err(e) => {
                error!("❌ 直发失败: {}: {}", message_id, e);
                self.notify_status(&message_id, MessageStatus::Failed);
                self.listeners.dispatch(&SendEvent::SendFailed {
                    message_id,
                    code: e.error_code(),
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    /// 取消发送
    ///
    /// 设置取消标记、调用上传器的取消钩子；记录存在时标记为 Canceled。
    /// 返回是否找到了这条消息。
    pub fn cancel_send(&self, message_id: &str) -> bool {
        let mut found = false;

        if let Some(token) = self.cancellations.get(message_id) {
            token.cancel();
            found = true;
            if let Some(uploader) = &self.uploader {
                uploader.cancel_upload();
            }
        }

        match self.store.get(message_id) {
            Ok(Some(record)) if !record.status.is_terminal() => {
                if record.status == MessageStatus::Sending {
                    self.queue.cancel(message_id);
                }
                if let Err(e) = self.store.update_status(message_id, MessageStatus::Canceled) {
                    warn!("⚠️ 更新取消状态失败: {}: {}", message_id, e);
                }
                found = true;
            }
            Ok(Some(record)) => {
                debug!("消息已处于终态 {}，忽略取消: {}", record.status, message_id);
            }
            Ok(None) => {}
            Err(e) => warn!("⚠️ 读取消息记录失败: {}: {}", message_id, e),
        }

        if found {
            info!("已取消发送: {}", message_id);
            self.notify_status(message_id, MessageStatus::Canceled);
            self.listeners.dispatch(&SendEvent::SendCanceled {
                message_id: message_id.to_string(),
            });
        }
        found
    }

    fn validate(&self, request: &SendRequest) -> Result<Qos> {
        validate_request(request).map_err(|e| {
            warn!("⚠️ 发送请求校验失败: {}: {}", request.message.id, e);
            self.listeners.dispatch(&SendEvent::SendFailed {
                message_id: request.message.id.clone(),
                code: e.error_code(),
                reason: e.to_string(),
            });
            e
        })
    }

    /// 入队前失败：保存一条 Failed 记录并通知监听器
    fn fail_before_enqueue(
        &self,
        message: &Message,
        topic: &str,
        qos: Qos,
        high_priority: bool,
        error: &MqChatError,
    ) {
        match self.codec.encode(message) {
            Ok(encoded) => {
                let record = outbound_record(
                    message,
                    topic,
                    qos,
                    high_priority,
                    MessageStatus::Failed,
                    encoded.bytes,
                    encoded.is_compressed,
                );
                if let Err(e) = self.store.upsert(&record) {
                    warn!("⚠️ 保存失败记录出错: {}: {}", message.id, e);
                }
            }
            Err(e) => warn!("⚠️ 编码失败消息出错: {}: {}", message.id, e),
        }

        self.notify_status(&message.id, MessageStatus::Failed);
        self.listeners.dispatch(&SendEvent::SendFailed {
            message_id: message.id.clone(),
            code: error.error_code(),
            reason: error.to_string(),
        });
    }

    fn notify_status(&self, message_id: &str, status: MessageStatus) {
        self.listeners.dispatch(&SendEvent::StatusChanged {
            message_id: message_id.to_string(),
            status,
        });
    }
}

fn outbound_record(
    message: &Message,
    topic: &str,
    qos: Qos,
    high_priority: bool,
    status: MessageStatus,
    serialized_content: Vec<u8>,
    is_compressed: bool,
) -> MessageRecord {
    MessageRecord {
        id: message.id.clone(),
        conversation_id: message.conversation_id.clone(),
        status,
        retry_count: 0,
        topic: topic.to_string(),
        timestamp: message.timestamp,
        serialized_content,
        is_compressed,
        high_priority,
        qos,
        direction: RecordDirection::Outbound,
        updated_at: chrono::Utc::now().timestamp_millis(),
    }
}
