//! 消息数据模型
//!
//! `Message` 由上层（UI）构造，核心层只读使用；`QueuedMessage` 是投递队列中的包装，
//! 只有重试调度会修改其中的 `retry_count`。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transport::Qos;

/// 消息状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageStatus {
    Pending = 0,
    Sending = 1,
    Uploading = 2,
    Sent = 3,
    Failed = 4,
    Canceled = 5,
}

impl MessageStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Failed | MessageStatus::Canceled)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageStatus::Pending => "待发送",
            MessageStatus::Sending => "发送中",
            MessageStatus::Uploading => "上传中",
            MessageStatus::Sent => "已发送",
            MessageStatus::Failed => "发送失败",
            MessageStatus::Canceled => "已取消",
        };
        write!(f, "{}", name)
    }
}

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationType {
    /// 单聊
    Single,
    /// 群聊
    Group,
}

impl Default for ConversationType {
    fn default() -> Self {
        ConversationType::Single
    }
}

/// 引用回复信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyInfo {
    pub reply_to_message_id: String,
    /// 被回复消息的内容类型，例如 "text"、"image"
    pub reply_to_type: String,
    /// 被回复消息的预览文本
    pub preview_text: String,
}

/// 消息内容
///
/// 每条消息只有一种内容形态；未知或新版本的内容走 `Opaque`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        /// 远端地址，上传完成前为空
        url: String,
        /// 本地文件路径，需要上传时设置
        local_path: Option<String>,
        width: u32,
        height: u32,
        file_size: u64,
        thumb_url: Option<String>,
        blur_hash: Option<String>,
    },
    Voice {
        url: String,
        local_path: Option<String>,
        /// 时长（秒）
        duration: u32,
        file_size: u64,
    },
    Video {
        url: String,
        local_path: Option<String>,
        cover_url: Option<String>,
        width: u32,
        height: u32,
        duration: u32,
        file_size: u64,
    },
    File {
        file_name: String,
        url: String,
        local_path: Option<String>,
        file_size: u64,
        mime_type: String,
    },
    Sticker {
        sticker_id: String,
        pack_id: String,
        url: String,
    },
    Opaque {
        content_type: String,
        bytes: Vec<u8>,
    },
}

impl MessageContent {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MessageContent::Text { text: text.into() }
    }

    /// 内容类型名
    pub fn type_name(&self) -> &str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Image { .. } => "image",
            MessageContent::Voice { .. } => "voice",
            MessageContent::Video { .. } => "video",
            MessageContent::File { .. } => "file",
            MessageContent::Sticker { .. } => "sticker",
            MessageContent::Opaque { content_type, .. } => content_type.as_str(),
        }
    }

    /// 是否带附件（图片、语音、视频、文件）
    pub fn is_attachment(&self) -> bool {
        matches!(
            self,
            MessageContent::Image { .. }
                | MessageContent::Voice { .. }
                | MessageContent::Video { .. }
                | MessageContent::File { .. }
        )
    }

    /// 附件的远端地址
    pub fn remote_url(&self) -> Option<&str> {
        match self {
            MessageContent::Image { url, .. }
            | MessageContent::Voice { url, .. }
            | MessageContent::Video { url, .. }
            | MessageContent::File { url, .. } => Some(url.as_str()),
            _ => None,
        }
    }

    /// 附件的本地路径
    pub fn local_path(&self) -> Option<&str> {
        match self {
            MessageContent::Image { local_path, .. }
            | MessageContent::Voice { local_path, .. }
            | MessageContent::Video { local_path, .. }
            | MessageContent::File { local_path, .. } => local_path.as_deref(),
            _ => None,
        }
    }

    /// 附件大小
    pub fn file_size(&self) -> u64 {
        match self {
            MessageContent::Image { file_size, .. }
            | MessageContent::Voice { file_size, .. }
            | MessageContent::Video { file_size, .. }
            | MessageContent::File { file_size, .. } => *file_size,
            _ => 0,
        }
    }

    /// 有本地文件但还没有远端地址时需要先上传
    pub fn requires_upload(&self) -> bool {
        self.is_attachment()
            && self.remote_url().map_or(true, str::is_empty)
            && self.local_path().map_or(false, |p| !p.is_empty())
    }

    /// 上传完成后写入远端地址，返回新的内容
    pub fn with_remote_url(&self, remote: &str) -> MessageContent {
        let mut content = self.clone();
        match &mut content {
            MessageContent::Image { url, .. }
            | MessageContent::Voice { url, .. }
            | MessageContent::Video { url, .. }
            | MessageContent::File { url, .. } => *url = remote.to_string(),
            _ => {}
        }
        content
    }

    /// 用于去重的内容字节
    ///
    /// 取当前形态的关键字段；关键字段为空时退回整个内容的二进制编码。
    pub fn dedup_payload(&self) -> Vec<u8> {
        let typed: Vec<u8> = match self {
            MessageContent::Text { text } => text.as_bytes().to_vec(),
            MessageContent::Image { url, local_path, .. }
            | MessageContent::Voice { url, local_path, .. }
            | MessageContent::Video { url, local_path, .. } => {
                if url.is_empty() {
                    local_path.clone().unwrap_or_default().into_bytes()
                } else {
                    url.as_bytes().to_vec()
                }
            }
            MessageContent::File { file_name, url, local_path, .. } => {
                let location = if url.is_empty() {
                    local_path.clone().unwrap_or_default()
                } else {
                    url.clone()
                };
                if location.is_empty() {
                    Vec::new()
                } else {
                    format!("{}|{}", file_name, location).into_bytes()
                }
            }
            MessageContent::Sticker { sticker_id, pack_id, .. } => {
                if sticker_id.is_empty() {
                    Vec::new()
                } else {
                    format!("{}/{}", pack_id, sticker_id).into_bytes()
                }
            }
            MessageContent::Opaque { bytes, .. } => bytes.clone(),
        };

        if typed.is_empty() {
            bincode::serialize(self).unwrap_or_default()
        } else {
            typed
        }
    }
}

/// 聊天消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 客户端生成的全局唯一 id
    pub id: String,
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub from_uid: String,
    pub to_uid: String,
    pub content: MessageContent,
    /// 客户端时间戳（毫秒）
    pub timestamp: i64,
    pub server_seq: Option<u64>,
    pub server_timestamp: Option<i64>,
    pub status: MessageStatus,
    pub reply: Option<ReplyInfo>,
    pub mention_uids: Vec<String>,
    pub is_edited: bool,
    pub is_read: bool,
    /// 是否为本端发出
    pub is_self: bool,
}

impl Message {
    /// 创建一条本端发出的新消息，id 为 UUID v4
    pub fn new<C, F, T>(conversation_id: C, from_uid: F, to_uid: T, content: MessageContent) -> Self
    where
        C: Into<String>,
        F: Into<String>,
        T: Into<String>,
    {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            conversation_type: ConversationType::Single,
            from_uid: from_uid.into(),
            to_uid: to_uid.into(),
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
            server_seq: None,
            server_timestamp: None,
            status: MessageStatus::Pending,
            reply: None,
            mention_uids: Vec::new(),
            is_edited: false,
            is_read: false,
            is_self: true,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_conversation_type(mut self, conversation_type: ConversationType) -> Self {
        self.conversation_type = conversation_type;
        self
    }

    pub fn with_reply(mut self, reply: ReplyInfo) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn with_mentions(mut self, uids: Vec<String>) -> Self {
        self.mention_uids = uids;
        self
    }

    pub fn with_content(&self, content: MessageContent) -> Self {
        Self {
            content,
            ..self.clone()
        }
    }

    pub fn with_status(&self, status: MessageStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// 投递队列中的消息
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub topic: String,
    pub qos: Qos,
    pub high_priority: bool,
    pub retry_count: u32,
    /// 上次重试时间（毫秒时间戳）
    pub last_retry_time: Option<i64>,
    /// 入队时间（毫秒时间戳）
    pub enqueue_time: i64,
}

impl QueuedMessage {
    pub fn new(message: Message, topic: String, qos: Qos, high_priority: bool) -> Self {
        Self {
            message,
            topic,
            qos,
            high_priority,
            retry_count: 0,
            last_retry_time: None,
            enqueue_time: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    /// 记录一次失败重试
    pub(crate) fn mark_retry(&mut self) {
        self.retry_count += 1;
        self.last_retry_time = Some(chrono::Utc::now().timestamp_millis());
    }
}
