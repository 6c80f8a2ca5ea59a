//! 消息信封编解码
//!
//! 线格式分两层：
//!
//! ```text
//! WireFrame { version, compressed, body }
//!   body = bincode(WireMessage)，超过阈值时压缩
//! WireMessage { 元数据..., selector, content }
//!   selector 为内容类型名，content 为该内容的编码
//! ```
//!
//! 不认识的 selector（新版本内容类型）解码为 `MessageContent::Opaque`，原始字节保留。

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::compression::Compressor;
use crate::error::{MqChatError, Result};
use crate::message::{ConversationType, Message, MessageContent, MessageStatus, ReplyInfo};
use crate::version::WIRE_VERSION;

const KNOWN_SELECTORS: [&str; 6] = ["text", "image", "voice", "video", "file", "sticker"];

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    version: u16,
    compressed: bool,
    body: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    id: String,
    conversation_id: String,
    conversation_type: ConversationType,
    from_uid: String,
    to_uid: String,
    timestamp: i64,
    server_seq: Option<u64>,
    server_timestamp: Option<i64>,
    reply: Option<ReplyInfo>,
    mention_uids: Vec<String>,
    is_edited: bool,
    selector: String,
    content: Vec<u8>,
}

/// 编码结果
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub bytes: Vec<u8>,
    pub is_compressed: bool,
}

pub struct MessageCodec {
    compressor: Arc<Compressor>,
}

impl MessageCodec {
    pub fn new(compressor: Arc<Compressor>) -> Self {
        Self { compressor }
    }

    pub fn compressor(&self) -> &Arc<Compressor> {
        &self.compressor
    }

    pub fn encode(&self, message: &Message) -> Result<EncodedMessage> {
        let (selector, content) = match &message.content {
            // 透传的内容保持原样，接收方按同样的 selector 还原
            MessageContent::Opaque { content_type, bytes } => (content_type.clone(), bytes.clone()),
            other => (other.type_name().to_string(), bincode::serialize(other)?),
        };

        let wire = WireMessage {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            conversation_type: message.conversation_type,
            from_uid: message.from_uid.clone(),
            to_uid: message.to_uid.clone(),
            timestamp: message.timestamp,
            server_seq: message.server_seq,
            server_timestamp: message.server_timestamp,
            reply: message.reply.clone(),
            mention_uids: message.mention_uids.clone(),
            is_edited: message.is_edited,
            selector,
            content,
        };

        let body = bincode::serialize(&wire)?;
        let compressed = self.compressor.compress(&body);
        let frame = WireFrame {
            version: WIRE_VERSION,
            compressed: compressed.is_compressed,
            body: compressed.content,
        };

        Ok(EncodedMessage {
            bytes: bincode::serialize(&frame)?,
            is_compressed: frame.compressed,
        })
    }

    /// 解码
    ///
    /// 解码出的消息状态为 `Sent`，`is_self` 由调用方决定。
    pub fn decode(&self, bytes: &[u8], is_self: bool) -> Result<Message> {
        if bytes.is_empty() {
            return Err(MqChatError::Deserialization("空消息帧".to_string()));
        }

        let frame: WireFrame = bincode::deserialize(bytes)
            .map_err(|e| MqChatError::Deserialization(format!("信封格式错误: {}", e)))?;
        if frame.version == 0 || frame.version > WIRE_VERSION {
            return Err(MqChatError::Deserialization(format!(
                "不支持的信封版本: {}",
                frame.version
            )));
        }

        let body = self.compressor.decompress(&frame.body, frame.compressed);
        let wire: WireMessage = bincode::deserialize(&body)
            .map_err(|e| MqChatError::Deserialization(format!("消息体格式错误: {}", e)))?;

        if wire.id.is_empty() {
            return Err(MqChatError::Deserialization("消息 id 为空".to_string()));
        }

        let content = decode_content(wire.selector, wire.content);

        Ok(Message {
            id: wire.id,
            conversation_id: wire.conversation_id,
            conversation_type: wire.conversation_type,
            from_uid: wire.from_uid,
            to_uid: wire.to_uid,
            content,
            timestamp: wire.timestamp,
            server_seq: wire.server_seq,
            server_timestamp: wire.server_timestamp,
            status: MessageStatus::Sent,
            reply: wire.reply,
            mention_uids: wire.mention_uids,
            is_edited: wire.is_edited,
            is_read: false,
            is_self,
        })
    }
}

fn decode_content(selector: String, bytes: Vec<u8>) -> MessageContent {
    if KNOWN_SELECTORS.contains(&selector.as_str()) {
        if let Ok(content) = bincode::deserialize::<MessageContent>(&bytes) {
            if content.type_name() == selector {
                return content;
            }
        }
        tracing::warn!("⚠️ 内容与类型 {} 不匹配，按透传内容处理", selector);
    }
    MessageContent::Opaque {
        content_type: selector,
        bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(threshold: usize) -> MessageCodec {
        MessageCodec::new(Arc::new(Compressor::new(threshold, 3)))
    }

    fn sample(content: MessageContent) -> Message {
        Message::new("conv-1", "alice", "bob", content)
            .with_id("m-1")
            .with_mentions(vec!["carol".to_string()])
    }

    #[test]
    fn test_text_roundtrip_uncompressed() {
        let codec = codec(1024);
        let message = sample(MessageContent::text("hi"));
        let encoded = codec.encode(&message).unwrap();
        assert!(!encoded.is_compressed);

        let decoded = codec.decode(&encoded.bytes, false).unwrap();
        assert_eq!(decoded.id, "m-1");
        assert_eq!(decoded.content, MessageContent::text("hi"));
        assert_eq!(decoded.mention_uids, vec!["carol".to_string()]);
        assert_eq!(decoded.status, MessageStatus::Sent);
        assert!(!decoded.is_self);
    }

    #[test]
    fn test_large_payload_compressed() {
        let codec = codec(1024);
        let message = sample(MessageContent::text("很长的消息 long message ".repeat(300)));
        let encoded = codec.encode(&message).unwrap();
        assert!(encoded.is_compressed);

        let decoded = codec.decode(&encoded.bytes, true).unwrap();
        assert_eq!(decoded.content, message.content);
    }

    #[test]
    fn test_attachment_roundtrip() {
        let codec = codec(1024);
        let message = sample(MessageContent::Video {
            url: "https://cdn/v.mp4".to_string(),
            local_path: None,
            cover_url: Some("https://cdn/v.jpg".to_string()),
            width: 1280,
            height: 720,
            duration: 12,
            file_size: 1 << 20,
        });
        let encoded = codec.encode(&message).unwrap();
        assert_eq!(codec.decode(&encoded.bytes, false).unwrap().content, message.content);
    }

    #[test]
    fn test_opaque_passthrough() {
        let codec = codec(1024);
        let message = sample(MessageContent::Opaque {
            content_type: "location".to_string(),
            bytes: vec![9, 8, 7],
        });
        let encoded = codec.encode(&message).unwrap();
        let decoded = codec.decode(&encoded.bytes, false).unwrap();
        assert_eq!(
            decoded.content,
            MessageContent::Opaque {
                content_type: "location".to_string(),
                bytes: vec![9, 8, 7],
            }
        );
    }

    #[test]
    fn test_rejects_garbage_and_future_versions() {
        let codec = codec(1024);
        assert!(matches!(codec.decode(&[], false), Err(MqChatError::Deserialization(_))));
        assert!(matches!(
            codec.decode(b"\x01\x02garbage", false),
            Err(MqChatError::Deserialization(_))
        ));

        let frame = WireFrame {
            version: WIRE_VERSION + 1,
            compressed: false,
            body: vec![],
        };
        let bytes = bincode::serialize(&frame).unwrap();
        assert!(matches!(codec.decode(&bytes, false), Err(MqChatError::Deserialization(_))));
    }
}
