//! 发布/订阅传输层抽象（MQTT 语义）
//!
//! 传输层把异步结果通过 [`TransportEvent`] 推给连接管理器：投递确认、连接断开、
//! 收到消息。这些事件来自传输层自己的 I/O 任务，与投递队列并发到达。

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{MqChatError, Result};

pub use memory::MemoryTransport;

/// 投递质量等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Qos {
    /// 最多一次
    AtMostOnce = 0,
    /// 至少一次
    AtLeastOnce = 1,
    /// 恰好一次
    ExactlyOnce = 2,
}

impl Qos {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for Qos {
    type Error = MqChatError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(MqChatError::Validation(format!("QoS 只能是 0、1、2，实际为 {}", other))),
        }
    }
}

impl Default for Qos {
    fn default() -> Self {
        Qos::AtLeastOnce
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS{}", self.as_u8())
    }
}

/// 登录凭据
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 身份/令牌提供方
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// 当前可用的凭据，匿名连接返回 None
    async fn credentials(&self) -> Option<Credentials>;
}

/// 固定凭据
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credentials: Option<Credentials>,
}

impl StaticCredentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            credentials: Some(Credentials {
                username: username.into(),
                password: password.into(),
            }),
        }
    }

    pub fn anonymous() -> Self {
        Self { credentials: None }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }
}

/// 连接参数
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub broker_url: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub clean_session: bool,
    pub max_inflight: u16,
    pub credentials: Option<Credentials>,
}

/// 传输层事件
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// publish 的最终结果
    DeliveryComplete {
        message_id: String,
        result: std::result::Result<(), String>,
    },
    /// 连接断开
    ConnectionLost { reason: String },
    /// 收到订阅主题上的消息
    MessageArrived { topic: String, payload: Bytes },
}

/// 收到的原始帧
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub topic: String,
    pub payload: Bytes,
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// 发布/订阅传输
///
/// `publish` 返回 Ok 只表示请求已交给 broker；最终结果通过
/// [`TransportEvent::DeliveryComplete`] 异步通知。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立连接，之后的事件都发往 `events`
    async fn connect(&self, options: &ConnectOptions, events: TransportEventSender) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Bytes, qos: Qos, message_id: &str) -> Result<()>;

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// 优雅断开
    async fn disconnect(&self) -> Result<()>;

    /// 释放底层句柄
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_conversion() {
        assert_eq!(Qos::try_from(0).unwrap(), Qos::AtMostOnce);
        assert_eq!(Qos::try_from(2).unwrap(), Qos::ExactlyOnce);
        assert!(matches!(Qos::try_from(3), Err(MqChatError::Validation(_))));
        assert_eq!(Qos::default().as_u8(), 1);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("secret"));
    }

    #[tokio::test]
    async fn test_static_credentials() {
        assert!(StaticCredentials::anonymous().credentials().await.is_none());
        let creds = StaticCredentials::new("alice", "token").credentials().await.unwrap();
        assert_eq!(creds.username, "alice");
    }
}
