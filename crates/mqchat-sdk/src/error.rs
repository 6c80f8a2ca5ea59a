use std::fmt;

/// 错误分类
///
/// 每个具体错误都归入一类，决定它是本地恢复（重试/记录日志）还是上报给监听器。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 连接断开或不可用，按退避策略重试
    TransientNetwork,
    /// 发送请求不合法，同步失败，不入队
    Validation,
    /// TTL 窗口内重复的消息，静默丢弃
    DuplicateMessage,
    /// 附件上传失败，本次发送终止
    UploadFailure,
    /// broker 拒绝或未确认投递，由投递队列重试
    PublishFailure,
    /// 入站帧格式错误，丢弃
    DeserializationFailure,
    /// 本地存储、配置、运行时等其它错误
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TransientNetwork => "TransientNetworkError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::DuplicateMessage => "DuplicateMessage",
            ErrorKind::UploadFailure => "UploadFailure",
            ErrorKind::PublishFailure => "PublishFailure",
            ErrorKind::DeserializationFailure => "DeserializationFailure",
            ErrorKind::Internal => "Internal",
        };
        write!(f, "{}", name)
    }
}

/// 监听器回调中使用的错误码
pub mod codes {
    /// 普通发送失败
    pub const SEND_FAILED: i32 = 1001;
    /// 请求校验失败
    pub const VALIDATION_FAILED: i32 = 1002;
    /// 重试次数耗尽
    pub const RETRY_EXHAUSTED: i32 = 1003;
    /// 附件上传失败
    pub const UPLOAD_FAILED: i32 = 2000;
}

#[derive(Debug, thiserror::Error)]
pub enum MqChatError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate message: {0}")]
    DuplicateMessage(String),

    #[error("Upload failure: {0}")]
    UploadFailure(String),

    #[error("Publish failure: {0}")]
    PublishFailure(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Queue is full: {0}")]
    QueueFull(String),

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Config error: {0}")]
    Config(String),
}

impl MqChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MqChatError::TransientNetwork(_) | MqChatError::NotConnected | MqChatError::Timeout(_) => {
                ErrorKind::TransientNetwork
            }
            MqChatError::Validation(_) => ErrorKind::Validation,
            MqChatError::DuplicateMessage(_) => ErrorKind::DuplicateMessage,
            MqChatError::UploadFailure(_) | MqChatError::Http(_) => ErrorKind::UploadFailure,
            MqChatError::PublishFailure(_) | MqChatError::RetryExhausted { .. } => {
                ErrorKind::PublishFailure
            }
            MqChatError::Deserialization(_) => ErrorKind::DeserializationFailure,
            MqChatError::Storage(_)
            | MqChatError::Serialization(_)
            | MqChatError::Io(_)
            | MqChatError::Canceled(_)
            | MqChatError::QueueFull(_)
            | MqChatError::ShuttingDown
            | MqChatError::Config(_) => ErrorKind::Internal,
        }
    }

    /// 是否值得重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MqChatError::TransientNetwork(_)
                | MqChatError::NotConnected
                | MqChatError::Timeout(_)
                | MqChatError::PublishFailure(_)
        )
    }

    /// 上报给发送监听器的错误码
    pub fn error_code(&self) -> i32 {
        match self {
            MqChatError::Validation(_) => codes::VALIDATION_FAILED,
            MqChatError::UploadFailure(_) | MqChatError::Http(_) => codes::UPLOAD_FAILED,
            MqChatError::RetryExhausted { .. } => codes::RETRY_EXHAUSTED,
            _ => codes::SEND_FAILED,
        }
    }
}

impl From<sled::Error> for MqChatError {
    fn from(error: sled::Error) -> Self {
        MqChatError::Storage(error.to_string())
    }
}

impl From<bincode::Error> for MqChatError {
    fn from(error: bincode::Error) -> Self {
        MqChatError::Serialization(error.to_string())
    }
}

impl From<serde_json::Error> for MqChatError {
    fn from(error: serde_json::Error) -> Self {
        MqChatError::Serialization(error.to_string())
    }
}

impl From<reqwest::Error> for MqChatError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            MqChatError::Timeout(error.to_string())
        } else {
            MqChatError::Http(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, MqChatError>;
