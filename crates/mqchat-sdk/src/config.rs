use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MqChatError, Result};

/// broker 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// broker 地址，例如 tcp://broker.example.com:1883
    pub broker_url: String,
    /// client id 前缀，实际 id 为 `<prefix>-<毫秒时间戳>-<随机数>`
    pub client_id_prefix: String,
    /// 心跳间隔（秒）
    pub keep_alive_secs: u64,
    /// 单次连接超时（秒）
    pub connect_timeout_secs: u64,
    pub clean_session: bool,
    /// 最大未确认 publish 数
    pub max_inflight: u16,
    /// 传输层失败的最大重连次数
    pub max_reconnect_attempts: u32,
    /// 重连基础延迟（毫秒）
    pub reconnect_base_delay_ms: u64,
    /// 重连延迟上限（毫秒）
    pub reconnect_max_delay_ms: u64,
    /// 网络不可用时的固定重试延迟（毫秒），不计入退避次数
    pub unavailable_retry_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            client_id_prefix: "rust-client".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            clean_session: true,
            max_inflight: 100,
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            unavailable_retry_delay_ms: 5000,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// 投递队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 最大重试次数，超过后标记为失败
    pub max_retry_attempts: u32,
    /// 重试基础延迟（毫秒），实际延迟 = 基础延迟 * 重试次数
    pub retry_base_delay_ms: u64,
    /// 每个通道每轮最多处理的条数
    pub batch_size: usize,
    /// 每轮处理的时间预算（毫秒）
    pub batch_budget_ms: u64,
    /// 处理循环的轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 未连接时重新入队的延迟（毫秒）
    pub reconnect_requeue_delay_ms: u64,
    /// 等待 broker 确认的超时（秒）
    pub publish_timeout_secs: u64,
    /// 内存队列容量
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_base_delay_ms: 2000,
            batch_size: 10,
            batch_budget_ms: 1000,
            poll_interval_ms: 100,
            reconnect_requeue_delay_ms: 500,
            publish_timeout_secs: 30,
            max_queue_size: 1000,
        }
    }
}

/// 去重与压缩配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// 去重窗口（秒）
    pub ttl_secs: u64,
    /// 去重缓存最大条数
    pub max_entries: usize,
    /// 后台清理间隔（秒）
    pub sweep_interval_secs: u64,
    /// 压缩阈值（字节），小于该值不压缩
    pub compression_threshold: usize,
    /// zstd 压缩级别
    pub compression_level: i32,
    pub compression_enabled: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            max_entries: 10_000,
            sweep_interval_secs: 60 * 60,
            compression_threshold: 1024,
            compression_level: 3,
            compression_enabled: true,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// 发送编排配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendConfig {
    /// 直发路径的最大重试次数
    pub max_retries: u32,
    /// 固定延迟部分（毫秒）
    pub retry_fixed_delay_ms: u64,
    /// 线性递增部分（毫秒），第 n 次重试延迟 = 固定 + n * 递增
    pub retry_step_delay_ms: u64,
    /// 文件上传地址
    pub upload_url: Option<String>,
    /// 上传超时（秒）
    pub upload_timeout_secs: u64,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_fixed_delay_ms: 1000,
            retry_step_delay_ms: 1000,
            upload_url: None,
            upload_timeout_secs: 300, // 文件上传可能需要较长时间
        }
    }
}

/// MqChat SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqChatConfig {
    /// 数据存储目录（消息记录库）
    pub data_dir: PathBuf,
    /// 连接配置
    pub connection: ConnectionConfig,
    /// 队列配置
    pub queue: QueueConfig,
    /// 去重与压缩配置
    pub dedup: DedupConfig,
    /// 发送配置
    pub send: SendConfig,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for MqChatConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            connection: ConnectionConfig::default(),
            queue: QueueConfig::default(),
            dedup: DedupConfig::default(),
            send: SendConfig::default(),
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.mqchat/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".mqchat")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".mqchat")
    } else {
        PathBuf::from("./mqchat_data")
    }
}

impl MqChatConfig {
    pub fn builder() -> MqChatConfigBuilder {
        MqChatConfigBuilder::new()
    }

    /// 检查配置是否可用
    pub fn validate(&self) -> Result<()> {
        if self.connection.broker_url.trim().is_empty() {
            return Err(MqChatError::Config("broker_url 不能为空".to_string()));
        }
        if self.connection.reconnect_base_delay_ms == 0 {
            return Err(MqChatError::Config("reconnect_base_delay_ms 必须大于 0".to_string()));
        }
        if self.connection.reconnect_max_delay_ms < self.connection.reconnect_base_delay_ms {
            return Err(MqChatError::Config(
                "reconnect_max_delay_ms 不能小于 reconnect_base_delay_ms".to_string(),
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(MqChatError::Config("batch_size 必须大于 0".to_string()));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(MqChatError::Config("poll_interval_ms 必须大于 0".to_string()));
        }
        if self.queue.max_queue_size == 0 {
            return Err(MqChatError::Config("max_queue_size 必须大于 0".to_string()));
        }
        if self.dedup.max_entries == 0 {
            return Err(MqChatError::Config("max_entries 必须大于 0".to_string()));
        }
        if self.dedup.sweep_interval_secs == 0 {
            return Err(MqChatError::Config("sweep_interval_secs 必须大于 0".to_string()));
        }
        Ok(())
    }
}

/// MqChat SDK 配置构建器
pub struct MqChatConfigBuilder {
    config: MqChatConfig,
}

impl MqChatConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MqChatConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn broker_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.connection.broker_url = url.into();
        self
    }

    pub fn client_id_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.connection.client_id_prefix = prefix.into();
        self
    }

    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.config.queue = config;
        self
    }

    pub fn dedup_config(mut self, config: DedupConfig) -> Self {
        self.config.dedup = config;
        self
    }

    pub fn send_config(mut self, config: SendConfig) -> Self {
        self.config.send = config;
        self
    }

    /// 设置压缩阈值（字节）
    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.config.dedup.compression_threshold = bytes;
        self
    }

    /// 设置去重窗口
    pub fn dedup_ttl(mut self, ttl: Duration) -> Self {
        self.config.dedup.ttl_secs = ttl.as_secs();
        self
    }

    /// 设置文件上传地址
    pub fn upload_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.send.upload_url = Some(url.into());
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> MqChatConfig {
        self.config
    }
}

impl Default for MqChatConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = MqChatConfig::builder()
            .data_dir("/tmp/mqchat_test")
            .broker_url("tcp://10.0.0.1:1883")
            .compression_threshold(2048)
            .dedup_ttl(Duration::from_secs(600))
            .debug_mode(true)
            .build();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/mqchat_test"));
        assert_eq!(config.connection.broker_url, "tcp://10.0.0.1:1883");
        assert_eq!(config.dedup.compression_threshold, 2048);
        assert_eq!(config.dedup.ttl_secs, 600);
        assert!(config.debug_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = MqChatConfig::default();
        assert_eq!(config.queue.max_retry_attempts, 3);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.connection.max_reconnect_attempts, 10);
        assert_eq!(config.connection.reconnect_max_delay_ms, 30_000);
        assert_eq!(config.dedup.compression_threshold, 1024);
        assert_eq!(config.dedup.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.send.max_retries, 2);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = MqChatConfig::default();
        config.queue.batch_size = 0;
        assert!(matches!(config.validate(), Err(MqChatError::Config(_))));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = MqChatConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: MqChatConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.queue.retry_base_delay_ms, config.queue.retry_base_delay_ms);
    }
}
