use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkStatus {
    /// 在线
    Online = 0,
    /// 离线
    Offline = 1,
    /// 网络受限
    Limited = 2,
}

impl NetworkStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NetworkStatus::Online,
            2 => NetworkStatus::Limited,
            _ => NetworkStatus::Offline,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络可达性判断（由平台层实现，如 Android/iOS）
///
/// 结果只作参考：用于选择重连延迟和记录日志，从不决定消息能否发送。
pub trait ReachabilityOracle: Send + Sync + std::fmt::Debug {
    /// 当前网络状态
    fn status(&self) -> NetworkStatus;

    /// 网络是否可用
    fn is_available(&self) -> bool {
        self.status().is_available()
    }
}

/// 手动设置状态的可达性实现
///
/// 平台层可以在系统网络回调里调用 [`StaticReachability::set_status`]；
/// 测试里用它模拟断网。
#[derive(Debug)]
pub struct StaticReachability {
    status: AtomicU8,
}

impl StaticReachability {
    pub fn new(status: NetworkStatus) -> Self {
        Self {
            status: AtomicU8::new(status as u8),
        }
    }

    pub fn online() -> Self {
        Self::new(NetworkStatus::Online)
    }

    pub fn offline() -> Self {
        Self::new(NetworkStatus::Offline)
    }

    pub fn set_status(&self, status: NetworkStatus) {
        let old = NetworkStatus::from_u8(self.status.swap(status as u8, Ordering::SeqCst));
        if old != status {
            tracing::info!("📡 网络状态变化: {:?} -> {:?}", old, status);
        }
    }
}

impl Default for StaticReachability {
    fn default() -> Self {
        Self::online()
    }
}

impl ReachabilityOracle for StaticReachability {
    fn status(&self) -> NetworkStatus {
        NetworkStatus::from_u8(self.status.load(Ordering::SeqCst))
    }
}
