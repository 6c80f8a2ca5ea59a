//! SDK 版本与线格式版本
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Wire Version** → 消息信封格式版本，见 `codec`

/// SDK semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 当前 SDK 编码出站消息时使用的信封版本
pub const WIRE_VERSION: u16 = 1;

/// 运行时查询 SDK 版本
pub fn sdk_version() -> &'static str {
    SDK_VERSION
}

/// 带线格式版本的完整描述，用于日志
pub fn version_string() -> String {
    format!("mqchat-sdk {} (wire v{})", SDK_VERSION, WIRE_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string() {
        assert!(!sdk_version().is_empty());
        assert!(version_string().contains(SDK_VERSION));
        assert!(version_string().contains("wire v1"));
    }
}
