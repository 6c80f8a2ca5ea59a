//! 日志初始化
//!
//! SDK 内部只使用 `tracing` 宏；宿主程序可以自行安装 subscriber，
//! 也可以调用 [`init_logging`] 使用默认的 fmt 输出。

use tracing::Level;

/// 安装默认 fmt subscriber
///
/// 调试模式输出 DEBUG 级别，否则输出 INFO。重复调用是安全的：
/// 已有全局 subscriber 时返回 false。
pub fn init_logging(debug_mode: bool) -> bool {
    let level = if debug_mode { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        let _ = init_logging(true);
        // 第二次一定失败，但不能 panic
        assert!(!init_logging(false));
    }
}
