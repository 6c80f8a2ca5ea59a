//! 退避策略
//!
//! | 用途 | 策略 | 默认值 |
//! |------|------|--------|
//! | 重连 | 指数退避，封顶 | 1s → 2s → 4s … 30s |
//! | 投递队列重试 | 基础延迟 × 重试次数 | 2s, 4s, 6s |
//! | 直发重试 | 固定 + 线性递增 | 1s, 2s |

use std::time::Duration;

/// 指数退避：`min(ceiling, base * 2^attempts)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    ceiling: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling }
    }

    pub fn from_millis(base_ms: u64, ceiling_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(ceiling_ms))
    }

    /// 第 `attempts` 次失败后的等待时间
    pub fn delay_for(&self, attempts: u32) -> Duration {
        // 2^31 以上必然超过上限，避免溢出
        let factor = 1u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}

/// 线性退避：`fixed + step * attempt`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    fixed: Duration,
    step: Duration,
}

impl LinearBackoff {
    pub fn new(fixed: Duration, step: Duration) -> Self {
        Self { fixed, step }
    }

    /// 只有线性部分：`step * attempt`
    pub fn proportional(step: Duration) -> Self {
        Self::new(Duration::ZERO, step)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.fixed.saturating_add(self.step.saturating_mul(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let backoff = ExponentialBackoff::from_millis(1000, 30_000);
        assert_eq!(backoff.delay_for(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(16_000));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(30_000));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_linear_backoff() {
        let queue = LinearBackoff::proportional(Duration::from_millis(2000));
        assert_eq!(queue.delay_for(1), Duration::from_millis(2000));
        assert_eq!(queue.delay_for(3), Duration::from_millis(6000));

        let direct = LinearBackoff::new(Duration::from_millis(1000), Duration::from_millis(1000));
        assert_eq!(direct.delay_for(0), Duration::from_millis(1000));
        assert_eq!(direct.delay_for(2), Duration::from_millis(3000));
    }
}
