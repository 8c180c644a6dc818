use crate::config::TransferConfig;
use std::time::Duration;

/// 分片重试策略
///
/// 第 n 次尝试失败后的等待时间：`min(base * multiplier^(n-1), max)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl RetryPolicy {
    /// `attempts` 为已经完成的尝试次数（从 1 开始）
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_millis = self.max.as_millis() as f64;
        if !millis.is_finite() || millis >= max_millis {
            return self.max;
        }
        Duration::from_millis(millis as u64)
    }

    /// 已尝试 `attempts` 次后是否还能再试
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}

impl From<&TransferConfig> for RetryPolicy {
    fn from(config: &TransferConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.retry_backoff_base_ms),
            multiplier: config.retry_backoff_multiplier,
            max: Duration::from_millis(config.retry_backoff_max_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::from(&TransferConfig::default());
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2000));
        // 上限 30s
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_bound() {
        let policy = RetryPolicy::from(&TransferConfig {
            max_retries: 2,
            ..TransferConfig::default()
        });
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_constant_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            base: Duration::from_millis(100),
            multiplier: 1.0,
            max: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(100));
    }
}
