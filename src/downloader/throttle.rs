//! 全局带宽限制（令牌桶）

use crate::error::{DownloadError, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// 所有任务共享的令牌桶
///
/// 桶容量为一秒的配额，写入每个数据块之前申请对应字节数的令牌
#[derive(Debug)]
pub struct BandwidthLimiter {
    rate: u64,
    bucket: Mutex<Bucket>,
}

impl BandwidthLimiter {
    /// `bytes_per_sec == 0` 表示不限速，返回 None
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        if bytes_per_sec == 0 {
            return None;
        }
        Some(Self {
            rate: bytes_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// 尝试扣除令牌，不足时返回需要等待的时长
    fn take(&self, amount: u64) -> Option<Duration> {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        bucket.last_refill = now;

        let need = amount as f64;
        if bucket.tokens >= need {
            bucket.tokens -= need;
            None
        } else {
            let missing = need - bucket.tokens;
            Some(Duration::from_secs_f64(missing / self.rate as f64))
        }
    }

    /// 申请 `amount` 字节的令牌，等待期间可被取消
    ///
    /// 大于桶容量的请求按容量拆分，避免永远等不到足够的令牌
    pub async fn acquire(&self, amount: u64, cancel: &CancellationToken) -> Result<()> {
        let mut remaining = amount;
        while remaining > 0 {
            let step = remaining.min(self.rate);
            match self.take(step) {
                None => remaining -= step,
                Some(wait) => {
                    debug!("限速等待 {:?} ({} bytes)", wait, step);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_means_unlimited() {
        assert!(BandwidthLimiter::new(0).is_none());
        assert_eq!(BandwidthLimiter::new(1024).unwrap().rate(), 1024);
    }

    #[tokio::test]
    async fn test_burst_then_throttle() {
        let limiter = BandwidthLimiter::new(1000).unwrap();
        let token = CancellationToken::new();

        let start = Instant::now();
        limiter.acquire(1000, &token).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));

        let start = Instant::now();
        limiter.acquire(500, &token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_large_request_is_split() {
        let limiter = BandwidthLimiter::new(100_000).unwrap();
        let token = CancellationToken::new();
        // 1.5 倍桶容量：先用掉整桶，剩余部分等待约 0.5 秒
        let start = Instant::now();
        limiter.acquire(150_000, &token).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let limiter = BandwidthLimiter::new(10).unwrap();
        let token = CancellationToken::new();
        limiter.acquire(10, &token).await.unwrap();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let result = limiter.acquire(10, &token).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(900));
    }
}
