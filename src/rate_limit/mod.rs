//! 全局请求限流：两次上游请求之间保持最小间隔

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

pub struct RateLimiter {
    interval: Option<Duration>,
    wait: bool,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            interval: config.interval,
            wait: config.wait,
            last_request: Mutex::new(None),
        }
    }

    /// 间隔未到时：配置了等待则睡到下一个时间窗口，否则返回 `RateLimited`
    pub async fn check(&self) -> Result<()> {
        let Some(interval) = self.interval else {
            return Ok(());
        };

        let remaining = {
            let mut last = self.last_request.lock().await;
            let now = Instant::now();
            let remaining = last
                .map(|at| (at + interval).saturating_duration_since(now))
                .unwrap_or_default();

            if remaining.is_zero() {
                *last = Some(now);
                return Ok(());
            }
            if !self.wait {
                return Err(Error::RateLimited {
                    retry_after_secs: remaining.as_secs_f64().ceil() as u64,
                });
            }
            // 先占住下一个时间窗口，再释放锁等待
            *last = Some(now + remaining);
            remaining
        };

        info!("Rate limit: waiting {}ms", remaining.as_millis());
        tokio::time::sleep(remaining).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(interval: Option<Duration>, wait: bool) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig { interval, wait })
    }

    #[tokio::test]
    async fn disabled_limiter_always_passes() {
        let limiter = limiter(None, false);
        for _ in 0..5 {
            limiter.check().await.unwrap();
        }
    }

    #[tokio::test]
    async fn rejects_within_interval_when_not_waiting() {
        let limiter = limiter(Some(Duration::from_secs(30)), false);
        limiter.check().await.unwrap();
        match limiter.check().await {
            Err(Error::RateLimited { retry_after_secs }) => assert!(retry_after_secs >= 29 && retry_after_secs <= 30),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn waits_for_next_slot() {
        let limiter = limiter(Some(Duration::from_millis(200)), true);
        let started = Instant::now();
        limiter.check().await.unwrap();
        limiter.check().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(190));
    }
}
