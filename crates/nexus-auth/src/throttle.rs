use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::AuthError;

// ── Login Throttle ───────────────────────────────────────────────
//
// IP-blacklist collaborator. Every failed authentication step records
// an attempt against the client IP; success resets the counter.

#[async_trait]
pub trait LoginThrottle: Send + Sync {
    /// Errors with `RateLimited` once the IP has exceeded the
    /// failure threshold within the window.
    async fn check(&self, ip: &str) -> Result<(), AuthError>;
    async fn record_failure(&self, ip: &str);
    async fn reset(&self, ip: &str);
}

pub struct MemoryLoginThrottle {
    max_failures: usize,
    window: Duration,
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl MemoryLoginThrottle {
    pub fn new(max_failures: usize, window: Duration) -> Self {
        Self {
            max_failures,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLoginThrottle {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(15 * 60))
    }
}

#[async_trait]
impl LoginThrottle for MemoryLoginThrottle {
    async fn check(&self, ip: &str) -> Result<(), AuthError> {
        let mut attempts = self.attempts.lock().await;
        let Some(entries) = attempts.get_mut(ip) else {
            return Ok(());
        };

        let now = Instant::now();
        entries.retain(|t| now.duration_since(*t) < self.window);

        if entries.len() >= self.max_failures {
            return Err(AuthError::RateLimited);
        }
        Ok(())
    }

    async fn record_failure(&self, ip: &str) {
        let mut attempts = self.attempts.lock().await;
        attempts.entry(ip.to_string()).or_default().push(Instant::now());
    }

    async fn reset(&self, ip: &str) {
        self.attempts.lock().await.remove(ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocks_after_threshold() {
        let throttle = MemoryLoginThrottle::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(throttle.check("10.1.1.1").await.is_ok());
            throttle.record_failure("10.1.1.1").await;
        }
        assert!(matches!(
            throttle.check("10.1.1.1").await,
            Err(AuthError::RateLimited)
        ));
        // Other IPs are unaffected.
        assert!(throttle.check("10.1.1.2").await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_clears_counter() {
        let throttle = MemoryLoginThrottle::new(1, Duration::from_secs(60));
        throttle.record_failure("10.2.2.2").await;
        assert!(throttle.check("10.2.2.2").await.is_err());

        throttle.reset("10.2.2.2").await;
        assert!(throttle.check("10.2.2.2").await.is_ok());
    }

    #[tokio::test]
    async fn test_window_expiry() {
        let throttle = MemoryLoginThrottle::new(1, Duration::from_millis(10));
        throttle.record_failure("10.3.3.3").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(throttle.check("10.3.3.3").await.is_ok());
    }
}
