//! 失败分类与退避计算

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RetrySettings;
use crate::transport::{ConnectionErrorKind, ProviderCallError};

/// 平台调用失败原因分类
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// 单次调用超时 - 可重试
    Timeout,
    /// 连接被拒绝/重置/DNS 失败 - 可重试
    Network(String),
    /// 平台限流 429 - 可重试
    RateLimited,
    /// 5xx - 可重试
    ServerError(u16),
    /// 4xx（429 除外）- 不重试
    ClientError(u16),
    /// 未知错误 - 保守起见可重试
    Unknown(String),
}

impl FailureReason {
    pub fn from_call_error(error: &ProviderCallError) -> Self {
        match error {
            ProviderCallError::Timeout => FailureReason::Timeout,
            ProviderCallError::Connection { kind, message } => {
                let kind = match kind {
                    ConnectionErrorKind::Refused => "refused",
                    ConnectionErrorKind::Reset => "reset",
                    ConnectionErrorKind::Dns => "dns",
                    ConnectionErrorKind::Other => "connect",
                };
                FailureReason::Network(format!("{}: {}", kind, message))
            }
            ProviderCallError::Http { status: 429, .. } => FailureReason::RateLimited,
            ProviderCallError::Http { status, .. } if *status >= 500 => {
                FailureReason::ServerError(*status)
            }
            ProviderCallError::Http { status, .. } => FailureReason::ClientError(*status),
            ProviderCallError::Other(message) => FailureReason::Unknown(message.clone()),
        }
    }

    /// 是否可重试；`extra_statuses` 为平台额外声明可重试的状态码
    pub fn is_retryable(&self, extra_statuses: &[u16]) -> bool {
        match self {
            FailureReason::Timeout
            | FailureReason::Network(_)
            | FailureReason::RateLimited
            | FailureReason::ServerError(_)
            | FailureReason::Unknown(_) => true,
            FailureReason::ClientError(code) => extra_statuses.contains(code),
        }
    }
}

impl RetrySettings {
    /// 不含抖动的退避：min(max_delay, base_delay * 2^attempt)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// 带 ±jitter_ratio 抖动的退避，结果不超过 max_delay
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let ratio = self.jitter_ratio.clamp(0.0, 0.99);
        let jitter = if ratio > 0.0 {
            rand::thread_rng().gen_range(-ratio..=ratio)
        } else {
            0.0
        };
        let millis = (base * (1.0 + jitter)).max(0.0).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// 是否还有重试机会
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RetrySettings {
        RetrySettings {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_ratio: 0.2,
        }
    }

    #[test]
    fn test_base_delay_non_decreasing_and_capped() {
        let s = settings();
        let mut previous = Duration::ZERO;
        for attempt in 0..80 {
            let d = s.base_delay(attempt);
            assert!(d >= previous);
            assert!(d <= Duration::from_millis(s.max_delay_ms));
            previous = d;
        }
        assert_eq!(s.base_delay(0), Duration::from_millis(500));
        assert_eq!(s.base_delay(3), Duration::from_millis(4_000));
        assert_eq!(s.base_delay(10), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let s = settings();
        for attempt in 0..6 {
            let base = s.base_delay(attempt).as_millis() as f64;
            for _ in 0..50 {
                let d = s.delay(attempt).as_millis() as f64;
                assert!(d >= (base * 0.8).floor());
                assert!(d <= (base * 1.2).ceil());
                assert!(d <= s.max_delay_ms as f64);
            }
        }
    }

    #[test]
    fn test_classification() {
        let cases = [
            (ProviderCallError::Timeout, true),
            (
                ProviderCallError::Connection {
                    kind: ConnectionErrorKind::Reset,
                    message: "reset by peer".into(),
                },
                true,
            ),
            (ProviderCallError::Http { status: 429, body: String::new() }, true),
            (ProviderCallError::Http { status: 502, body: String::new() }, true),
            (ProviderCallError::Http { status: 400, body: String::new() }, false),
            (ProviderCallError::Http { status: 401, body: String::new() }, false),
            (ProviderCallError::Http { status: 404, body: String::new() }, false),
        ];
        for (error, retryable) in cases {
            assert_eq!(
                FailureReason::from_call_error(&error).is_retryable(&[]),
                retryable,
                "{:?}",
                error
            );
        }
    }

    #[test]
    fn test_extra_retryable_statuses() {
        let reason = FailureReason::ClientError(409);
        assert!(!reason.is_retryable(&[]));
        assert!(reason.is_retryable(&[409]));
    }

    #[test]
    fn test_should_retry() {
        let s = settings();
        assert!(s.should_retry(2));
        assert!(!s.should_retry(3));
    }
}
