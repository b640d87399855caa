//! 韧性控制器
//!
//! 每个平台一份独立状态：滑动窗口限流、熔断器、成功/失败计数。
//! 状态只在调用前（准入）和调用后（记录结果）短暂加锁，不跨网络调用持锁。

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry_policy;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use rate_limiter::{RateLimiterStats, SlidingWindowLimiter};
pub use retry_policy::FailureReason;

use crate::config::{MenuSyncConfig, ProviderPolicy};
use crate::error::{MenuSyncError, Result};
use crate::platform::PlatformType;
use crate::transport::ProviderCallError;

/// 准入被拒绝（本地决策，不是平台返回的错误）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionDenied {
    #[error("rate limit exceeded for {platform}, retry after {retry_after:?}")]
    RateLimited {
        platform: PlatformType,
        retry_after: Duration,
    },
    #[error("circuit open for {platform}, retry after {retry_after:?}")]
    CircuitOpen {
        platform: PlatformType,
        retry_after: Duration,
    },
}

impl AdmissionDenied {
    pub fn retry_after(&self) -> Duration {
        match self {
            AdmissionDenied::RateLimited { retry_after, .. }
            | AdmissionDenied::CircuitOpen { retry_after, .. } => *retry_after,
        }
    }
}

impl From<AdmissionDenied> for MenuSyncError {
    fn from(denied: AdmissionDenied) -> Self {
        match denied {
            AdmissionDenied::RateLimited { platform, retry_after } => {
                MenuSyncError::RateLimitExceeded { platform, retry_after }
            }
            AdmissionDenied::CircuitOpen { platform, retry_after } => {
                MenuSyncError::CircuitOpen { platform, retry_after }
            }
        }
    }
}

/// 平台健康快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub platform: PlatformType,
    pub breaker_state: BreakerState,
    pub consecutive_failures: u32,
    pub times_opened: u64,
    pub retry_after_ms: u64,
    pub window_in_use: u32,
    pub window_max: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_permanent_failures: u64,
    pub denied_rate_limited: u64,
    pub denied_circuit_open: u64,
}

struct ProviderGate {
    policy: ProviderPolicy,
    limiter: SlidingWindowLimiter,
    breaker: CircuitBreaker,
}

#[derive(Default)]
struct ProviderTallies {
    successes: AtomicU64,
    failures: AtomicU64,
    permanent_failures: AtomicU64,
    denied_rate_limited: AtomicU64,
    denied_circuit_open: AtomicU64,
}

struct ProviderSlot {
    platform: PlatformType,
    gate: Mutex<ProviderGate>,
    tallies: ProviderTallies,
}

impl ProviderSlot {
    fn new(platform: PlatformType, policy: ProviderPolicy) -> Self {
        Self {
            platform,
            gate: Mutex::new(ProviderGate {
                limiter: SlidingWindowLimiter::new(&policy.rate_limit),
                breaker: CircuitBreaker::new(&policy.circuit_breaker),
                policy,
            }),
            tallies: ProviderTallies::default(),
        }
    }
}

/// 韧性控制器
pub struct ResilienceController {
    slots: [ProviderSlot; 3],
}

impl ResilienceController {
    pub fn new(config: &MenuSyncConfig) -> Self {
        Self {
            slots: PlatformType::ALL.map(|p| ProviderSlot::new(p, config.policy(p))),
        }
    }

    fn slot(&self, platform: PlatformType) -> &ProviderSlot {
        &self.slots[platform.index()]
    }

    /// 滑动窗口限流检查；返回 true 即占用一个名额
    pub fn check_rate_limit(&self, platform: PlatformType) -> bool {
        let slot = self.slot(platform);
        let allowed = slot.gate.lock().limiter.try_acquire();
        if !allowed {
            slot.tallies.denied_rate_limited.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// 熔断检查；半开状态下返回 true 即占用试探名额
    pub fn check_circuit_breaker(&self, platform: PlatformType) -> bool {
        let slot = self.slot(platform);
        let allowed = slot.gate.lock().breaker.try_acquire();
        if !allowed {
            slot.tallies.denied_circuit_open.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// 准入：熔断与限流一起判定，熔断放行但限流拒绝时归还试探名额
    pub fn acquire(&self, platform: PlatformType) -> std::result::Result<(), AdmissionDenied> {
        let slot = self.slot(platform);
        let mut gate = slot.gate.lock();

        if !gate.breaker.try_acquire() {
            slot.tallies.denied_circuit_open.fetch_add(1, Ordering::Relaxed);
            return Err(AdmissionDenied::CircuitOpen {
                platform,
                retry_after: gate.breaker.retry_after(),
            });
        }
        if !gate.limiter.try_acquire() {
            gate.breaker.release_trial();
            slot.tallies.denied_rate_limited.fetch_add(1, Ordering::Relaxed);
            return Err(AdmissionDenied::RateLimited {
                platform,
                retry_after: gate.limiter.retry_after(),
            });
        }
        Ok(())
    }

    pub fn record_success(&self, platform: PlatformType) {
        let slot = self.slot(platform);
        slot.gate.lock().breaker.record_success();
        slot.tallies.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, platform: PlatformType) {
        let slot = self.slot(platform);
        slot.gate.lock().breaker.record_failure();
        slot.tallies.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次失败调用并返回是否可重试。
    /// 永久错误（4xx）不计入熔断，只归还半开试探名额。
    pub fn record_call_failure(&self, platform: PlatformType, reason: &FailureReason) -> bool {
        let slot = self.slot(platform);
        let mut gate = slot.gate.lock();
        let retryable = reason.is_retryable(&gate.policy.extra_retryable_statuses);
        if retryable {
            gate.breaker.record_failure();
            slot.tallies.failures.fetch_add(1, Ordering::Relaxed);
        } else {
            gate.breaker.release_trial();
            slot.tallies.permanent_failures.fetch_add(1, Ordering::Relaxed);
        }
        retryable
    }

    pub fn is_retryable_error(&self, platform: PlatformType, error: &ProviderCallError) -> bool {
        let reason = FailureReason::from_call_error(error);
        reason.is_retryable(&self.slot(platform).gate.lock().policy.extra_retryable_statuses)
    }

    /// 第 attempt 次重试前的退避（含抖动）
    pub fn delay(&self, platform: PlatformType, attempt: u32) -> Duration {
        self.slot(platform).gate.lock().policy.retry.delay(attempt)
    }

    pub fn policy(&self, platform: PlatformType) -> ProviderPolicy {
        self.slot(platform).gate.lock().policy.clone()
    }

    /// 热更新平台策略；限流窗口内的记录与熔断状态保留
    pub fn update_policy(&self, platform: PlatformType, policy: ProviderPolicy) -> Result<()> {
        policy.validate()?;
        let mut gate = self.slot(platform).gate.lock();
        gate.limiter.reconfigure(&policy.rate_limit);
        gate.breaker.reconfigure(&policy.circuit_breaker);
        gate.policy = policy;
        info!("✅ [{}] 平台策略已更新 / provider policy reloaded", platform);
        Ok(())
    }

    pub fn breaker_state(&self, platform: PlatformType) -> BreakerState {
        self.slot(platform).gate.lock().breaker.state()
    }

    pub fn health(&self, platform: PlatformType) -> ProviderHealth {
        let slot = self.slot(platform);
        let mut gate = slot.gate.lock();
        let window = gate.limiter.stats();
        ProviderHealth {
            platform: slot.platform,
            breaker_state: gate.breaker.state(),
            consecutive_failures: gate.breaker.consecutive_failures(),
            times_opened: gate.breaker.times_opened(),
            retry_after_ms: gate.breaker.retry_after().as_millis() as u64,
            window_in_use: window.in_window,
            window_max: window.max_calls,
            total_successes: slot.tallies.successes.load(Ordering::Relaxed),
            total_failures: slot.tallies.failures.load(Ordering::Relaxed),
            total_permanent_failures: slot.tallies.permanent_failures.load(Ordering::Relaxed),
            denied_rate_limited: slot.tallies.denied_rate_limited.load(Ordering::Relaxed),
            denied_circuit_open: slot.tallies.denied_circuit_open.load(Ordering::Relaxed),
        }
    }

    /// 重置熔断与限流窗口（运维操作）
    pub fn reset(&self, platform: PlatformType) {
        let mut gate = self.slot(platform).gate.lock();
        gate.breaker.reset();
        gate.limiter.reset();
        warn!("⚠️ [{}] 韧性状态已重置 / resilience state reset", platform);
    }
}

impl std::fmt::Debug for ResilienceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let states: Vec<_> = PlatformType::ALL
            .iter()
            .map(|p| (p.as_str(), self.slot(*p).gate.lock().breaker.state()))
            .collect();
        f.debug_struct("ResilienceController")
            .field("breakers", &states)
            .finish()
    }
}
