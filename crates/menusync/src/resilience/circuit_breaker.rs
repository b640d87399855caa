//! 熔断器
//!
//! closed → (连续失败达到阈值) → open → (冷却结束) → half_open
//! half_open 同一时刻只放行一次试探；试探成功累计到阈值后关闭，试探失败重新打开并重新计时。

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::CircuitBreakerPolicy;

/// 对外展示的熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum CircuitState {
    Closed { failure_count: u32 },
    Open { opened_at: Instant },
    HalfOpen { trial_in_flight: bool, successes: u32 },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    half_open_trials: u32,
    state: CircuitState,
    times_opened: u64,
}

impl CircuitBreaker {
    pub fn new(policy: &CircuitBreakerPolicy) -> Self {
        Self {
            failure_threshold: policy.failure_threshold.max(1),
            cooldown: Duration::from_secs(policy.cooldown_secs),
            half_open_trials: policy.half_open_trials.max(1),
            state: CircuitState::Closed { failure_count: 0 },
            times_opened: 0,
        }
    }

    pub fn reconfigure(&mut self, policy: &CircuitBreakerPolicy) {
        self.failure_threshold = policy.failure_threshold.max(1);
        self.cooldown = Duration::from_secs(policy.cooldown_secs);
        self.half_open_trials = policy.half_open_trials.max(1);
    }

    /// 是否放行本次调用。半开状态下放行即占用唯一的试探名额。
    pub fn try_acquire(&mut self) -> bool {
        if let CircuitState::Open { opened_at } = self.state {
            if opened_at.elapsed() >= self.cooldown {
                self.state = CircuitState::HalfOpen {
                    trial_in_flight: false,
                    successes: 0,
                };
                info!("Circuit breaker transitioned to half-open state");
            }
        }

        match &mut self.state {
            CircuitState::Closed { .. } => true,
            CircuitState::Open { .. } => false,
            CircuitState::HalfOpen { trial_in_flight, .. } => {
                if *trial_in_flight {
                    false
                } else {
                    *trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// 归还未实际使用的试探名额
    pub fn release_trial(&mut self) {
        if let CircuitState::HalfOpen { trial_in_flight, .. } = &mut self.state {
            *trial_in_flight = false;
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed { .. } => {
                self.state = CircuitState::Closed { failure_count: 0 };
            }
            CircuitState::HalfOpen { successes, .. } => {
                let successes = successes + 1;
                if successes >= self.half_open_trials {
                    self.state = CircuitState::Closed { failure_count: 0 };
                    info!("✅ Circuit breaker closed after successful recovery");
                } else {
                    self.state = CircuitState::HalfOpen {
                        trial_in_flight: false,
                        successes,
                    };
                }
            }
            // 打开期间到达的迟到结果不改变状态
            CircuitState::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed { failure_count } => {
                let failure_count = failure_count + 1;
                if failure_count >= self.failure_threshold {
                    self.open();
                    error!("❌ Circuit breaker opened due to {} consecutive failures", failure_count);
                } else {
                    self.state = CircuitState::Closed { failure_count };
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.open();
                warn!("⚠️ Circuit breaker re-opened from half-open state");
            }
            CircuitState::Open { .. } => {}
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open {
            opened_at: Instant::now(),
        };
        self.times_opened += 1;
    }

    /// 打开状态下距离冷却结束的剩余时间
    pub fn retry_after(&self) -> Duration {
        match self.state {
            CircuitState::Open { opened_at } => self.cooldown.saturating_sub(opened_at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state {
            CircuitState::Closed { .. } => BreakerState::Closed,
            CircuitState::Open { .. } => BreakerState::Open,
            CircuitState::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        match self.state {
            CircuitState::Closed { failure_count } => failure_count,
            _ => self.failure_threshold,
        }
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed { failure_count: 0 };
    }
}
