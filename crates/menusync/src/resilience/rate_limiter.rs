//! 滑动窗口限流器
//!
//! 记录窗口内每次放行的时间点，超过上限直接拒绝（不排队）。
//! 使用 `tokio::time::Instant`，测试中可以暂停/推进时钟。

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitPolicy;

/// 限流器统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub in_window: u32,
    pub max_calls: u32,
    pub total_allowed: u64,
    pub total_rejected: u64,
}

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_calls: u32,
    window: Duration,
    /// 窗口内放行的时间点（单调递增）
    hits: VecDeque<Instant>,
    total_allowed: u64,
    total_rejected: u64,
}

impl SlidingWindowLimiter {
    pub fn new(policy: &RateLimitPolicy) -> Self {
        Self {
            max_calls: policy.max_calls,
            window: Duration::from_secs(policy.window_secs),
            hits: VecDeque::with_capacity(policy.max_calls as usize),
            total_allowed: 0,
            total_rejected: 0,
        }
    }

    /// 热更新窗口参数，保留已有记录
    pub fn reconfigure(&mut self, policy: &RateLimitPolicy) {
        self.max_calls = policy.max_calls;
        self.window = Duration::from_secs(policy.window_secs);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// 尝试占用一个名额
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        self.evict(now);
        if (self.hits.len() as u32) < self.max_calls {
            self.hits.push_back(now);
            self.total_allowed += 1;
            true
        } else {
            self.total_rejected += 1;
            false
        }
    }

    /// 距离下一个名额释放还需多久
    pub fn retry_after(&mut self) -> Duration {
        let now = Instant::now();
        self.evict(now);
        if (self.hits.len() as u32) < self.max_calls {
            return Duration::ZERO;
        }
        self.hits
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(Duration::ZERO)
    }

    pub fn stats(&mut self) -> RateLimiterStats {
        self.evict(Instant::now());
        RateLimiterStats {
            in_window: self.hits.len() as u32,
            max_calls: self.max_calls,
            total_allowed: self.total_allowed,
            total_rejected: self.total_rejected,
        }
    }

    pub fn reset(&mut self) {
        self.hits.clear();
    }
}
