//! 引擎配置
//!
//! 每个平台一份 [`ProviderPolicy`]（限流、熔断、重试、单次调用超时），
//! 运行期可通过 `ResilienceController::update_policy` 热更新。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MenuSyncError, Result};
use crate::platform::PlatformType;

/// 滑动窗口限流
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// 窗口内最大调用次数
    pub max_calls: u32,
    /// 窗口长度（秒）
    pub window_secs: u64,
}

/// 熔断器阈值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// 打开后的冷却时间（秒）
    pub cooldown_secs: u64,
    /// 半开状态下需要多少次试探成功才关闭
    pub half_open_trials: u32,
}

/// 重试与退避
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 抖动比例，0.2 表示 ±20%
    pub jitter_ratio: f64,
}

/// 单个平台的韧性策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPolicy {
    pub rate_limit: RateLimitPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
    pub retry: RetrySettings,
    /// 单次平台调用超时（秒）
    pub call_timeout_secs: u64,
    /// 平台文档声明可重试的额外 HTTP 状态码
    #[serde(default)]
    pub extra_retryable_statuses: Vec<u16>,
}

impl ProviderPolicy {
    /// 各平台默认策略
    pub fn default_for(platform: PlatformType) -> Self {
        let (max_calls, extra) = match platform {
            PlatformType::Careem => (60, vec![]),
            PlatformType::Talabat => (30, vec![408]),
            PlatformType::Deliveroo => (100, vec![409]),
        };
        Self {
            rate_limit: RateLimitPolicy {
                max_calls,
                window_secs: 60,
            },
            circuit_breaker: CircuitBreakerPolicy {
                failure_threshold: 5,
                cooldown_secs: 60,
                half_open_trials: 1,
            },
            retry: RetrySettings {
                max_retries: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
                jitter_ratio: 0.2,
            },
            call_timeout_secs: 30,
            extra_retryable_statuses: extra,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker.cooldown_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.max_calls == 0 || self.rate_limit.window_secs == 0 {
            return Err(MenuSyncError::Config("rate limit must allow at least one call per non-empty window".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.half_open_trials == 0 {
            return Err(MenuSyncError::Config("circuit breaker thresholds must be positive".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(MenuSyncError::Config("retry base delay exceeds max delay".into()));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_ratio) {
            return Err(MenuSyncError::Config("jitter ratio must be in [0, 1)".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(MenuSyncError::Config("call timeout must be positive".into()));
        }
        Ok(())
    }
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 客户端层面的请求超时上限（秒），单次调用超时以平台策略为准
    pub request_timeout_secs: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
        }
    }
}

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuSyncConfig {
    /// 平台策略（缺省平台使用内置默认值）
    #[serde(default)]
    pub policies: BTreeMap<PlatformType, ProviderPolicy>,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// SQLite 数据库路径；None 表示使用内存存储
    pub database_path: Option<PathBuf>,
    pub http_client_config: HttpClientConfig,
    /// 平台异步受理后等待 webhook 回执的上限（秒），超时记为失败；
    /// 顺序批量据此等待每个成员结束
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    /// 预估耗时：基础值（毫秒）
    pub estimate_base_ms: u64,
    /// 预估耗时：每个商品（毫秒）
    pub estimate_per_item_ms: u64,
    /// 调试模式
    pub debug_mode: bool,
}

fn default_completion_timeout_secs() -> u64 {
    300
}

impl Default for MenuSyncConfig {
    fn default() -> Self {
        Self {
            policies: PlatformType::ALL
                .iter()
                .map(|p| (*p, ProviderPolicy::default_for(*p)))
                .collect(),
            event_buffer_size: 1000,
            database_path: None,
            http_client_config: HttpClientConfig::default(),
            completion_timeout_secs: default_completion_timeout_secs(),
            estimate_base_ms: 1_500,
            estimate_per_item_ms: 50,
            debug_mode: false,
        }
    }
}

impl MenuSyncConfig {
    pub fn builder() -> MenuSyncConfigBuilder {
        MenuSyncConfigBuilder::new()
    }

    /// 从 JSON 文件加载
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: MenuSyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 平台策略
    pub fn policy(&self, platform: PlatformType) -> ProviderPolicy {
        self.policies
            .get(&platform)
            .cloned()
            .unwrap_or_else(|| ProviderPolicy::default_for(platform))
    }

    pub fn validate(&self) -> Result<()> {
        for (platform, policy) in &self.policies {
            policy
                .validate()
                .map_err(|e| MenuSyncError::Config(format!("{}: {}", platform, e)))?;
        }
        if self.event_buffer_size == 0 {
            return Err(MenuSyncError::Config("event buffer size must be positive".into()));
        }
        if self.completion_timeout_secs == 0 {
            return Err(MenuSyncError::Config("completion timeout must be positive".into()));
        }
        Ok(())
    }

    /// 预估同步耗时
    pub fn estimate_duration(&self, item_count: usize) -> Duration {
        Duration::from_millis(self.estimate_base_ms + self.estimate_per_item_ms * item_count as u64)
    }
}

/// 配置构建器
pub struct MenuSyncConfigBuilder {
    config: MenuSyncConfig,
}

impl MenuSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MenuSyncConfig::default(),
        }
    }

    pub fn policy(mut self, platform: PlatformType, policy: ProviderPolicy) -> Self {
        self.config.policies.insert(platform, policy);
        self
    }

    pub fn database_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.database_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.config.completion_timeout_secs = timeout.as_secs();
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> Result<MenuSyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for MenuSyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
