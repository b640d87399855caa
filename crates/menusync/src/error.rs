use std::fmt;
use std::time::Duration;

use crate::adapter::ValidationError;
use crate::platform::PlatformType;

#[derive(Debug)]
pub enum MenuSyncError {
    /// 菜单未通过平台转换规则（不重试，不发出任何网络请求）
    Validation(ValidationError),
    /// 本地限流拒绝
    RateLimitExceeded {
        platform: PlatformType,
        retry_after: Duration,
    },
    /// 本地熔断拒绝
    CircuitOpen {
        platform: PlatformType,
        retry_after: Duration,
    },
    /// 平台临时错误（超时、5xx、429）
    TransientProvider {
        platform: PlatformType,
        attempt: u32,
        will_retry: bool,
        message: String,
    },
    /// 平台永久错误（429 以外的 4xx）
    PermanentProvider {
        platform: PlatformType,
        attempt: u32,
        status: Option<u16>,
        message: String,
    },
    /// Webhook 引用了不存在的同步操作
    UnknownSyncReference(String),
    /// 取消/查询的 id 不存在或已处于终态
    NotFoundOrAlreadyTerminal(String),
    NotFound(String),
    /// 同一菜单 + 平台已有进行中的同步
    Conflict(String),
    /// 载荷与上次成功同步完全一致（未使用 force_sync）
    Unchanged(String),
    InvalidArgument(String),
    Config(String),
    Database(String),
    Migration(String),
    Serialization(String),
    IO(String),
    Transport(String),
    ShuttingDown(String),
}

impl fmt::Display for MenuSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MenuSyncError::Validation(e) => write!(f, "Validation error: {}", e),
            MenuSyncError::RateLimitExceeded { platform, retry_after } => write!(
                f,
                "Rate limit exceeded for {}, retry after {}ms",
                platform,
                retry_after.as_millis()
            ),
            MenuSyncError::CircuitOpen { platform, retry_after } => write!(
                f,
                "Circuit open for {}, retry after {}ms",
                platform,
                retry_after.as_millis()
            ),
            MenuSyncError::TransientProvider { platform, attempt, will_retry, message } => write!(
                f,
                "[{}] attempt {} failed (transient): {}; {}",
                platform,
                attempt,
                message,
                if *will_retry { "will retry automatically" } else { "no further automatic retry" }
            ),
            MenuSyncError::PermanentProvider { platform, attempt, status, message } => match status {
                Some(code) => write!(
                    f,
                    "[{}] attempt {} rejected with HTTP {}: {}; no further automatic retry",
                    platform, attempt, code, message
                ),
                None => write!(
                    f,
                    "[{}] attempt {} rejected: {}; no further automatic retry",
                    platform, attempt, message
                ),
            },
            MenuSyncError::UnknownSyncReference(id) => write!(f, "Unknown sync reference: {}", id),
            MenuSyncError::NotFoundOrAlreadyTerminal(id) => {
                write!(f, "Sync operation not found or already terminal: {}", id)
            }
            MenuSyncError::NotFound(e) => write!(f, "Not found: {}", e),
            MenuSyncError::Conflict(e) => write!(f, "Conflict: {}", e),
            MenuSyncError::Unchanged(e) => write!(f, "Unchanged: {}", e),
            MenuSyncError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            MenuSyncError::Config(e) => write!(f, "Config error: {}", e),
            MenuSyncError::Database(e) => write!(f, "Database error: {}", e),
            MenuSyncError::Migration(e) => write!(f, "Migration error: {}", e),
            MenuSyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MenuSyncError::IO(e) => write!(f, "IO error: {}", e),
            MenuSyncError::Transport(e) => write!(f, "Transport error: {}", e),
            MenuSyncError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
        }
    }
}

impl std::error::Error for MenuSyncError {}

impl From<ValidationError> for MenuSyncError {
    fn from(error: ValidationError) -> Self {
        MenuSyncError::Validation(error)
    }
}

impl From<rusqlite::Error> for MenuSyncError {
    fn from(error: rusqlite::Error) -> Self {
        MenuSyncError::Database(error.to_string())
    }
}

impl From<refinery::Error> for MenuSyncError {
    fn from(error: refinery::Error) -> Self {
        MenuSyncError::Migration(error.to_string())
    }
}

impl From<serde_json::Error> for MenuSyncError {
    fn from(error: serde_json::Error) -> Self {
        MenuSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for MenuSyncError {
    fn from(error: std::io::Error) -> Self {
        MenuSyncError::IO(error.to_string())
    }
}

impl MenuSyncError {
    /// 对外 API 层使用的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            MenuSyncError::Validation(_) => "VALIDATION_ERROR",
            MenuSyncError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            MenuSyncError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            MenuSyncError::TransientProvider { .. } => "TRANSIENT_PROVIDER_ERROR",
            MenuSyncError::PermanentProvider { .. } => "PERMANENT_PROVIDER_ERROR",
            MenuSyncError::UnknownSyncReference(_) => "UNKNOWN_SYNC_REFERENCE",
            MenuSyncError::NotFoundOrAlreadyTerminal(_) => "NOT_FOUND_OR_ALREADY_TERMINAL",
            MenuSyncError::NotFound(_) => "NOT_FOUND",
            MenuSyncError::Conflict(_) => "CONFLICT",
            MenuSyncError::Unchanged(_) => "UNCHANGED",
            MenuSyncError::InvalidArgument(_) => "INVALID_ARGUMENT",
            MenuSyncError::Config(_) => "CONFIG_ERROR",
            MenuSyncError::Database(_) | MenuSyncError::Migration(_) => "STORAGE_ERROR",
            MenuSyncError::Serialization(_) => "SERIALIZATION_ERROR",
            MenuSyncError::IO(_) => "IO_ERROR",
            MenuSyncError::Transport(_) => "TRANSPORT_ERROR",
            MenuSyncError::ShuttingDown(_) => "SHUTTING_DOWN",
        }
    }

    /// 是否属于可自动恢复（重新调度）的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MenuSyncError::RateLimitExceeded { .. }
                | MenuSyncError::CircuitOpen { .. }
                | MenuSyncError::TransientProvider { will_retry: true, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MenuSyncError>;
