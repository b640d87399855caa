//! 同步操作模型与状态机
//!
//! ```text
//! pending --Start--> in_progress --Complete--> completed
//!                        |  \--Fail--> failed
//!                        \--Retry--> pending (retry_count + 1)
//! pending | in_progress --Cancel--> cancelled
//! ```
//!
//! completed / failed / cancelled 为终态，任何后续迁移都被忽略；
//! 编排器与 webhook 处理器都经由 [`SyncOperation::apply`] 修改状态，先到的终态迁移生效。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MenuSyncError;
use crate::platform::PlatformType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = MenuSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "in_progress" => Ok(SyncStatus::InProgress),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "cancelled" => Ok(SyncStatus::Cancelled),
            other => Err(MenuSyncError::InvalidArgument(format!("未知同步状态: {}", other))),
        }
    }
}

/// 状态迁移
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTransition {
    /// 开始一次尝试
    Start,
    /// 平台已受理、异步处理中（记录平台引用）
    Accepted { external_reference: Option<String> },
    /// 进度更新（webhook processing）
    Progress { items_processed: Option<u32> },
    Complete {
        external_reference: Option<String>,
        items_processed: Option<u32>,
    },
    Fail { error: String },
    /// 可重试失败，回到 pending 等待退避
    Retry { error: String },
    Cancel,
}

impl SyncTransition {
    pub fn name(&self) -> &'static str {
        match self {
            SyncTransition::Start => "start",
            SyncTransition::Accepted { .. } => "accepted",
            SyncTransition::Progress { .. } => "progress",
            SyncTransition::Complete { .. } => "complete",
            SyncTransition::Fail { .. } => "fail",
            SyncTransition::Retry { .. } => "retry",
            SyncTransition::Cancel => "cancel",
        }
    }
}

/// 一次把某个菜单推送到某个平台的同步操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    pub menu_id: String,
    pub platform_type: PlatformType,
    pub status: SyncStatus,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub items_processed: u32,
    pub items_total: u32,
    /// 仅在 failed 时设置
    pub error_message: Option<String>,
    pub external_reference: Option<String>,
    pub batch_id: Option<String>,
    /// 由显式重试请求派生时指向原失败操作
    pub retry_of: Option<String>,
    pub payload_checksum: Option<String>,
    /// 最近一次可重试错误（重试期间可见）
    pub last_attempt_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncOperation {
    pub fn new(menu_id: &str, platform_type: PlatformType, items_total: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            menu_id: menu_id.to_string(),
            platform_type,
            status: SyncStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            items_processed: 0,
            items_total,
            error_message: None,
            external_reference: None,
            batch_id: None,
            retry_of: None,
            payload_checksum: None,
            last_attempt_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_batch(mut self, batch_id: &str) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self
    }

    pub fn with_retry_of(mut self, sync_id: &str) -> Self {
        self.retry_of = Some(sync_id.to_string());
        self
    }

    pub fn with_checksum(mut self, checksum: &str) -> Self {
        self.payload_checksum = Some(checksum.to_string());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 应用迁移；返回 false 表示迁移在当前状态下不合法而被忽略
    pub fn apply(&mut self, transition: &SyncTransition, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }

        match (self.status, transition) {
            (SyncStatus::Pending, SyncTransition::Start) => {
                self.status = SyncStatus::InProgress;
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            (SyncStatus::InProgress, SyncTransition::Accepted { external_reference }) => {
                if external_reference.is_some() {
                    self.external_reference = external_reference.clone();
                }
            }
            // 进度只更新计数；pending -> in_progress 只能由 Start 触发
            (_, SyncTransition::Progress { items_processed }) => {
                if let Some(n) = items_processed {
                    self.items_processed = *n;
                }
            }
            (_, SyncTransition::Complete { external_reference, items_processed }) => {
                self.status = SyncStatus::Completed;
                if external_reference.is_some() {
                    self.external_reference = external_reference.clone();
                }
                self.items_processed = items_processed.unwrap_or(self.items_total);
                self.finish(now);
            }
            (_, SyncTransition::Fail { error }) => {
                self.status = SyncStatus::Failed;
                self.error_message = Some(error.clone());
                self.finish(now);
            }
            (SyncStatus::InProgress, SyncTransition::Retry { error }) => {
                self.status = SyncStatus::Pending;
                self.retry_count += 1;
                self.last_attempt_error = Some(error.clone());
            }
            (_, SyncTransition::Cancel) => {
                self.status = SyncStatus::Cancelled;
                self.finish(now);
            }
            _ => return false,
        }

        self.updated_at = now;
        true
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        let start = self.started_at.unwrap_or(self.created_at);
        let elapsed = (now - start).num_milliseconds().max(0) as u64;
        // 终态操作的耗时至少记为 1ms
        self.duration_ms = Some(elapsed.max(1));
    }
}
