//! 批量同步

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::operation::{SyncOperation, SyncStatus};

/// 批量执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequence,
}

/// 批量聚合状态（由成员状态推导，不会把混合结果算作成功）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
    PartiallyCompleted,
}

impl BatchStatus {
    pub fn from_members<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a SyncStatus>,
    {
        let statuses: Vec<&SyncStatus> = statuses.into_iter().collect();
        if statuses.is_empty() {
            return BatchStatus::Completed;
        }
        if statuses.iter().any(|s| !s.is_terminal()) {
            return BatchStatus::InProgress;
        }
        let all = |wanted: SyncStatus| statuses.iter().all(|s| **s == wanted);
        if all(SyncStatus::Completed) {
            BatchStatus::Completed
        } else if all(SyncStatus::Failed) {
            BatchStatus::Failed
        } else if all(SyncStatus::Cancelled) {
            BatchStatus::Cancelled
        } else {
            BatchStatus::PartiallyCompleted
        }
    }
}

/// 一次批量请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSyncOperation {
    pub id: String,
    pub menu_id: String,
    pub mode: ExecutionMode,
    pub fail_fast: bool,
    /// 成员 sync_id（按执行顺序）
    pub member_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl BatchSyncOperation {
    pub fn new(menu_id: &str, mode: ExecutionMode, fail_fast: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            menu_id: menu_id.to_string(),
            mode,
            fail_fast,
            member_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// 批量状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatusView {
    pub batch: BatchSyncOperation,
    pub members: Vec<SyncOperation>,
    pub aggregate: BatchStatus,
}

impl BatchStatusView {
    pub fn new(batch: BatchSyncOperation, members: Vec<SyncOperation>) -> Self {
        let aggregate = BatchStatus::from_members(members.iter().map(|m| &m.status));
        Self {
            batch,
            members,
            aggregate,
        }
    }
}
