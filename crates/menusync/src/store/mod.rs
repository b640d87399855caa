//! 同步操作存储
//!
//! [`SyncOperationStore`] 是编排器与 webhook 处理器共享的持久化端口，
//! 所有状态修改都通过 `update_status` 在存储内部原子地走同一个状态机。

pub mod memory;
pub mod migrate;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemorySyncStore;
pub use sqlite::SqliteSyncStore;

use crate::error::Result;
use crate::platform::PlatformType;
use crate::sync::batch::BatchSyncOperation;
use crate::sync::operation::{SyncOperation, SyncStatus, SyncTransition};

/// update_status 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// 迁移已应用，附带更新后的操作与迁移前的状态
    Applied {
        operation: SyncOperation,
        previous: SyncStatus,
    },
    /// 当前状态不接受此迁移（例如已是终态），附带未变化的操作
    Ignored(SyncOperation),
    NotFound,
}

impl TransitionOutcome {
    pub fn operation(&self) -> Option<&SyncOperation> {
        match self {
            TransitionOutcome::Applied { operation, .. } | TransitionOutcome::Ignored(operation) => {
                Some(operation)
            }
            TransitionOutcome::NotFound => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// 历史查询过滤条件
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFilter {
    pub menu_id: Option<String>,
    pub platform_type: Option<PlatformType>,
    pub status: Option<SyncStatus>,
    /// created_at >= from
    pub from: Option<DateTime<Utc>>,
    /// created_at < to
    pub to: Option<DateTime<Utc>>,
}

impl SyncFilter {
    pub fn matches(&self, op: &SyncOperation) -> bool {
        self.menu_id.as_ref().map_or(true, |m| *m == op.menu_id)
            && self.platform_type.map_or(true, |p| p == op.platform_type)
            && self.status.map_or(true, |s| s == op.status)
            && self.from.map_or(true, |from| op.created_at >= from)
            && self.to.map_or(true, |to| op.created_at < to)
    }
}

/// 分页参数（page 从 1 开始）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.limit as u64
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// 一页结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        (self.page as u64) * (self.limit as u64) < self.total
    }
}

/// 单个平台的统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformBreakdown {
    pub platform_type: PlatformType,
    pub total_syncs: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    /// 仅统计 completed 操作
    pub avg_duration_ms: f64,
}

impl PlatformBreakdown {
    pub fn new(
        platform_type: PlatformType,
        total_syncs: u64,
        success_count: u64,
        failure_count: u64,
        avg_duration_ms: f64,
    ) -> Self {
        Self {
            platform_type,
            total_syncs,
            success_count,
            failure_count,
            success_rate: ratio(success_count, total_syncs),
            avg_duration_ms,
        }
    }
}

/// 时间窗口内的同步统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAnalytics {
    pub since: DateTime<Utc>,
    pub total_syncs: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub per_platform_breakdown: Vec<PlatformBreakdown>,
}

impl SyncAnalytics {
    /// 由各平台统计汇总（平台按名称排序）
    pub fn from_breakdown(since: DateTime<Utc>, mut breakdown: Vec<PlatformBreakdown>) -> Self {
        breakdown.sort_by_key(|b| b.platform_type);
        let total_syncs = breakdown.iter().map(|b| b.total_syncs).sum();
        let success_count: u64 = breakdown.iter().map(|b| b.success_count).sum();
        let failure_count = breakdown.iter().map(|b| b.failure_count).sum();
        let weighted: f64 = breakdown
            .iter()
            .map(|b| b.avg_duration_ms * b.success_count as f64)
            .sum();
        let avg_duration_ms = if success_count == 0 {
            0.0
        } else {
            weighted / success_count as f64
        };
        Self {
            since,
            total_syncs,
            success_count,
            failure_count,
            success_rate: ratio(success_count, total_syncs),
            avg_duration_ms,
            per_platform_breakdown: breakdown,
        }
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// 同步操作存储端口
#[async_trait]
pub trait SyncOperationStore: Send + Sync {
    async fn create(&self, operation: &SyncOperation) -> Result<()>;

    /// 原子地读取 → 应用迁移 → 写回
    async fn update_status(&self, id: &str, transition: &SyncTransition) -> Result<TransitionOutcome>;

    async fn find_by_id(&self, id: &str) -> Result<Option<SyncOperation>>;

    /// 指定菜单 + 平台的操作（按创建时间倒序）
    async fn find_by_menu_and_platform(
        &self,
        menu_id: &str,
        platform: PlatformType,
        active_only: bool,
    ) -> Result<Vec<SyncOperation>>;

    /// 按条件分页查询（按创建时间倒序）
    async fn list(&self, filter: &SyncFilter, pagination: Pagination) -> Result<Page<SyncOperation>>;

    /// created_at >= since 的统计，按平台分组
    async fn aggregate(
        &self,
        since: DateTime<Utc>,
        platform: Option<PlatformType>,
    ) -> Result<SyncAnalytics>;

    async fn create_batch(&self, batch: &BatchSyncOperation) -> Result<()>;

    async fn find_batch(&self, id: &str) -> Result<Option<BatchSyncOperation>>;
}
