/// 同步操作模块
///
/// 职责：
/// - 同步操作模型与状态机（operation）
/// - 批量同步与聚合状态（batch）
/// - 唯一的状态迁移入口（applier）
/// - 编排：准入、驱动、重试、批量（orchestrator）

pub mod applier;
pub mod batch;
pub mod operation;
pub mod orchestrator;

pub use applier::TransitionApplier;
pub use batch::{BatchStatus, BatchStatusView, BatchSyncOperation, ExecutionMode};
pub use operation::{SyncOperation, SyncStatus, SyncTransition};
pub use orchestrator::{
    AnalyticsPeriod, BatchHandle, BatchMember, BatchRequest, HistoryQuery, SyncHandle,
    SyncOrchestrator, SyncRequest,
};
