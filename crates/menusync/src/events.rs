//! 同步进度事件
//!
//! [`ProgressNotifier`] 是进度推送的出口端口（实时传输层由外部实现）；
//! 内置的 [`EventManager`] 基于 tokio broadcast，支持过滤订阅，并按平台统计事件。

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::platform::PlatformType;
use crate::resilience::BreakerState;
use crate::sync::batch::BatchStatus;
use crate::sync::operation::SyncStatus;

/// 状态变化的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Orchestrator,
    Webhook,
    Operator,
}

/// 同步事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// 单个同步操作状态或进度变化
    SyncStatusChanged {
        sync_id: String,
        menu_id: String,
        platform_type: PlatformType,
        batch_id: Option<String>,
        old_status: SyncStatus,
        new_status: SyncStatus,
        retry_count: u32,
        items_processed: u32,
        items_total: u32,
        message: Option<String>,
        source: EventSource,
        timestamp: i64,
    },
    /// 批量所有成员进入终态
    BatchFinished {
        batch_id: String,
        menu_id: String,
        aggregate: BatchStatus,
        timestamp: i64,
    },
    /// 平台熔断状态变化
    CircuitStateChanged {
        platform_type: PlatformType,
        old_state: BreakerState,
        new_state: BreakerState,
        timestamp: i64,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::SyncStatusChanged { .. } => "sync_status_changed",
            SyncEvent::BatchFinished { .. } => "batch_finished",
            SyncEvent::CircuitStateChanged { .. } => "circuit_state_changed",
        }
    }

    pub fn sync_id(&self) -> Option<&str> {
        match self {
            SyncEvent::SyncStatusChanged { sync_id, .. } => Some(sync_id),
            _ => None,
        }
    }

    pub fn batch_id(&self) -> Option<&str> {
        match self {
            SyncEvent::SyncStatusChanged { batch_id, .. } => batch_id.as_deref(),
            SyncEvent::BatchFinished { batch_id, .. } => Some(batch_id),
            SyncEvent::CircuitStateChanged { .. } => None,
        }
    }

    pub fn platform_type(&self) -> Option<PlatformType> {
        match self {
            SyncEvent::SyncStatusChanged { platform_type, .. }
            | SyncEvent::CircuitStateChanged { platform_type, .. } => Some(*platform_type),
            SyncEvent::BatchFinished { .. } => None,
        }
    }

    /// 毫秒时间戳
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::SyncStatusChanged { timestamp, .. }
            | SyncEvent::BatchFinished { timestamp, .. }
            | SyncEvent::CircuitStateChanged { timestamp, .. } => *timestamp,
        }
    }
}

/// 进度通知端口
#[async_trait]
pub trait ProgressNotifier: Send + Sync {
    async fn notify(&self, event: SyncEvent);
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub sync_ids: Option<Vec<String>>,
    pub batch_ids: Option<Vec<String>>,
    pub platforms: Option<Vec<PlatformType>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_sync_ids(mut self, sync_ids: Vec<String>) -> Self {
        self.sync_ids = Some(sync_ids);
        self
    }

    pub fn with_batch_ids(mut self, batch_ids: Vec<String>) -> Self {
        self.batch_ids = Some(batch_ids);
        self
    }

    pub fn with_platforms(mut self, platforms: Vec<PlatformType>) -> Self {
        self.platforms = Some(platforms);
        self
    }

    /// 事件缺少过滤器要求的字段时视为不匹配
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let Some(ids) = &self.sync_ids {
            match event.sync_id() {
                Some(id) if ids.iter().any(|s| s == id) => {}
                _ => return false,
            }
        }
        if let Some(ids) = &self.batch_ids {
            match event.batch_id() {
                Some(id) if ids.iter().any(|s| s == id) => {}
                _ => return false,
            }
        }
        if let Some(platforms) = &self.platforms {
            match event.platform_type() {
                Some(p) if platforms.contains(&p) => {}
                _ => return false,
            }
        }
        true
    }
}

/// 单个平台的同步事件计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformEventCounts {
    pub status_changes: u64,
    /// in_progress -> pending，即一次自动重试
    pub retries: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub circuit_opened: u64,
}

/// 事件统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub total_events: u64,
    pub batches_finished: u64,
    pub by_platform: BTreeMap<PlatformType, PlatformEventCounts>,
    pub last_event_time: Option<i64>,
}

impl EventStats {
    fn record(&mut self, event: &SyncEvent) {
        self.total_events += 1;
        self.last_event_time = Some(event.timestamp());
        match event {
            SyncEvent::SyncStatusChanged {
                platform_type,
                old_status,
                new_status,
                ..
            } => {
                let counts = self.by_platform.entry(*platform_type).or_default();
                counts.status_changes += 1;
                match (old_status, new_status) {
                    (SyncStatus::InProgress, SyncStatus::Pending) => counts.retries += 1,
                    (_, SyncStatus::Completed) => counts.completed += 1,
                    (_, SyncStatus::Failed) => counts.failed += 1,
                    (_, SyncStatus::Cancelled) => counts.cancelled += 1,
                    _ => {}
                }
            }
            SyncEvent::CircuitStateChanged {
                platform_type,
                new_state,
                ..
            } => {
                if *new_state == BreakerState::Open {
                    self.by_platform.entry(*platform_type).or_default().circuit_opened += 1;
                }
            }
            SyncEvent::BatchFinished { .. } => self.batches_finished += 1,
        }
    }
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    stats: Mutex<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: Mutex::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());
        self.stats.lock().record(&event);

        // 无订阅者时 send 失败属正常情况
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 按平台汇总的事件计数
    pub fn stats(&self) -> EventStats {
        self.stats.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl ProgressNotifier for EventManager {
    async fn notify(&self, event: SyncEvent) {
        self.emit(event);
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器
pub mod event_builders {
    use super::*;
    use crate::sync::batch::BatchStatusView;
    use crate::sync::operation::SyncOperation;

    pub fn sync_status_changed(
        operation: &SyncOperation,
        old_status: SyncStatus,
        source: EventSource,
        message: Option<String>,
    ) -> SyncEvent {
        SyncEvent::SyncStatusChanged {
            sync_id: operation.id.clone(),
            menu_id: operation.menu_id.clone(),
            platform_type: operation.platform_type,
            batch_id: operation.batch_id.clone(),
            old_status,
            new_status: operation.status,
            retry_count: operation.retry_count,
            items_processed: operation.items_processed,
            items_total: operation.items_total,
            message: message.or_else(|| operation.error_message.clone()),
            source,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn batch_finished(view: &BatchStatusView) -> SyncEvent {
        SyncEvent::BatchFinished {
            batch_id: view.batch.id.clone(),
            menu_id: view.batch.menu_id.clone(),
            aggregate: view.aggregate,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn circuit_state_changed(
        platform_type: PlatformType,
        old_state: BreakerState,
        new_state: BreakerState,
    ) -> SyncEvent {
        SyncEvent::CircuitStateChanged {
            platform_type,
            old_state,
            new_state,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::operation::{SyncOperation, SyncTransition};

    fn status_event(platform: PlatformType) -> SyncEvent {
        let op = SyncOperation::new("menu-1", platform, 2);
        event_builders::sync_status_changed(&op, SyncStatus::Pending, EventSource::Orchestrator, None)
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let manager = EventManager::new(16);
        let mut talabat_only =
            manager.subscribe_filtered(EventFilter::new().with_platforms(vec![PlatformType::Talabat]));

        manager.emit(status_event(PlatformType::Careem));
        manager.emit(status_event(PlatformType::Talabat));

        let event = talabat_only.recv().await.unwrap();
        assert_eq!(event.platform_type(), Some(PlatformType::Talabat));
        assert!(talabat_only.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats_count_per_platform() {
        let manager = EventManager::new(16);
        let mut op = SyncOperation::new("menu-1", PlatformType::Deliveroo, 2);
        let now = Utc::now();

        op.apply(&SyncTransition::Start, now);
        manager
            .notify(event_builders::sync_status_changed(&op, SyncStatus::Pending, EventSource::Orchestrator, None))
            .await;
        op.apply(&SyncTransition::Retry { error: "HTTP 503".into() }, now);
        manager
            .notify(event_builders::sync_status_changed(&op, SyncStatus::InProgress, EventSource::Orchestrator, None))
            .await;
        op.apply(&SyncTransition::Fail { error: "HTTP 400".into() }, now);
        manager
            .notify(event_builders::sync_status_changed(&op, SyncStatus::Pending, EventSource::Orchestrator, None))
            .await;
        manager
            .notify(event_builders::circuit_state_changed(
                PlatformType::Deliveroo,
                BreakerState::Closed,
                BreakerState::Open,
            ))
            .await;
        manager.emit(status_event(PlatformType::Careem));

        let stats = manager.stats();
        assert_eq!(stats.total_events, 5);
        assert_eq!(stats.batches_finished, 0);
        let deliveroo = &stats.by_platform[&PlatformType::Deliveroo];
        assert_eq!(deliveroo.status_changes, 3);
        assert_eq!(deliveroo.retries, 1);
        assert_eq!(deliveroo.failed, 1);
        assert_eq!(deliveroo.completed, 0);
        assert_eq!(deliveroo.circuit_opened, 1);
        assert_eq!(stats.by_platform[&PlatformType::Careem].status_changes, 1);
        assert!(!stats.by_platform.contains_key(&PlatformType::Talabat));
        assert!(stats.last_event_time.is_some());
    }

    #[test]
    fn test_filter_requires_field() {
        let filter = EventFilter::new().with_sync_ids(vec!["abc".to_string()]);
        let event = event_builders::circuit_state_changed(
            PlatformType::Careem,
            BreakerState::Open,
            BreakerState::HalfOpen,
        );
        assert!(!filter.matches(&event));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(status_event(PlatformType::Careem)).unwrap();
        assert_eq!(json["type"], "sync_status_changed");
        assert_eq!(json["platform_type"], "careem");
        assert_eq!(json["new_status"], "pending");
    }
}
