//! 状态迁移应用器
//!
//! 编排器和 webhook 处理器修改同步操作的唯一入口：
//! - 通过存储的 `update_status` 原子地走状态机（先到的终态迁移生效）
//! - 迁移成功后推送进度事件
//! - 为等待终态的调用方（顺序批量）维护 watch 通道

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::error::Result;
use crate::events::{event_builders, EventSource, ProgressNotifier};
use crate::store::{SyncOperationStore, TransitionOutcome};
use crate::sync::operation::{SyncOperation, SyncStatus, SyncTransition};

pub struct TransitionApplier {
    store: Arc<dyn SyncOperationStore>,
    notifier: Arc<dyn ProgressNotifier>,
    watchers: Mutex<HashMap<String, watch::Sender<SyncStatus>>>,
}

impl TransitionApplier {
    pub fn new(store: Arc<dyn SyncOperationStore>, notifier: Arc<dyn ProgressNotifier>) -> Self {
        Self {
            store,
            notifier,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SyncOperationStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn ProgressNotifier> {
        &self.notifier
    }

    /// 应用迁移；被忽略或找不到时不推送事件
    pub async fn apply(
        &self,
        sync_id: &str,
        transition: SyncTransition,
        source: EventSource,
        message: Option<String>,
    ) -> Result<TransitionOutcome> {
        let outcome = self.store.update_status(sync_id, &transition).await?;

        match &outcome {
            TransitionOutcome::Applied { operation, previous } => {
                self.publish(operation);
                self.notifier
                    .notify(event_builders::sync_status_changed(
                        operation, *previous, source, message,
                    ))
                    .await;
            }
            TransitionOutcome::Ignored(operation) => {
                debug!(
                    "迁移被忽略 / transition ignored: sync_id={}, transition={}, status={}",
                    sync_id,
                    transition.name(),
                    operation.status
                );
            }
            TransitionOutcome::NotFound => {}
        }
        Ok(outcome)
    }

    fn publish(&self, operation: &SyncOperation) {
        let mut watchers = self.watchers.lock();
        if let Some(tx) = watchers.get(&operation.id) {
            tx.send_replace(operation.status);
        }
        if operation.is_terminal() {
            watchers.remove(&operation.id);
        }
    }

    /// 等待操作进入终态；超时返回当前快照，id 不存在返回 None
    pub async fn wait_terminal(&self, sync_id: &str, timeout: Duration) -> Result<Option<SyncOperation>> {
        // 先订阅再读存储，避免错过两者之间发生的终态迁移
        let mut rx = {
            let mut watchers = self.watchers.lock();
            watchers
                .entry(sync_id.to_string())
                .or_insert_with(|| watch::channel(SyncStatus::Pending).0)
                .subscribe()
        };

        let Some(current) = self.store.find_by_id(sync_id).await? else {
            self.watchers.lock().remove(sync_id);
            return Ok(None);
        };
        if current.is_terminal() {
            return Ok(Some(current));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {
                    if rx.borrow_and_update().is_terminal() {
                        break;
                    }
                }
                // 发送端在终态时被移除
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }
        self.store.find_by_id(sync_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventManager, SyncEvent};
    use crate::platform::PlatformType;
    use crate::store::MemorySyncStore;

    fn applier() -> (Arc<TransitionApplier>, Arc<EventManager>) {
        let events = Arc::new(EventManager::new(32));
        let applier = Arc::new(TransitionApplier::new(
            Arc::new(MemorySyncStore::new()),
            events.clone(),
        ));
        (applier, events)
    }

    #[tokio::test]
    async fn test_applied_transition_emits_event() {
        let (applier, events) = applier();
        let mut rx = events.subscribe();
        let op = SyncOperation::new("menu-1", PlatformType::Careem, 1);
        applier.store().create(&op).await.unwrap();

        applier
            .apply(&op.id, SyncTransition::Start, EventSource::Orchestrator, None)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            SyncEvent::SyncStatusChanged { old_status, new_status, .. } => {
                assert_eq!(old_status, SyncStatus::Pending);
                assert_eq!(new_status, SyncStatus::InProgress);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // 非法迁移不推送事件
        let out = applier
            .apply(&op.id, SyncTransition::Start, EventSource::Orchestrator, None)
            .await
            .unwrap();
        assert!(matches!(out, TransitionOutcome::Ignored(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_terminal_wakes_on_completion() {
        let (applier, _) = applier();
        let op = SyncOperation::new("menu-1", PlatformType::Talabat, 1);
        applier.store().create(&op).await.unwrap();

        let waiter = {
            let applier = applier.clone();
            let id = op.id.clone();
            tokio::spawn(async move { applier.wait_terminal(&id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        applier
            .apply(&op.id, SyncTransition::Start, EventSource::Orchestrator, None)
            .await
            .unwrap();
        applier
            .apply(
                &op.id,
                SyncTransition::Complete { external_reference: None, items_processed: None },
                EventSource::Webhook,
                None,
            )
            .await
            .unwrap();

        let done = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(done.status, SyncStatus::Completed);
        assert!(applier.watchers.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_terminal_times_out_with_snapshot() {
        let (applier, _) = applier();
        let op = SyncOperation::new("menu-1", PlatformType::Talabat, 1);
        applier.store().create(&op).await.unwrap();
        let snapshot = applier
            .wait_terminal(&op.id, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, SyncStatus::Pending);
        assert!(applier.wait_terminal("missing", Duration::from_secs(1)).await.unwrap().is_none());
    }
}
