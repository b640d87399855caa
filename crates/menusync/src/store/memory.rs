//! 内存存储（嵌入式部署与测试）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::{
    Page, Pagination, PlatformBreakdown, SyncAnalytics, SyncFilter, SyncOperationStore,
    TransitionOutcome,
};
use crate::error::Result;
use crate::platform::PlatformType;
use crate::sync::batch::BatchSyncOperation;
use crate::sync::operation::{SyncOperation, SyncStatus, SyncTransition};

#[derive(Debug, Default)]
pub struct MemorySyncStore {
    operations: RwLock<HashMap<String, SyncOperation>>,
    batches: RwLock<HashMap<String, BatchSyncOperation>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn newest_first(mut ops: Vec<SyncOperation>) -> Vec<SyncOperation> {
        ops.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        ops
    }
}

#[async_trait]
impl SyncOperationStore for MemorySyncStore {
    async fn create(&self, operation: &SyncOperation) -> Result<()> {
        self.operations
            .write()
            .insert(operation.id.clone(), operation.clone());
        Ok(())
    }

    async fn update_status(&self, id: &str, transition: &SyncTransition) -> Result<TransitionOutcome> {
        let mut operations = self.operations.write();
        let Some(op) = operations.get_mut(id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        let previous = op.status;
        if op.apply(transition, Utc::now()) {
            Ok(TransitionOutcome::Applied {
                operation: op.clone(),
                previous,
            })
        } else {
            Ok(TransitionOutcome::Ignored(op.clone()))
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SyncOperation>> {
        Ok(self.operations.read().get(id).cloned())
    }

    async fn find_by_menu_and_platform(
        &self,
        menu_id: &str,
        platform: PlatformType,
        active_only: bool,
    ) -> Result<Vec<SyncOperation>> {
        let ops = self
            .operations
            .read()
            .values()
            .filter(|op| op.menu_id == menu_id && op.platform_type == platform)
            .filter(|op| !active_only || !op.is_terminal())
            .cloned()
            .collect();
        Ok(Self::newest_first(ops))
    }

    async fn list(&self, filter: &SyncFilter, pagination: Pagination) -> Result<Page<SyncOperation>> {
        let matching: Vec<SyncOperation> = self
            .operations
            .read()
            .values()
            .filter(|op| filter.matches(op))
            .cloned()
            .collect();
        let total = matching.len() as u64;
        let items = Self::newest_first(matching)
            .into_iter()
            .skip(pagination.offset() as usize)
            .take(pagination.limit as usize)
            .collect();
        Ok(Page {
            items,
            page: pagination.page,
            limit: pagination.limit,
            total,
        })
    }

    async fn aggregate(
        &self,
        since: DateTime<Utc>,
        platform: Option<PlatformType>,
    ) -> Result<SyncAnalytics> {
        // platform -> (total, success, failure, duration_sum, duration_samples)
        let mut groups: BTreeMap<PlatformType, (u64, u64, u64, u64, u64)> = BTreeMap::new();
        for op in self.operations.read().values() {
            if op.created_at < since || platform.map_or(false, |p| p != op.platform_type) {
                continue;
            }
            let entry = groups.entry(op.platform_type).or_default();
            entry.0 += 1;
            match op.status {
                SyncStatus::Completed => {
                    entry.1 += 1;
                    if let Some(ms) = op.duration_ms {
                        entry.3 += ms;
                        entry.4 += 1;
                    }
                }
                SyncStatus::Failed => entry.2 += 1,
                _ => {}
            }
        }

        let breakdown = groups
            .into_iter()
            .map(|(p, (total, success, failure, sum, samples))| {
                let avg = if samples == 0 { 0.0 } else { sum as f64 / samples as f64 };
                PlatformBreakdown::new(p, total, success, failure, avg)
            })
            .collect();
        Ok(SyncAnalytics::from_breakdown(since, breakdown))
    }

    async fn create_batch(&self, batch: &BatchSyncOperation) -> Result<()> {
        self.batches.write().insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn find_batch(&self, id: &str) -> Result<Option<BatchSyncOperation>> {
        Ok(self.batches.read().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[tokio::test]
    async fn test_transitions() {
        conformance::transitions_are_atomic_and_terminal_is_final(&MemorySyncStore::new()).await;
    }

    #[tokio::test]
    async fn test_listing() {
        conformance::pair_lookup_and_listing(&MemorySyncStore::new()).await;
    }

    #[tokio::test]
    async fn test_aggregate() {
        conformance::aggregate_by_platform(&MemorySyncStore::new()).await;
    }

    #[tokio::test]
    async fn test_batches() {
        conformance::batches_round_trip(&MemorySyncStore::new()).await;
    }
}
