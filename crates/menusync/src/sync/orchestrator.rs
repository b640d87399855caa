//! 同步编排器
//!
//! 负责同步操作的整个生命周期：
//! 1. 准入：菜单存在、配置匹配、转换校验、同一菜单 + 平台互斥、未变化跳过
//! 2. 驱动：每个操作一个 tokio 任务，走 熔断/限流 → 出站调用 → 记录结果 → 退避重试
//! 3. 批量：并行 join，或顺序流水线（可 fail_fast）
//! 4. 查询：状态、批量状态、历史、统计
//!
//! 所有状态修改都经由 [`TransitionApplier`]，与 webhook 处理器共用同一个状态机。

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::{
    AdapterRegistry, ProviderAdapter, ProviderConfig, ProviderEndpoint, ProviderMenuPayload,
    ValidationError,
};
use crate::config::MenuSyncConfig;
use crate::error::{MenuSyncError, Result};
use crate::events::{event_builders, EventSource};
use crate::menu::MenuSource;
use crate::platform::PlatformType;
use crate::resilience::{BreakerState, FailureReason, ResilienceController};
use crate::store::{Page, Pagination, SyncAnalytics, SyncFilter, TransitionOutcome};
use crate::sync::applier::TransitionApplier;
use crate::sync::batch::{BatchStatus, BatchStatusView, BatchSyncOperation, ExecutionMode};
use crate::sync::operation::{SyncOperation, SyncStatus, SyncTransition};
use crate::transport::{ProviderCallError, ProviderRequest, ProviderTransport};

/// initiate-sync 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub menu_id: String,
    pub platform_type: PlatformType,
    pub config: ProviderConfig,
    /// 载荷与上次成功同步一致时仍然推送
    #[serde(default)]
    pub force_sync: bool,
    /// 只同步这些商品
    #[serde(default)]
    pub item_ids: Option<Vec<String>>,
}

impl SyncRequest {
    pub fn new(menu_id: &str, platform_type: PlatformType, config: ProviderConfig) -> Self {
        Self {
            menu_id: menu_id.to_string(),
            platform_type,
            config,
            force_sync: false,
            item_ids: None,
        }
    }

    pub fn force(mut self) -> Self {
        self.force_sync = true;
        self
    }

    pub fn with_items(mut self, item_ids: Vec<String>) -> Self {
        self.item_ids = Some(item_ids);
        self
    }
}

/// initiate-sync 响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHandle {
    pub sync_id: String,
    /// 固定为 "initiated"
    pub status: String,
    #[serde(rename = "estimated_duration")]
    pub estimated_duration_ms: u64,
}

/// 批量中的一个平台
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMember {
    pub platform_type: PlatformType,
    pub config: ProviderConfig,
    /// 越小越先执行
    #[serde(default)]
    pub priority: i32,
}

impl BatchMember {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            platform_type: config.platform(),
            config,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// batch-sync 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub menu_id: String,
    pub platforms: Vec<BatchMember>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub fail_fast: bool,
}

/// batch-sync 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchHandle {
    pub batch_id: String,
    /// 按执行顺序排列的成员（创建时均为 pending）
    pub sync_operations: Vec<SyncOperation>,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

/// sync-history 查询
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub menu_id: Option<String>,
    #[serde(default)]
    pub platform_type: Option<PlatformType>,
    #[serde(default)]
    pub status: Option<SyncStatus>,
    #[serde(default)]
    pub from: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<chrono::DateTime<Utc>>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            menu_id: None,
            platform_type: None,
            status: None,
            from: None,
            to: None,
            page: default_page(),
            limit: default_limit(),
        }
    }
}

/// sync-analytics 统计窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AnalyticsPeriod {
    #[serde(rename = "1h")]
    LastHour,
    #[default]
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
}

impl AnalyticsPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsPeriod::LastHour => "1h",
            AnalyticsPeriod::LastDay => "24h",
            AnalyticsPeriod::LastWeek => "7d",
            AnalyticsPeriod::LastMonth => "30d",
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        match self {
            AnalyticsPeriod::LastHour => chrono::Duration::hours(1),
            AnalyticsPeriod::LastDay => chrono::Duration::hours(24),
            AnalyticsPeriod::LastWeek => chrono::Duration::days(7),
            AnalyticsPeriod::LastMonth => chrono::Duration::days(30),
        }
    }
}

impl FromStr for AnalyticsPeriod {
    type Err = MenuSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1h" => Ok(AnalyticsPeriod::LastHour),
            "24h" => Ok(AnalyticsPeriod::LastDay),
            "7d" => Ok(AnalyticsPeriod::LastWeek),
            "30d" => Ok(AnalyticsPeriod::LastMonth),
            other => Err(MenuSyncError::InvalidArgument(format!(
                "unknown analytics period: {} (expected 1h, 24h, 7d or 30d)",
                other
            ))),
        }
    }
}

/// 已通过校验、尚未绑定操作的推送
#[derive(Clone)]
struct PreparedPush {
    platform: PlatformType,
    adapter: Arc<dyn ProviderAdapter>,
    endpoint: ProviderEndpoint,
    payload: ProviderMenuPayload,
}

/// 绑定到某个同步操作的推送任务
#[derive(Clone)]
struct PushJob {
    sync_id: String,
    push: PreparedPush,
}

/// 一次尝试的可重试失败
struct AttemptFailure {
    message: String,
    /// 平台或本地准入给出的最短等待
    min_delay: Duration,
}

enum AttemptOutcome {
    /// 已进入终态（成功、永久失败或被抢先结束）
    Settled,
    /// 平台异步受理，等待 webhook
    Accepted,
    Retryable(AttemptFailure),
}

type PairLocks = Mutex<HashMap<(String, PlatformType), Arc<AsyncMutex<()>>>>;

/// 菜单 + 平台准入锁；释放时若无其他持有者则移除表项
struct PairGuard<'a> {
    locks: &'a PairLocks,
    key: (String, PlatformType),
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PairGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        drop(self.guard.take());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

pub struct SyncOrchestrator {
    config: MenuSyncConfig,
    menus: Arc<dyn MenuSource>,
    adapters: Arc<AdapterRegistry>,
    resilience: Arc<ResilienceController>,
    transport: Arc<dyn ProviderTransport>,
    applier: Arc<TransitionApplier>,
    /// 同一菜单 + 平台的准入串行化
    pair_locks: PairLocks,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(
        config: MenuSyncConfig,
        menus: Arc<dyn MenuSource>,
        adapters: Arc<AdapterRegistry>,
        resilience: Arc<ResilienceController>,
        transport: Arc<dyn ProviderTransport>,
        applier: Arc<TransitionApplier>,
    ) -> Self {
        Self {
            config,
            menus,
            adapters,
            resilience,
            transport,
            applier,
            pair_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    // ========== 准入 ==========

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(MenuSyncError::ShuttingDown(
                "orchestrator no longer accepts new syncs".to_string(),
            ));
        }
        Ok(())
    }

    async fn lock_pair(&self, menu_id: &str, platform: PlatformType) -> PairGuard<'_> {
        let key = (menu_id.to_string(), platform);
        let lock = self.pair_locks.lock().entry(key.clone()).or_default().clone();
        PairGuard {
            locks: &self.pair_locks,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// 读取菜单并转换为平台载荷；任何校验失败都不会触达网络
    async fn prepare(
        &self,
        menu_id: &str,
        platform: PlatformType,
        config: &ProviderConfig,
        item_ids: Option<&[String]>,
    ) -> Result<PreparedPush> {
        if config.platform() != platform {
            return Err(ValidationError::mismatch(platform, config.platform()).into());
        }
        let menu = self
            .menus
            .load_menu(menu_id)
            .await?
            .ok_or_else(|| MenuSyncError::NotFound(format!("menu {}", menu_id)))?;
        let adapter = self
            .adapters
            .get(platform)
            .ok_or_else(|| MenuSyncError::Config(format!("no adapter registered for {}", platform)))?;

        let mut payload = adapter.transform(&menu, config)?;
        if let Some(ids) = item_ids.filter(|ids| !ids.is_empty()) {
            payload = adapter.apply_partial_update(&payload, ids)?;
        }

        Ok(PreparedPush {
            platform,
            endpoint: adapter.endpoint(config),
            adapter,
            payload,
        })
    }

    /// 互斥与未变化检查；调用方必须持有该菜单 + 平台的锁
    async fn admit(
        &self,
        menu_id: &str,
        platform: PlatformType,
        payload: &ProviderMenuPayload,
        force_sync: bool,
    ) -> Result<()> {
        let history = self
            .applier
            .store()
            .find_by_menu_and_platform(menu_id, platform, false)
            .await?;

        if let Some(active) = history.iter().find(|op| !op.is_terminal()) {
            return Err(MenuSyncError::Conflict(format!(
                "sync {} for menu {} on {} is still {}",
                active.id, menu_id, platform, active.status
            )));
        }

        if !force_sync {
            let last_completed = history.iter().find(|op| op.status == SyncStatus::Completed);
            if let Some(last) = last_completed {
                if last.payload_checksum.as_deref() == Some(payload.checksum.as_str()) {
                    return Err(MenuSyncError::Unchanged(format!(
                        "menu {} on {} matches completed sync {}",
                        menu_id, platform, last.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn estimate(&self, payload: &ProviderMenuPayload) -> u64 {
        self.config.estimate_duration(payload.item_count()).as_millis() as u64
    }

    fn spawn_push(self: &Arc<Self>, job: PushJob) {
        let this = self.clone();
        tokio::spawn(async move { this.drive(job).await });
    }

    // ========== 对外操作 ==========

    /// 创建 pending 操作并在后台驱动，立即返回
    pub async fn initiate_sync(self: &Arc<Self>, request: SyncRequest) -> Result<SyncHandle> {
        self.ensure_running()?;
        let push = self
            .prepare(
                &request.menu_id,
                request.platform_type,
                &request.config,
                request.item_ids.as_deref(),
            )
            .await?;

        let operation = {
            let _guard = self.lock_pair(&request.menu_id, request.platform_type).await;
            self.admit(&request.menu_id, request.platform_type, &push.payload, request.force_sync)
                .await?;
            let operation = SyncOperation::new(
                &request.menu_id,
                request.platform_type,
                push.payload.item_count() as u32,
            )
            .with_checksum(&push.payload.checksum);
            self.applier.store().create(&operation).await?;
            operation
        };

        info!(
            "📤 [{}] 同步已创建 / sync initiated: sync_id={}, menu_id={}, items={}",
            request.platform_type,
            operation.id,
            operation.menu_id,
            operation.items_total
        );

        let handle = SyncHandle {
            sync_id: operation.id.clone(),
            status: "initiated".to_string(),
            estimated_duration_ms: self.estimate(&push.payload),
        };
        self.spawn_push(PushJob {
            sync_id: operation.id,
            push,
        });
        Ok(handle)
    }

    /// 多平台批量同步；所有成员先校验并创建为 pending，再按优先级执行
    pub async fn batch_sync(self: &Arc<Self>, request: BatchRequest) -> Result<BatchHandle> {
        self.ensure_running()?;
        if request.platforms.is_empty() {
            return Err(MenuSyncError::InvalidArgument("batch has no platforms".to_string()));
        }
        let mut seen = HashSet::new();
        for member in &request.platforms {
            if !seen.insert(member.platform_type) {
                return Err(MenuSyncError::InvalidArgument(format!(
                    "platform {} listed more than once",
                    member.platform_type
                )));
            }
        }

        let mut members = request.platforms.clone();
        members.sort_by_key(|m| m.priority);

        // 全部校验通过才创建任何操作
        let mut pushes = Vec::with_capacity(members.len());
        let mut invalid = Vec::new();
        for member in &members {
            match self
                .prepare(&request.menu_id, member.platform_type, &member.config, None)
                .await
            {
                Ok(push) => pushes.push(push),
                Err(MenuSyncError::Validation(e)) => invalid.push(e),
                Err(e) => return Err(e),
            }
        }
        if let Some(merged) = ValidationError::merge(invalid) {
            return Err(merged.into());
        }

        // 固定顺序加锁
        let mut lock_order: Vec<PlatformType> = pushes.iter().map(|p| p.platform).collect();
        lock_order.sort();
        let mut guards = Vec::with_capacity(lock_order.len());
        for platform in lock_order {
            guards.push(self.lock_pair(&request.menu_id, platform).await);
        }
        for push in &pushes {
            self.admit(&request.menu_id, push.platform, &push.payload, true).await?;
        }

        let mut batch = BatchSyncOperation::new(&request.menu_id, request.mode, request.fail_fast);
        let mut operations = Vec::with_capacity(pushes.len());
        let mut jobs = Vec::with_capacity(pushes.len());
        for push in pushes {
            let operation =
                SyncOperation::new(&request.menu_id, push.platform, push.payload.item_count() as u32)
                    .with_batch(&batch.id)
                    .with_checksum(&push.payload.checksum);
            self.applier.store().create(&operation).await?;
            batch.member_ids.push(operation.id.clone());
            jobs.push(PushJob {
                sync_id: operation.id.clone(),
                push,
            });
            operations.push(operation);
        }
        self.applier.store().create_batch(&batch).await?;
        drop(guards);

        info!(
            "📤 批量同步已创建 / batch created: batch_id={}, menu_id={}, mode={:?}, fail_fast={}, members={}",
            batch.id,
            batch.menu_id,
            batch.mode,
            batch.fail_fast,
            operations.len()
        );

        let handle = BatchHandle {
            batch_id: batch.id.clone(),
            sync_operations: operations,
        };
        let this = self.clone();
        tokio::spawn(async move { this.run_batch(batch, jobs).await });
        Ok(handle)
    }

    pub async fn get_status(&self, sync_id: &str) -> Result<SyncOperation> {
        self.applier
            .store()
            .find_by_id(sync_id)
            .await?
            .ok_or_else(|| MenuSyncError::NotFound(format!("sync operation {}", sync_id)))
    }

    pub async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatusView> {
        let store = self.applier.store();
        let batch = store
            .find_batch(batch_id)
            .await?
            .ok_or_else(|| MenuSyncError::NotFound(format!("batch {}", batch_id)))?;
        let mut members = Vec::with_capacity(batch.member_ids.len());
        for id in &batch.member_ids {
            if let Some(op) = store.find_by_id(id).await? {
                members.push(op);
            }
        }
        Ok(BatchStatusView::new(batch, members))
    }

    /// 协作式取消：已发出的调用不会中断，但其结果无法再改变操作状态
    pub async fn cancel_sync(&self, sync_id: &str) -> Result<SyncOperation> {
        let outcome = self
            .applier
            .apply(
                sync_id,
                SyncTransition::Cancel,
                EventSource::Operator,
                Some("cancelled by request".to_string()),
            )
            .await?;
        match outcome {
            TransitionOutcome::Applied { operation, .. } => {
                info!(
                    "✅ [{}] 同步已取消 / sync cancelled: sync_id={}",
                    operation.platform_type, operation.id
                );
                Ok(operation)
            }
            _ => Err(MenuSyncError::NotFoundOrAlreadyTerminal(sync_id.to_string())),
        }
    }

    /// 为失败操作派生一个新操作（retry_of 指向原操作）。
    /// 平台凭据不落库，需要调用方重新提供配置。
    pub async fn retry_sync(self: &Arc<Self>, sync_id: &str, config: ProviderConfig) -> Result<SyncHandle> {
        self.ensure_running()?;
        let failed = self.get_status(sync_id).await?;
        if failed.status != SyncStatus::Failed {
            return Err(MenuSyncError::InvalidArgument(format!(
                "only failed operations can be retried; {} is {}",
                sync_id, failed.status
            )));
        }

        let push = self
            .prepare(&failed.menu_id, failed.platform_type, &config, None)
            .await?;
        let operation = {
            let _guard = self.lock_pair(&failed.menu_id, failed.platform_type).await;
            self.admit(&failed.menu_id, failed.platform_type, &push.payload, true)
                .await?;
            let operation = SyncOperation::new(
                &failed.menu_id,
                failed.platform_type,
                push.payload.item_count() as u32,
            )
            .with_retry_of(&failed.id)
            .with_checksum(&push.payload.checksum);
            self.applier.store().create(&operation).await?;
            operation
        };

        info!(
            "🔁 [{}] 显式重试 / explicit retry: sync_id={}, retry_of={}",
            failed.platform_type, operation.id, failed.id
        );

        let handle = SyncHandle {
            sync_id: operation.id.clone(),
            status: "initiated".to_string(),
            estimated_duration_ms: self.estimate(&push.payload),
        };
        self.spawn_push(PushJob {
            sync_id: operation.id,
            push,
        });
        Ok(handle)
    }

    /// 历史记录，按创建时间倒序分页
    pub async fn get_history(&self, query: HistoryQuery) -> Result<Page<SyncOperation>> {
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(MenuSyncError::InvalidArgument(
                    "history range starts after it ends".to_string(),
                ));
            }
        }
        let filter = SyncFilter {
            menu_id: query.menu_id,
            platform_type: query.platform_type,
            status: query.status,
            from: query.from,
            to: query.to,
        };
        self.applier
            .store()
            .list(&filter, Pagination::new(query.page, query.limit))
            .await
    }

    pub async fn get_analytics(
        &self,
        period: AnalyticsPeriod,
        platform: Option<PlatformType>,
    ) -> Result<SyncAnalytics> {
        let since = Utc::now() - period.duration();
        self.applier.store().aggregate(since, platform).await
    }

    /// 停止调度新的尝试；已在途的操作保持当前状态
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            info!("✅ 编排器已停止调度 / orchestrator stopped scheduling");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ========== 驱动 ==========

    #[instrument(skip_all, fields(sync_id = %job.sync_id, platform = %job.push.platform))]
    async fn drive(self: Arc<Self>, job: PushJob) {
        if let Err(e) = self.run_attempts(&job).await {
            error!("❌ 同步驱动失败 / sync driver aborted: {}", e);
        }
    }

    async fn run_attempts(&self, job: &PushJob) -> Result<()> {
        let platform = job.push.platform;
        loop {
            if self.shutdown.is_cancelled() {
                debug!("编排器已停止，操作保持当前状态 / left in place on shutdown");
                return Ok(());
            }

            let operation = match self
                .applier
                .apply(&job.sync_id, SyncTransition::Start, EventSource::Orchestrator, None)
                .await?
            {
                TransitionOutcome::Applied { operation, .. } => operation,
                // 已取消或已由 webhook 结束
                _ => return Ok(()),
            };
            let attempt = operation.retry_count + 1;

            let failure = match self.attempt(job, attempt).await? {
                AttemptOutcome::Settled => return Ok(()),
                AttemptOutcome::Accepted => return self.await_completion(job, attempt).await,
                AttemptOutcome::Retryable(failure) => failure,
            };

            let policy = self.resilience.policy(platform);
            if !policy.retry.should_retry(operation.retry_count) {
                let error = MenuSyncError::TransientProvider {
                    platform,
                    attempt,
                    will_retry: false,
                    message: failure.message,
                };
                warn!("❌ [{}] 重试已耗尽 / retries exhausted: {}", platform, error);
                self.applier
                    .apply(
                        &job.sync_id,
                        SyncTransition::Fail { error: error.to_string() },
                        EventSource::Orchestrator,
                        None,
                    )
                    .await?;
                return Ok(());
            }

            let error = MenuSyncError::TransientProvider {
                platform,
                attempt,
                will_retry: true,
                message: failure.message,
            };
            let outcome = self
                .applier
                .apply(
                    &job.sync_id,
                    SyncTransition::Retry { error: error.to_string() },
                    EventSource::Orchestrator,
                    Some(error.to_string()),
                )
                .await?;
            if !outcome.is_applied() {
                return Ok(());
            }

            let delay = self
                .resilience
                .delay(platform, operation.retry_count)
                .max(failure.min_delay);
            warn!(
                "⚠️ [{}] 第 {} 次尝试失败，{}ms 后重试 / attempt failed, retrying: {}",
                platform,
                attempt,
                delay.as_millis(),
                error
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn attempt(&self, job: &PushJob, attempt: u32) -> Result<AttemptOutcome> {
        let platform = job.push.platform;
        let before = self.resilience.breaker_state(platform);

        if let Err(denied) = self.resilience.acquire(platform) {
            debug!("[{}] 准入被拒绝 / admission denied: {}", platform, denied);
            self.observe_breaker(platform, before).await;
            return Ok(AttemptOutcome::Retryable(AttemptFailure {
                min_delay: denied.retry_after(),
                message: MenuSyncError::from(denied).to_string(),
            }));
        }

        let timeout = self.resilience.policy(platform).call_timeout();
        let request = ProviderRequest::new(
            platform,
            job.push.endpoint.clone(),
            job.push.payload.to_bytes(),
            &job.sync_id,
        );
        debug!(
            "📤 [{}] 第 {} 次调用 / calling provider: {:?} {}",
            platform, attempt, request.method, request.url
        );
        let result = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderCallError::Timeout),
        };

        match result {
            Ok(raw) => {
                self.resilience.record_success(platform);
                self.observe_breaker(platform, before).await;
                let response = job.push.adapter.parse_response(raw.status, &raw.body);
                let transition = if response.accepted_async {
                    SyncTransition::Accepted {
                        external_reference: response.external_reference,
                    }
                } else {
                    SyncTransition::Complete {
                        external_reference: response.external_reference,
                        items_processed: response.items_processed,
                    }
                };
                let outcome = self
                    .applier
                    .apply(&job.sync_id, transition, EventSource::Orchestrator, None)
                    .await?;
                match outcome {
                    TransitionOutcome::Applied { operation, .. } if operation.is_terminal() => {
                        info!(
                            "✅ [{}] 同步完成 / sync completed: sync_id={}, duration_ms={:?}",
                            platform, operation.id, operation.duration_ms
                        );
                        Ok(AttemptOutcome::Settled)
                    }
                    TransitionOutcome::Applied { operation, .. } => {
                        info!(
                            "✅ [{}] 平台已受理，等待回执 / accepted, awaiting webhook: sync_id={}, ref={:?}",
                            platform, operation.id, operation.external_reference
                        );
                        Ok(AttemptOutcome::Accepted)
                    }
                    _ => Ok(AttemptOutcome::Settled),
                }
            }
            Err(call_error) => {
                let reason = FailureReason::from_call_error(&call_error);
                let retryable = self.resilience.record_call_failure(platform, &reason);
                self.observe_breaker(platform, before).await;
                if retryable {
                    return Ok(AttemptOutcome::Retryable(AttemptFailure {
                        message: call_error.to_string(),
                        min_delay: Duration::ZERO,
                    }));
                }

                let error = MenuSyncError::PermanentProvider {
                    platform,
                    attempt,
                    status: call_error.status(),
                    message: call_error.to_string(),
                };
                error!("❌ [{}] 平台拒绝 / provider rejected: {}", platform, error);
                self.applier
                    .apply(
                        &job.sync_id,
                        SyncTransition::Fail { error: error.to_string() },
                        EventSource::Orchestrator,
                        None,
                    )
                    .await?;
                Ok(AttemptOutcome::Settled)
            }
        }
    }

    /// 等待异步受理的回执；超过 completion_timeout 仍未结束则记为失败，
    /// 释放该菜单 + 平台
    async fn await_completion(&self, job: &PushJob, attempt: u32) -> Result<()> {
        let platform = job.push.platform;
        let limit = Duration::from_secs(self.config.completion_timeout_secs);
        let waited = tokio::select! {
            waited = self.applier.wait_terminal(&job.sync_id, limit) => waited?,
            _ = self.shutdown.cancelled() => return Ok(()),
        };
        match waited {
            Some(operation) if !operation.is_terminal() => {
                let error = MenuSyncError::TransientProvider {
                    platform,
                    attempt,
                    will_retry: false,
                    message: format!("no completion received within {}s", limit.as_secs()),
                };
                warn!("❌ [{}] 回执超时 / completion timed out: {}", platform, error);
                self.applier
                    .apply(
                        &job.sync_id,
                        SyncTransition::Fail { error: error.to_string() },
                        EventSource::Orchestrator,
                        None,
                    )
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn observe_breaker(&self, platform: PlatformType, before: BreakerState) {
        let after = self.resilience.breaker_state(platform);
        if after != before {
            warn!(
                "⚠️ [{}] 熔断状态变化 / circuit {:?} -> {:?}",
                platform, before, after
            );
            self.applier
                .notifier()
                .notify(event_builders::circuit_state_changed(platform, before, after))
                .await;
        }
    }

    // ========== 批量 ==========

    async fn run_batch(self: Arc<Self>, batch: BatchSyncOperation, jobs: Vec<PushJob>) {
        match batch.mode {
            ExecutionMode::Parallel => {
                join_all(jobs.into_iter().map(|job| self.clone().drive(job))).await;
            }
            ExecutionMode::Sequence => {
                let mut halted_by: Option<String> = None;
                for job in jobs {
                    if let Some(failed_id) = &halted_by {
                        let _ = self
                            .applier
                            .apply(
                                &job.sync_id,
                                SyncTransition::Cancel,
                                EventSource::Orchestrator,
                                Some(format!("batch halted after member {} failed", failed_id)),
                            )
                            .await;
                        continue;
                    }
                    if self.shutdown.is_cancelled() {
                        break;
                    }

                    // 驱动返回时成员已结束（含回执超时），停机时除外
                    let sync_id = job.sync_id.clone();
                    self.clone().drive(job).await;
                    match self.applier.store().find_by_id(&sync_id).await {
                        Ok(Some(op)) if op.status == SyncStatus::Failed && batch.fail_fast => {
                            warn!(
                                "⚠️ 批量 fail_fast 触发 / fail_fast halting batch {}: member {} failed",
                                batch.id, sync_id
                            );
                            halted_by = Some(sync_id);
                        }
                        Ok(_) => {}
                        Err(e) => error!("❌ 读取成员状态失败 / member lookup failed: {}", e),
                    }
                }
            }
        }

        match self.get_batch_status(&batch.id).await {
            Ok(view) if view.aggregate != BatchStatus::InProgress => {
                info!(
                    "✅ 批量结束 / batch finished: batch_id={}, aggregate={:?}",
                    batch.id, view.aggregate
                );
                self.applier
                    .notifier()
                    .notify(event_builders::batch_finished(&view))
                    .await;
            }
            Ok(view) => debug!(
                "批量仍有未结束成员 / batch {} still {:?}",
                batch.id, view.aggregate
            ),
            Err(e) => error!("❌ 读取批量状态失败 / batch lookup failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{test_configs, Violation};
    use crate::events::{EventManager, SyncEvent};
    use crate::menu::fixtures::sample_menu;
    use crate::menu::{Category, MemoryMenuSource};
    use crate::store::MemorySyncStore;
    use crate::transport::scripted::{http, ok, Outcome, ScriptedTransport};
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        orchestrator: Arc<SyncOrchestrator>,
        transport: Arc<ScriptedTransport>,
        menus: Arc<MemoryMenuSource>,
        events: Arc<EventManager>,
        applier: Arc<TransitionApplier>,
    }

    fn harness(outcomes: Vec<Outcome>) -> Harness {
        let config = MenuSyncConfig::default();
        let menus = Arc::new(MemoryMenuSource::new());
        menus.put(sample_menu("menu-1"));
        let events = Arc::new(EventManager::new(256));
        let applier = Arc::new(TransitionApplier::new(
            Arc::new(MemorySyncStore::new()),
            events.clone(),
        ));
        let transport = ScriptedTransport::new(outcomes);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            config.clone(),
            menus.clone(),
            Arc::new(AdapterRegistry::with_defaults()),
            Arc::new(ResilienceController::new(&config)),
            transport.clone(),
            applier.clone(),
        ));
        Harness {
            orchestrator,
            transport,
            menus,
            events,
            applier,
        }
    }

    impl Harness {
        async fn finish(&self, sync_id: &str) -> SyncOperation {
            self.applier
                .wait_terminal(sync_id, Duration::from_secs(600))
                .await
                .unwrap()
                .unwrap()
        }
    }

    fn careem_request() -> SyncRequest {
        SyncRequest::new("menu-1", PlatformType::Careem, test_configs::careem())
    }

    #[tokio::test]
    async fn test_initiate_sync_completes() {
        let h = harness(vec![Ok(ok(200, r#"{"menu_id":"cm-77"}"#))]);
        let handle = h.orchestrator.initiate_sync(careem_request()).await.unwrap();
        assert_eq!(handle.status, "initiated");
        assert!(handle.estimated_duration_ms > 0);
        let early = h.orchestrator.get_status(&handle.sync_id).await.unwrap();
        assert!(matches!(early.status, SyncStatus::Pending | SyncStatus::InProgress));

        let op = h.finish(&handle.sync_id).await;
        assert_eq!(op.status, SyncStatus::Completed);
        assert!(op.duration_ms.unwrap() > 0);
        assert!(op.completed_at.is_some());
        assert_eq!(op.items_processed, 3);
        assert_eq!(op.external_reference.as_deref(), Some("cm-77"));
        assert!(op.error_message.is_none());

        let requests = h.transport.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].header("X-Correlation-Id"), Some(handle.sync_id.as_str()));
    }

    #[tokio::test]
    async fn test_validation_failure_never_reaches_transport() {
        let h = harness(vec![]);
        let mut menu = sample_menu("menu-empty");
        menu.categories.push(Category {
            id: "c-empty".to_string(),
            name: crate::menu::fixtures::text("Empty", "فارغ"),
            available: true,
            image: None,
            products: Vec::new(),
        });
        h.menus.put(menu);

        let err = h
            .orchestrator
            .initiate_sync(SyncRequest::new("menu-empty", PlatformType::Talabat, test_configs::talabat()))
            .await
            .unwrap_err();
        match err {
            MenuSyncError::Validation(e) => assert!(e
                .violations
                .contains(&Violation::EmptyCategory { category_id: "c-empty".to_string() })),
            other => panic!("expected validation error, got {:?}", other),
        }
        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(h.orchestrator.resilience.health(PlatformType::Talabat).window_in_use, 0);

        let history = h.orchestrator.get_history(HistoryQuery::default()).await.unwrap();
        assert_eq!(history.total, 0);
    }

    #[tokio::test]
    async fn test_rejects_mismatched_config_and_missing_menu() {
        let h = harness(vec![]);
        let err = h
            .orchestrator
            .initiate_sync(SyncRequest::new("menu-1", PlatformType::Careem, test_configs::talabat()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = h
            .orchestrator
            .initiate_sync(SyncRequest::new("nope", PlatformType::Careem, test_configs::careem()))
            .await
            .unwrap_err();
        assert!(matches!(err, MenuSyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_active_pair_conflicts_and_unchanged_is_skipped() {
        let h = harness(vec![Ok(ok(202, r#"{"job_id":"job-1"}"#))]);
        let first = h.orchestrator.initiate_sync(careem_request()).await.unwrap();

        let err = h.orchestrator.initiate_sync(careem_request()).await.unwrap_err();
        assert!(matches!(err, MenuSyncError::Conflict(_)));

        // 平台异步受理后由 webhook 结束
        h.applier
            .apply(
                &first.sync_id,
                SyncTransition::Complete { external_reference: None, items_processed: None },
                EventSource::Webhook,
                None,
            )
            .await
            .unwrap();

        let err = h.orchestrator.initiate_sync(careem_request()).await.unwrap_err();
        assert!(matches!(err, MenuSyncError::Unchanged(_)));

        let forced = h.orchestrator.initiate_sync(careem_request().force()).await;
        assert_ok!(forced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_then_succeed() {
        let h = harness(vec![http(503), Err(ProviderCallError::Timeout), Ok(ok(200, "{}"))]);
        let mut rx = h.events.subscribe();
        let handle = h.orchestrator.initiate_sync(careem_request()).await.unwrap();

        let op = h.finish(&handle.sync_id).await;
        assert_eq!(op.status, SyncStatus::Completed);
        assert_eq!(op.retry_count, 2);
        assert!(op.last_attempt_error.unwrap().contains("will retry automatically"));
        assert_eq!(h.transport.call_count(), 3);

        // 每次重试都推送 in_progress -> pending
        let mut retries = 0;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::SyncStatusChanged { old_status: SyncStatus::InProgress, new_status: SyncStatus::Pending, .. } = event {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_fails_with_detail() {
        let h = harness(vec![http(502)]);
        let handle = h.orchestrator.initiate_sync(careem_request()).await.unwrap();

        let op = h.finish(&handle.sync_id).await;
        assert_eq!(op.status, SyncStatus::Failed);
        assert_eq!(op.retry_count, 3);
        assert_eq!(h.transport.call_count(), 4);
        let message = op.error_message.unwrap();
        assert!(message.contains("careem"));
        assert!(message.contains("attempt 4"));
        assert!(message.contains("no further automatic retry"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_immediately() {
        let h = harness(vec![http(422)]);
        let handle = h.orchestrator.initiate_sync(careem_request()).await.unwrap();

        let op = h.finish(&handle.sync_id).await;
        assert_eq!(op.status, SyncStatus::Failed);
        assert_eq!(op.retry_count, 0);
        assert_eq!(h.transport.call_count(), 1);
        assert!(op.error_message.unwrap().contains("HTTP 422"));

        let health = h.orchestrator.resilience.health(PlatformType::Careem);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_permanent_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_documented_status_is_retryable() {
        // talabat 把 408 声明为可重试
        let h = harness(vec![http(408), Ok(ok(200, r#"{"import_id":"imp-1"}"#))]);
        let handle = h
            .orchestrator
            .initiate_sync(SyncRequest::new("menu-1", PlatformType::Talabat, test_configs::talabat()))
            .await
            .unwrap();
        let op = h.finish(&handle.sync_id).await;
        assert_eq!(op.status, SyncStatus::Completed);
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.external_reference.as_deref(), Some("imp-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_emits_event() {
        let h = harness(vec![http(500)]);
        let mut rx = h.events.subscribe_filtered(
            crate::events::EventFilter::new()
                .with_event_types(vec!["circuit_state_changed".to_string()]),
        );
        let mut policy = h.orchestrator.resilience.policy(PlatformType::Careem);
        policy.retry.max_retries = 5;
        policy.circuit_breaker.failure_threshold = 2;
        h.orchestrator
            .resilience
            .update_policy(PlatformType::Careem, policy)
            .unwrap();

        let handle = h.orchestrator.initiate_sync(careem_request()).await.unwrap();
        h.finish(&handle.sync_id).await;

        match rx.try_recv().unwrap() {
            SyncEvent::CircuitStateChanged { old_state, new_state, .. } => {
                assert_eq!(old_state, BreakerState::Closed);
                assert_eq!(new_state, BreakerState::Open);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_is_final() {
        let h = harness(vec![Ok(ok(202, r#"{"job_id":"job-9"}"#))]);
        let handle = h.orchestrator.initiate_sync(careem_request()).await.unwrap();
        let _ = h
            .applier
            .wait_terminal(&handle.sync_id, Duration::from_millis(50))
            .await;

        let cancelled = h.orchestrator.cancel_sync(&handle.sync_id).await.unwrap();
        assert_eq!(cancelled.status, SyncStatus::Cancelled);

        let again = h.orchestrator.cancel_sync(&handle.sync_id).await;
        assert!(matches!(again, Err(MenuSyncError::NotFoundOrAlreadyTerminal(_))));
        assert_err!(h.orchestrator.cancel_sync("missing").await);
    }

    fn webhook(sync_id: &str, status: &str) -> crate::webhook::WebhookPayload {
        crate::webhook::WebhookPayload {
            sync_id: sync_id.to_string(),
            status: status.to_string(),
            message: None,
            external_id: None,
            items_processed: Some(1),
            metadata: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_webhook_before_first_attempt_and_during_backoff() {
        let h = harness(vec![http(503), Ok(ok(200, "{}"))]);
        let handler = crate::webhook::WebhookHandler::new(h.applier.clone());
        let mut rx = h.events.subscribe();
        let handle = h.orchestrator.initiate_sync(careem_request()).await.unwrap();

        let ack = handler
            .handle_completion(PlatformType::Careem, webhook(&handle.sync_id, "processing"))
            .await
            .unwrap();
        assert!(ack.processed);
        assert_eq!(ack.status, Some(SyncStatus::Pending));

        // 第一次失败后进入退避
        loop {
            if let SyncEvent::SyncStatusChanged {
                old_status: SyncStatus::InProgress,
                new_status: SyncStatus::Pending,
                ..
            } = rx.recv().await.unwrap()
            {
                break;
            }
        }
        let ack = handler
            .handle_completion(PlatformType::Careem, webhook(&handle.sync_id, "in_progress"))
            .await
            .unwrap();
        assert_eq!(ack.status, Some(SyncStatus::Pending));

        let op = h.finish(&handle.sync_id).await;
        assert_eq!(op.status, SyncStatus::Completed);
        assert_eq!(op.retry_count, 1);
        assert_eq!(h.transport.call_count(), 2);
        assert_ok!(h.orchestrator.initiate_sync(careem_request().force()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_attempt_stays_cancelled() {
        let h = harness(vec![Ok(ok(200, "{}"))]);
        let handler = crate::webhook::WebhookHandler::new(h.applier.clone());
        let handle = h.orchestrator.initiate_sync(careem_request()).await.unwrap();

        let cancelled = h.orchestrator.cancel_sync(&handle.sync_id).await.unwrap();
        assert!(cancelled.started_at.is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let ack = handler
            .handle_completion(PlatformType::Careem, webhook(&handle.sync_id, "completed"))
            .await
            .unwrap();
        assert!(!ack.processed);
        assert_eq!(ack.status, Some(SyncStatus::Cancelled));

        let stored = h.orchestrator.get_status(&handle.sync_id).await.unwrap();
        assert_eq!(stored.status, SyncStatus::Cancelled);
        assert_eq!(stored.completed_at, cancelled.completed_at);
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_without_webhook_expires() {
        let h = harness(vec![Ok(ok(202, r#"{"job_id":"job-3"}"#))]);
        let handle = h.orchestrator.initiate_sync(careem_request()).await.unwrap();

        let op = h.finish(&handle.sync_id).await;
        assert_eq!(op.status, SyncStatus::Failed);
        assert_eq!(op.external_reference.as_deref(), Some("job-3"));
        let message = op.error_message.unwrap();
        assert!(message.contains("no completion received within 300s"));
        assert!(message.contains("no further automatic retry"));

        // 菜单 + 平台不再被占用
        assert_ok!(h.orchestrator.initiate_sync(careem_request()).await);
    }

    #[tokio::test]
    async fn test_pair_locks_are_released() {
        let h = harness(vec![Ok(ok(202, r#"{"job_id":"job-4"}"#))]);
        h.orchestrator.initiate_sync(careem_request()).await.unwrap();
        assert!(h.orchestrator.pair_locks.lock().is_empty());

        assert_err!(h.orchestrator.initiate_sync(careem_request()).await);
        assert!(h.orchestrator.pair_locks.lock().is_empty());

        let err = h
            .orchestrator
            .batch_sync(BatchRequest {
                menu_id: "menu-1".to_string(),
                platforms: vec![
                    BatchMember::new(test_configs::careem()),
                    BatchMember::new(test_configs::talabat()),
                ],
                mode: ExecutionMode::Parallel,
                fail_fast: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MenuSyncError::Conflict(_)));
        assert!(h.orchestrator.pair_locks.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sync_links_new_operation() {
        let h = harness(vec![http(400), Ok(ok(200, "{}"))]);
        let handle = h.orchestrator.initiate_sync(careem_request()).await.unwrap();
        let failed = h.finish(&handle.sync_id).await;
        assert_eq!(failed.status, SyncStatus::Failed);

        let retry = h
            .orchestrator
            .retry_sync(&failed.id, test_configs::careem())
            .await
            .unwrap();
        assert_ne!(retry.sync_id, failed.id);
        let op = h.finish(&retry.sync_id).await;
        assert_eq!(op.status, SyncStatus::Completed);
        assert_eq!(op.retry_of.as_deref(), Some(failed.id.as_str()));

        // 原失败操作保持不变
        let original = h.orchestrator.get_status(&failed.id).await.unwrap();
        assert_eq!(original.status, SyncStatus::Failed);

        let err = h.orchestrator.retry_sync(&op.id, test_configs::careem()).await.unwrap_err();
        assert!(matches!(err, MenuSyncError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_partial_sync_counts_selected_items() {
        let h = harness(vec![Ok(ok(200, "{}"))]);
        let handle = h
            .orchestrator
            .initiate_sync(careem_request().with_items(vec!["p-cola".to_string()]))
            .await
            .unwrap();
        let op = h.finish(&handle.sync_id).await;
        assert_eq!(op.items_total, 1);

        let err = h
            .orchestrator
            .initiate_sync(careem_request().force().with_items(vec!["p-ghost".to_string()]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_fail_fast_cancels_remaining() {
        let h = harness(vec![http(400)]);
        let mut rx = h.events.subscribe_filtered(
            crate::events::EventFilter::new().with_event_types(vec!["batch_finished".to_string()]),
        );
        let handle = h
            .orchestrator
            .batch_sync(BatchRequest {
                menu_id: "menu-1".to_string(),
                platforms: vec![
                    BatchMember::new(test_configs::talabat()).with_priority(2),
                    BatchMember::new(test_configs::careem()).with_priority(1),
                ],
                mode: ExecutionMode::Sequence,
                fail_fast: true,
            })
            .await
            .unwrap();
        assert_eq!(handle.sync_operations[0].platform_type, PlatformType::Careem);
        assert!(handle
            .sync_operations
            .iter()
            .all(|op| op.status == SyncStatus::Pending));

        let event = rx.recv().await.unwrap();
        let view = h.orchestrator.get_batch_status(&handle.batch_id).await.unwrap();
        assert_eq!(view.members[0].status, SyncStatus::Failed);
        assert_eq!(view.members[1].status, SyncStatus::Cancelled);
        assert_eq!(view.aggregate, BatchStatus::PartiallyCompleted);
        assert_eq!(h.transport.call_count(), 1);
        assert!(matches!(
            event,
            SyncEvent::BatchFinished { aggregate: BatchStatus::PartiallyCompleted, .. }
        ));
    }

    #[tokio::test]
    async fn test_parallel_batch_completes_all_members() {
        let h = harness(vec![Ok(ok(200, "{}"))]);
        let mut rx = h.events.subscribe_filtered(
            crate::events::EventFilter::new().with_event_types(vec!["batch_finished".to_string()]),
        );
        let handle = h
            .orchestrator
            .batch_sync(BatchRequest {
                menu_id: "menu-1".to_string(),
                platforms: PlatformType::ALL
                    .iter()
                    .map(|p| BatchMember::new(test_configs::for_platform(*p)))
                    .collect(),
                mode: ExecutionMode::Parallel,
                fail_fast: false,
            })
            .await
            .unwrap();
        assert_eq!(handle.sync_operations.len(), 3);

        rx.recv().await.unwrap();
        let view = h.orchestrator.get_batch_status(&handle.batch_id).await.unwrap();
        assert_eq!(view.aggregate, BatchStatus::Completed);
        assert!(view
            .members
            .iter()
            .all(|m| m.batch_id.as_deref() == Some(handle.batch_id.as_str())));
        assert_eq!(h.transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_batch_validation_is_all_or_nothing() {
        let h = harness(vec![]);
        let err = h
            .orchestrator
            .batch_sync(BatchRequest {
                menu_id: "menu-1".to_string(),
                platforms: vec![
                    BatchMember::new(test_configs::careem()),
                    BatchMember {
                        platform_type: PlatformType::Talabat,
                        config: test_configs::deliveroo(),
                        priority: 0,
                    },
                ],
                mode: ExecutionMode::Parallel,
                fail_fast: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let history = h.orchestrator.get_history(HistoryQuery::default()).await.unwrap();
        assert_eq!(history.total, 0);
    }

    #[tokio::test]
    async fn test_history_and_analytics() {
        let h = harness(vec![Ok(ok(200, "{}"))]);
        for platform in PlatformType::ALL {
            let handle = h
                .orchestrator
                .initiate_sync(SyncRequest::new("menu-1", platform, test_configs::for_platform(platform)))
                .await
                .unwrap();
            h.finish(&handle.sync_id).await;
        }

        let page = h
            .orchestrator
            .get_history(HistoryQuery {
                platform_type: Some(PlatformType::Talabat),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].platform_type, PlatformType::Talabat);

        let analytics = h
            .orchestrator
            .get_analytics("24h".parse().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(analytics.total_syncs, 3);
        assert_eq!(analytics.success_count, 3);
        assert!(matches!("2d".parse::<AnalyticsPeriod>(), Err(MenuSyncError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_syncs() {
        let h = harness(vec![]);
        h.orchestrator.shutdown();
        assert!(h.orchestrator.is_shutting_down());
        let err = h.orchestrator.initiate_sync(careem_request()).await.unwrap_err();
        assert_eq!(err.code(), "SHUTTING_DOWN");
    }
}
