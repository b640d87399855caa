//! 菜单同步引擎主接口
//!
//! 分层装配：
//! - 存储层：SyncOperationStore（配置了 database_path 时为 SQLite，否则为内存）
//! - 事件层：EventManager（ProgressNotifier 的内置实现）
//! - 韧性层：ResilienceController
//! - 业务层：SyncOrchestrator + WebhookHandler，共用一个 TransitionApplier

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::adapter::{AdapterRegistry, ProviderTemplate};
use crate::config::{MenuSyncConfig, ProviderPolicy};
use crate::error::{MenuSyncError, Result};
use crate::events::{
    EventFilter, EventManager, EventStats, FilteredEventReceiver, ProgressNotifier, SyncEvent,
};
use crate::menu::MenuSource;
use crate::platform::PlatformType;
use crate::resilience::{ProviderHealth, ResilienceController};
use crate::store::{MemorySyncStore, Page, SqliteSyncStore, SyncAnalytics, SyncOperationStore};
use crate::sync::applier::TransitionApplier;
use crate::sync::batch::BatchStatusView;
use crate::sync::operation::SyncOperation;
use crate::sync::orchestrator::{
    AnalyticsPeriod, BatchHandle, BatchRequest, HistoryQuery, SyncHandle, SyncOrchestrator,
    SyncRequest,
};
use crate::transport::{HttpProviderTransport, ProviderTransport};
use crate::version::ENGINE_VERSION;
use crate::webhook::{parse_payload, WebhookAck, WebhookHandler, WebhookPayload};

/// 引擎构建器；菜单来源必填，其余组件可替换
pub struct MenuSyncEngineBuilder {
    config: MenuSyncConfig,
    menus: Arc<dyn MenuSource>,
    transport: Option<Arc<dyn ProviderTransport>>,
    store: Option<Arc<dyn SyncOperationStore>>,
    notifier: Option<Arc<dyn ProgressNotifier>>,
    adapters: Option<AdapterRegistry>,
}

impl MenuSyncEngineBuilder {
    pub fn transport(mut self, transport: Arc<dyn ProviderTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn SyncOperationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 外部进度推送（实时通道）；内置 EventManager 仍然可订阅
    pub fn notifier(mut self, notifier: Arc<dyn ProgressNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = Some(adapters);
        self
    }

    pub fn build(self) -> Result<MenuSyncEngine> {
        info!("正在初始化 MenuSyncEngine v{}...", ENGINE_VERSION);
        self.config.validate()?;

        // === 第1层：存储 ===
        let store: Arc<dyn SyncOperationStore> = match (self.store, &self.config.database_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SqliteSyncStore::open(path)?),
            (None, None) => Arc::new(MemorySyncStore::new()),
        };

        // === 第2层：事件 ===
        let events = Arc::new(EventManager::new(self.config.event_buffer_size));
        let notifier: Arc<dyn ProgressNotifier> = match self.notifier {
            Some(external) => Arc::new(FanOutNotifier {
                events: events.clone(),
                external,
            }),
            None => events.clone(),
        };

        // === 第3层：韧性与传输 ===
        let resilience = Arc::new(ResilienceController::new(&self.config));
        let transport: Arc<dyn ProviderTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                let http = &self.config.http_client_config;
                Arc::new(HttpProviderTransport::new(
                    std::time::Duration::from_secs(http.connect_timeout_secs),
                    std::time::Duration::from_secs(http.request_timeout_secs),
                )?)
            }
        };
        let adapters = Arc::new(self.adapters.unwrap_or_else(AdapterRegistry::with_defaults));

        // === 第4层：编排与回执 ===
        let applier = Arc::new(TransitionApplier::new(store.clone(), notifier));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            self.config.clone(),
            self.menus,
            adapters.clone(),
            resilience.clone(),
            transport,
            applier.clone(),
        ));
        let webhooks = WebhookHandler::new(applier);

        info!(
            "✅ MenuSyncEngine 初始化完成 / engine ready: platforms={:?}, persistent={}",
            adapters.platforms(),
            self.config.database_path.is_some()
        );

        Ok(MenuSyncEngine {
            config: self.config,
            events,
            resilience,
            adapters,
            orchestrator,
            webhooks,
        })
    }
}

/// 同时推送到内置事件总线和外部通道
struct FanOutNotifier {
    events: Arc<EventManager>,
    external: Arc<dyn ProgressNotifier>,
}

#[async_trait::async_trait]
impl ProgressNotifier for FanOutNotifier {
    async fn notify(&self, event: SyncEvent) {
        self.events.emit(event.clone());
        self.external.notify(event).await;
    }
}

pub struct MenuSyncEngine {
    config: MenuSyncConfig,
    events: Arc<EventManager>,
    resilience: Arc<ResilienceController>,
    adapters: Arc<AdapterRegistry>,
    orchestrator: Arc<SyncOrchestrator>,
    webhooks: WebhookHandler,
}

impl MenuSyncEngine {
    pub fn builder(config: MenuSyncConfig, menus: Arc<dyn MenuSource>) -> MenuSyncEngineBuilder {
        MenuSyncEngineBuilder {
            config,
            menus,
            transport: None,
            store: None,
            notifier: None,
            adapters: None,
        }
    }

    pub fn config(&self) -> &MenuSyncConfig {
        &self.config
    }

    // ========== 同步 ==========

    pub async fn initiate_sync(&self, request: SyncRequest) -> Result<SyncHandle> {
        self.orchestrator.initiate_sync(request).await
    }

    pub async fn batch_sync(&self, request: BatchRequest) -> Result<BatchHandle> {
        self.orchestrator.batch_sync(request).await
    }

    pub async fn get_status(&self, sync_id: &str) -> Result<SyncOperation> {
        self.orchestrator.get_status(sync_id).await
    }

    pub async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatusView> {
        self.orchestrator.get_batch_status(batch_id).await
    }

    pub async fn cancel_sync(&self, sync_id: &str) -> Result<SyncOperation> {
        self.orchestrator.cancel_sync(sync_id).await
    }

    pub async fn retry_sync(
        &self,
        sync_id: &str,
        config: crate::adapter::ProviderConfig,
    ) -> Result<SyncHandle> {
        self.orchestrator.retry_sync(sync_id, config).await
    }

    pub async fn get_history(&self, query: HistoryQuery) -> Result<Page<SyncOperation>> {
        self.orchestrator.get_history(query).await
    }

    pub async fn get_analytics(
        &self,
        period: AnalyticsPeriod,
        platform: Option<PlatformType>,
    ) -> Result<SyncAnalytics> {
        self.orchestrator.get_analytics(period, platform).await
    }

    // ========== 回执 ==========

    pub async fn handle_completion(
        &self,
        platform: PlatformType,
        payload: WebhookPayload,
    ) -> Result<WebhookAck> {
        self.webhooks.handle_completion(platform, payload).await
    }

    /// `platform-webhook/{platform}` 原始请求体入口
    pub async fn handle_webhook(&self, platform: &str, body: &[u8]) -> Result<WebhookAck> {
        let platform: PlatformType = platform.parse()?;
        let payload = parse_payload(body)?;
        self.handle_completion(platform, payload).await
    }

    // ========== 平台运维 ==========

    pub fn provider_health(&self, platform: PlatformType) -> ProviderHealth {
        self.resilience.health(platform)
    }

    pub fn update_policy(&self, platform: PlatformType, policy: ProviderPolicy) -> Result<()> {
        self.resilience.update_policy(platform, policy)
    }

    pub fn reset_provider(&self, platform: PlatformType) {
        self.resilience.reset(platform)
    }

    pub fn templates(&self, platform: PlatformType) -> Result<Vec<ProviderTemplate>> {
        self.adapters
            .get(platform)
            .map(|adapter| adapter.templates())
            .ok_or_else(|| MenuSyncError::Config(format!("no adapter registered for {}", platform)))
    }

    // ========== 事件 ==========

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.events
    }

    /// 按平台汇总的同步事件计数
    pub fn event_stats(&self) -> EventStats {
        self.events.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    /// 停止调度新的尝试
    pub fn shutdown(&self) {
        info!("正在关闭 MenuSyncEngine...");
        self.orchestrator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_configs;
    use crate::menu::fixtures::sample_menu;
    use crate::menu::MemoryMenuSource;
    use crate::sync::operation::SyncStatus;
    use crate::transport::scripted::{ok, ScriptedTransport};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn menus() -> Arc<MemoryMenuSource> {
        let menus = Arc::new(MemoryMenuSource::new());
        menus.put(sample_menu("menu-1"));
        menus
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SyncEvent>>);

    #[async_trait::async_trait]
    impl ProgressNotifier for Recorder {
        async fn notify(&self, event: SyncEvent) {
            self.0.lock().push(event);
        }
    }

    #[tokio::test]
    async fn test_async_acceptance_resolved_by_webhook() {
        let recorder = Arc::new(Recorder::default());
        let engine = MenuSyncEngine::builder(MenuSyncConfig::default(), menus())
            .transport(ScriptedTransport::new(vec![Ok(ok(202, r#"{"import_id":"imp-5"}"#))]))
            .notifier(recorder.clone())
            .build()
            .unwrap();
        let mut rx = engine.subscribe_filtered(
            EventFilter::new().with_platforms(vec![PlatformType::Talabat]),
        );

        let handle = engine
            .initiate_sync(SyncRequest::new("menu-1", PlatformType::Talabat, test_configs::talabat()))
            .await
            .unwrap();

        // pending -> in_progress
        rx.recv().await.unwrap();
        let mut op = engine.get_status(&handle.sync_id).await.unwrap();
        for _ in 0..100 {
            if op.external_reference.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            op = engine.get_status(&handle.sync_id).await.unwrap();
        }
        assert_eq!(op.status, SyncStatus::InProgress);
        assert_eq!(op.external_reference.as_deref(), Some("imp-5"));

        let body = format!(r#"{{"sync_id":"{}","status":"completed","items_processed":3}}"#, handle.sync_id);
        let ack = engine.handle_webhook("talabat", body.as_bytes()).await.unwrap();
        assert!(ack.processed);

        let op = engine.get_status(&handle.sync_id).await.unwrap();
        assert_eq!(op.status, SyncStatus::Completed);
        assert!(op.duration_ms.unwrap() > 0);
        assert!(recorder.0.lock().len() >= 2);
        let stats = engine.event_stats();
        assert_eq!(stats.by_platform[&PlatformType::Talabat].completed, 1);
        assert_eq!(stats.total_events as usize, recorder.0.lock().len());

        let err = engine.handle_webhook("uber", body.as_bytes()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_sqlite_backed_engine_persists_operations() {
        let dir = tempfile::tempdir().unwrap();
        let config = MenuSyncConfig::builder()
            .database_path(dir.path().join("menusync.db"))
            .build()
            .unwrap();
        let engine = MenuSyncEngine::builder(config, menus())
            .transport(ScriptedTransport::always_ok())
            .build()
            .unwrap();

        let handle = engine
            .initiate_sync(SyncRequest::new("menu-1", PlatformType::Deliveroo, test_configs::deliveroo()))
            .await
            .unwrap();
        let mut status = SyncStatus::Pending;
        for _ in 0..200 {
            status = engine.get_status(&handle.sync_id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status, SyncStatus::Completed);

        let history = engine.get_history(HistoryQuery::default()).await.unwrap();
        assert_eq!(history.total, 1);
        assert_eq!(engine.provider_health(PlatformType::Deliveroo).total_successes, 1);
        assert!(!engine.templates(PlatformType::Deliveroo).unwrap().is_empty());

        engine.shutdown();
        assert!(engine.initiate_sync(SyncRequest::new("menu-1", PlatformType::Careem, test_configs::careem())).await.is_err());
    }
}
