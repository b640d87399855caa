//! MenuSync - 外卖平台菜单同步引擎
//!
//! 把一份规范菜单推送到多个外卖平台（Careem、Talabat、Deliveroo）：
//! - 🧩 平台适配器：规范菜单 → 各平台载荷，推送前完成校验
//! - 🛡️ 韧性控制：每个平台独立的滑动窗口限流与熔断
//! - 🔁 编排：后台驱动、指数退避重试、并行/顺序批量
//! - 📬 Webhook 回执：异步完成结果与进行中的操作对账
//! - 📡 进度事件：统一的事件总线与外部推送端口
//! - 💾 持久化：内存或 SQLite（refinery 迁移）
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use menusync::{MemoryMenuSource, MenuSyncConfig, MenuSyncEngine, PlatformType, SyncRequest};
//! use menusync::adapter::{careem::CareemConfig, ProviderConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     menusync::logging::init_logging(false);
//!
//!     let menus = Arc::new(MemoryMenuSource::new());
//!     let config = MenuSyncConfig::builder().database_path("/tmp/menusync.db").build()?;
//!     let engine = MenuSyncEngine::builder(config, menus).build()?;
//!
//!     let careem = ProviderConfig::Careem(CareemConfig {
//!         brand_id: "brand-1".into(),
//!         branch_id: "branch-1".into(),
//!         api_key: "secret".into(),
//!         base_url: None,
//!     });
//!     let handle = engine
//!         .initiate_sync(SyncRequest::new("menu-1", PlatformType::Careem, careem))
//!         .await?;
//!     println!("sync {} initiated", handle.sync_id);
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod menu;
pub mod platform;
pub mod resilience;
pub mod store;
pub mod sync;
pub mod transport;
pub mod version;
pub mod webhook;

// 重新导出核心类型，方便使用
pub use adapter::{AdapterRegistry, ProviderAdapter, ProviderConfig, ProviderMenuPayload, ValidationError, Violation};
pub use config::{MenuSyncConfig, MenuSyncConfigBuilder, ProviderPolicy};
pub use engine::{MenuSyncEngine, MenuSyncEngineBuilder};
pub use error::{MenuSyncError, Result};
pub use events::{
    EventFilter, EventManager, EventSource, EventStats, PlatformEventCounts, ProgressNotifier,
    SyncEvent,
};
pub use menu::{CanonicalMenu, MemoryMenuSource, MenuSource};
pub use platform::PlatformType;
pub use resilience::{BreakerState, ProviderHealth, ResilienceController};
pub use store::{MemorySyncStore, SqliteSyncStore, SyncOperationStore};
pub use sync::{
    BatchMember, BatchRequest, BatchStatus, ExecutionMode, HistoryQuery, SyncOperation,
    SyncRequest, SyncStatus,
};
pub use transport::{HttpProviderTransport, ProviderTransport};
pub use version::ENGINE_VERSION;
pub use webhook::{WebhookAck, WebhookPayload};
