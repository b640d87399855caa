//! 平台 Webhook 回执处理
//!
//! 平台异步处理完成后回调 `platform-webhook/{platform}`。处理规则：
//! - 未知 sync_id：记录日志，返回 processed=false，不报错
//! - 平台与操作不一致：不处理
//! - 操作已是终态：幂等，不做任何修改
//! - 其余情况按回执状态走状态机，并推送进度事件

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{MenuSyncError, Result};
use crate::events::EventSource;
use crate::platform::PlatformType;
use crate::store::TransitionOutcome;
use crate::sync::applier::TransitionApplier;
use crate::sync::operation::{SyncStatus, SyncTransition};

/// 平台回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub sync_id: String,
    /// completed | success | failed | error | in_progress | processing
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub items_processed: Option<u32>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// 回执应答
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAck {
    pub processed: bool,
    #[serde(rename = "syncId")]
    pub sync_id: String,
    /// 处理后（或未处理时当前）的操作状态；未知 id 为 None
    pub status: Option<SyncStatus>,
}

impl WebhookAck {
    fn skipped(sync_id: &str, status: Option<SyncStatus>) -> Self {
        Self {
            processed: false,
            sync_id: sync_id.to_string(),
            status,
        }
    }
}

/// 解析回执体
pub fn parse_payload(body: &[u8]) -> Result<WebhookPayload> {
    let payload: WebhookPayload = serde_json::from_slice(body)?;
    if payload.sync_id.trim().is_empty() {
        return Err(MenuSyncError::InvalidArgument("webhook sync_id is empty".to_string()));
    }
    Ok(payload)
}

/// 回执状态 → 状态迁移
fn transition_for(payload: &WebhookPayload) -> Option<SyncTransition> {
    match payload.status.to_ascii_lowercase().as_str() {
        "completed" | "success" => Some(SyncTransition::Complete {
            external_reference: payload.external_id.clone(),
            items_processed: payload.items_processed,
        }),
        "failed" | "error" => Some(SyncTransition::Fail {
            error: payload
                .message
                .clone()
                .unwrap_or_else(|| "provider reported failure".to_string()),
        }),
        "in_progress" | "processing" => Some(SyncTransition::Progress {
            items_processed: payload.items_processed,
        }),
        _ => None,
    }
}

pub struct WebhookHandler {
    applier: Arc<TransitionApplier>,
}

impl WebhookHandler {
    pub fn new(applier: Arc<TransitionApplier>) -> Self {
        Self { applier }
    }

    pub async fn handle_completion(
        &self,
        platform: PlatformType,
        payload: WebhookPayload,
    ) -> Result<WebhookAck> {
        let sync_id = payload.sync_id.as_str();
        let Some(operation) = self.applier.store().find_by_id(sync_id).await? else {
            let unknown = MenuSyncError::UnknownSyncReference(sync_id.to_string());
            warn!("⚠️ [{}] 忽略回执 / ignoring webhook: {}", platform, unknown);
            return Ok(WebhookAck::skipped(sync_id, None));
        };

        if operation.platform_type != platform {
            warn!(
                "⚠️ [{}] 回执平台不匹配 / webhook platform mismatch: sync_id={} belongs to {}",
                platform, sync_id, operation.platform_type
            );
            return Ok(WebhookAck::skipped(sync_id, Some(operation.status)));
        }

        if operation.is_terminal() {
            debug!(
                "[{}] 重复回执，操作已是 {} / duplicate webhook for terminal sync {}",
                platform, operation.status, sync_id
            );
            return Ok(WebhookAck::skipped(sync_id, Some(operation.status)));
        }

        let Some(transition) = transition_for(&payload) else {
            warn!(
                "⚠️ [{}] 未知回执状态 / unrecognised webhook status {:?} for sync {}",
                platform, payload.status, sync_id
            );
            return Ok(WebhookAck::skipped(sync_id, Some(operation.status)));
        };

        let outcome = self
            .applier
            .apply(sync_id, transition, EventSource::Webhook, payload.message.clone())
            .await?;

        Ok(match outcome {
            TransitionOutcome::Applied { operation, previous } => {
                info!(
                    "✅ [{}] 回执已处理 / webhook applied: sync_id={}, {} -> {}",
                    platform, sync_id, previous, operation.status
                );
                WebhookAck {
                    processed: true,
                    sync_id: sync_id.to_string(),
                    status: Some(operation.status),
                }
            }
            // 与编排器或另一条回执竞争时，先到的终态迁移生效
            TransitionOutcome::Ignored(operation) => {
                WebhookAck::skipped(sync_id, Some(operation.status))
            }
            TransitionOutcome::NotFound => WebhookAck::skipped(sync_id, None),
        })
    }
}
