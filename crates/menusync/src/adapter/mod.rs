//! 平台适配器模块
//!
//! 每个外卖平台一个适配器，负责把规范菜单转换为平台的线上格式：
//! - 纯转换，不做任何网络 I/O
//! - 确定性输出：相同输入产生字节一致的 body（生成时间只放在 metadata）
//! - 先校验再输出：一次性列出所有违规项，校验失败的菜单不会消耗限流额度和重试次数

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::menu::{text_for, CanonicalMenu};
use crate::platform::PlatformType;

pub mod careem;
pub mod deliveroo;
pub mod talabat;

pub use careem::{CareemAdapter, CareemConfig};
pub use deliveroo::{DeliverooAdapter, DeliverooConfig};
pub use talabat::{TalabatAdapter, TalabatConfig};

/// 平台配置（按 platform_type 区分的标签联合）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "platform_type", rename_all = "snake_case")]
pub enum ProviderConfig {
    Careem(CareemConfig),
    Talabat(TalabatConfig),
    Deliveroo(DeliverooConfig),
}

impl ProviderConfig {
    pub fn platform(&self) -> PlatformType {
        match self {
            ProviderConfig::Careem(_) => PlatformType::Careem,
            ProviderConfig::Talabat(_) => PlatformType::Talabat,
            ProviderConfig::Deliveroo(_) => PlatformType::Deliveroo,
        }
    }

    /// 平台 API 密钥
    pub fn api_key(&self) -> &str {
        match self {
            ProviderConfig::Careem(c) => &c.api_key,
            ProviderConfig::Talabat(c) => &c.api_key,
            ProviderConfig::Deliveroo(c) => &c.api_key,
        }
    }

    /// 必填字段缺失检查
    fn missing_fields(&self) -> Vec<&'static str> {
        let fields: Vec<(&'static str, &str)> = match self {
            ProviderConfig::Careem(c) => vec![
                ("brand_id", &c.brand_id),
                ("branch_id", &c.branch_id),
                ("api_key", &c.api_key),
            ],
            ProviderConfig::Talabat(c) => vec![
                ("vendor_id", &c.vendor_id),
                ("chain_code", &c.chain_code),
                ("api_key", &c.api_key),
            ],
            ProviderConfig::Deliveroo(c) => vec![
                ("brand_id", &c.brand_id),
                ("site_id", &c.site_id),
                ("api_key", &c.api_key),
            ],
        };
        fields
            .into_iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(k, _)| k)
            .collect()
    }
}

/// 单条违规项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    EmptyMenu,
    EmptyCategory { category_id: String },
    MissingProductName { product_id: String, locale: String },
    NonPositivePrice { product_id: String, price_minor: i64 },
    EmptyModifierGroup { group_id: String },
    InvalidModifierRange { group_id: String, min: u32, max: u32 },
    ConfigPlatformMismatch { expected: PlatformType, actual: PlatformType },
    ConfigFieldMissing { field: String },
    UnknownItem { item_id: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::EmptyMenu => write!(f, "menu has no categories"),
            Violation::EmptyCategory { category_id } => {
                write!(f, "category {} has no products", category_id)
            }
            Violation::MissingProductName { product_id, locale } => {
                write!(f, "product {} has no '{}' name", product_id, locale)
            }
            Violation::NonPositivePrice { product_id, price_minor } => {
                write!(f, "product {} has non-positive price {}", product_id, price_minor)
            }
            Violation::EmptyModifierGroup { group_id } => {
                write!(f, "modifier group {} has no modifiers", group_id)
            }
            Violation::InvalidModifierRange { group_id, min, max } => {
                write!(f, "modifier group {} has min {} > max {}", group_id, min, max)
            }
            Violation::ConfigPlatformMismatch { expected, actual } => {
                write!(f, "config is for {} but adapter is {}", actual, expected)
            }
            Violation::ConfigFieldMissing { field } => {
                write!(f, "config field '{}' is required", field)
            }
            Violation::UnknownItem { item_id } => write!(f, "item {} is not in the payload", item_id),
        }
    }
}

/// 校验错误：列出全部违规项，而不只是第一个
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{platform}: {} violation(s): {}", .violations.len(), join_violations(.violations))]
pub struct ValidationError {
    pub platform: PlatformType,
    pub violations: Vec<Violation>,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    /// 无违规返回 Ok
    pub fn check(platform: PlatformType, violations: Vec<Violation>) -> Result<(), ValidationError> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { platform, violations })
        }
    }

    pub fn mismatch(expected: PlatformType, actual: PlatformType) -> Self {
        ValidationError {
            platform: expected,
            violations: vec![Violation::ConfigPlatformMismatch { expected, actual }],
        }
    }

    /// 合并多个平台的校验结果（批量同步使用）
    pub fn merge(errors: Vec<ValidationError>) -> Option<ValidationError> {
        let mut iter = errors.into_iter();
        let mut first = iter.next()?;
        for e in iter {
            first.violations.extend(e.violations);
        }
        Some(first)
    }
}

/// payload 元信息（不参与校验和）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub menu_id: String,
    pub generated_at: DateTime<Utc>,
    pub item_count: usize,
    pub partial: bool,
}

/// 平台线上格式的菜单载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMenuPayload {
    pub platform: PlatformType,
    pub body: Value,
    /// body 中包含的商品 id（按出现顺序）
    pub item_ids: Vec<String>,
    /// body 的 SHA-256（十六进制）
    pub checksum: String,
    pub metadata: PayloadMetadata,
}

impl ProviderMenuPayload {
    pub fn new(
        platform: PlatformType,
        menu_id: &str,
        body: Value,
        item_ids: Vec<String>,
        partial: bool,
    ) -> Self {
        let checksum = checksum_of(&body);
        let item_count = item_ids.len();
        Self {
            platform,
            body,
            item_ids,
            checksum,
            metadata: PayloadMetadata {
                menu_id: menu_id.to_string(),
                generated_at: Utc::now(),
                item_count,
                partial,
            },
        }
    }

    /// 请求体字节
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.body.to_string())
    }

    pub fn item_count(&self) -> usize {
        self.item_ids.len()
    }
}

fn checksum_of(body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
}

/// 平台出站端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub method: HttpMethod,
    pub url: String,
    /// 平台鉴权头
    pub headers: Vec<(String, String)>,
}

/// 平台响应解析结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub status: u16,
    /// 平台已受理但异步处理，完成结果稍后经 webhook 回传
    pub accepted_async: bool,
    pub external_reference: Option<String>,
    pub items_processed: Option<u32>,
}

/// 平台接入模板（仅元数据）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTemplate {
    pub name: String,
    pub description: String,
    pub defaults: Value,
}

/// 平台适配器
pub trait ProviderAdapter: Send + Sync {
    fn platform(&self) -> PlatformType;

    /// 规范菜单 → 平台载荷
    fn transform(
        &self,
        menu: &CanonicalMenu,
        config: &ProviderConfig,
    ) -> Result<ProviderMenuPayload, ValidationError>;

    /// 只保留指定商品，用于局部重同步
    fn apply_partial_update(
        &self,
        payload: &ProviderMenuPayload,
        item_ids: &[String],
    ) -> Result<ProviderMenuPayload, ValidationError>;

    /// 平台接入预设
    fn templates(&self) -> Vec<ProviderTemplate>;

    /// 出站端点（方法 + URL + 鉴权头）
    fn endpoint(&self, config: &ProviderConfig) -> ProviderEndpoint;

    /// 解析平台成功响应
    fn parse_response(&self, status: u16, body: &[u8]) -> ProviderResponse;
}

/// 通用校验：平台配置 + 菜单结构
pub fn validate_common(
    platform: PlatformType,
    menu: &CanonicalMenu,
    config: &ProviderConfig,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    if config.platform() != platform {
        violations.push(Violation::ConfigPlatformMismatch {
            expected: platform,
            actual: config.platform(),
        });
    } else {
        for field in config.missing_fields() {
            violations.push(Violation::ConfigFieldMissing {
                field: field.to_string(),
            });
        }
    }

    if menu.categories.is_empty() {
        violations.push(Violation::EmptyMenu);
    }

    for category in &menu.categories {
        if category.products.is_empty() {
            violations.push(Violation::EmptyCategory {
                category_id: category.id.clone(),
            });
        }
        for product in &category.products {
            if text_for(&product.name, &menu.default_locale).is_none() {
                violations.push(Violation::MissingProductName {
                    product_id: product.id.clone(),
                    locale: menu.default_locale.clone(),
                });
            }
            if product.price_minor <= 0 {
                violations.push(Violation::NonPositivePrice {
                    product_id: product.id.clone(),
                    price_minor: product.price_minor,
                });
            }
            for group in &product.modifier_groups {
                if group.modifiers.is_empty() {
                    violations.push(Violation::EmptyModifierGroup {
                        group_id: group.id.clone(),
                    });
                }
                if group.min_selections > group.max_selections {
                    violations.push(Violation::InvalidModifierRange {
                        group_id: group.id.clone(),
                        min: group.min_selections,
                        max: group.max_selections,
                    });
                }
            }
        }
    }

    violations
}

/// 在 body 中按商品 id 过滤：`categories_pointer` 指向分类数组，`items_key` 为分类下的商品数组字段。
/// 没有选中商品的分类会被移除；找不到的 id 作为违规项返回。
pub(crate) fn retain_items(
    payload: &ProviderMenuPayload,
    categories_pointer: &str,
    items_key: &str,
    item_ids: &[String],
) -> Result<(Value, Vec<String>), ValidationError> {
    let wanted: HashSet<&str> = item_ids.iter().map(String::as_str).collect();
    let known: HashSet<&str> = payload.item_ids.iter().map(String::as_str).collect();

    let violations: Vec<Violation> = item_ids
        .iter()
        .filter(|id| !known.contains(id.as_str()))
        .map(|id| Violation::UnknownItem { item_id: id.clone() })
        .collect();
    ValidationError::check(payload.platform, violations)?;

    let mut body = payload.body.clone();
    let mut kept = Vec::new();
    if let Some(Value::Array(categories)) = body.pointer_mut(categories_pointer) {
        for category in categories.iter_mut() {
            if let Some(Value::Array(items)) = category.get_mut(items_key) {
                items.retain(|item| {
                    item.get("id")
                        .and_then(Value::as_str)
                        .map(|id| wanted.contains(id))
                        .unwrap_or(false)
                });
                kept.extend(
                    items
                        .iter()
                        .filter_map(|item| item.get("id").and_then(Value::as_str))
                        .map(str::to_string),
                );
            }
        }
        categories.retain(|category| {
            category
                .get(items_key)
                .and_then(Value::as_array)
                .map(|items| !items.is_empty())
                .unwrap_or(false)
        });
    }
    Ok((body, kept))
}

/// 从 JSON 响应中提取第一个存在的引用字段
pub(crate) fn parse_json_response(
    status: u16,
    body: &[u8],
    reference_keys: &[&str],
    async_status: Option<u16>,
) -> ProviderResponse {
    let json: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let external_reference = reference_keys.iter().find_map(|key| match json.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    });
    let items_processed = json
        .get("items_processed")
        .and_then(Value::as_u64)
        .map(|n| n as u32);
    ProviderResponse {
        status,
        accepted_async: async_status == Some(status),
        external_reference,
        items_processed,
    }
}

/// 适配器注册表
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<PlatformType, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册全部内置平台适配器
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CareemAdapter::new()));
        registry.register(Arc::new(TalabatAdapter::new()));
        registry.register(Arc::new(DeliverooAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: PlatformType) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<PlatformType> {
        let mut platforms: Vec<_> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_configs {
    use super::*;

    pub fn careem() -> ProviderConfig {
        ProviderConfig::Careem(CareemConfig {
            brand_id: "brand-1".to_string(),
            branch_id: "branch-1".to_string(),
            api_key: "ck_test".to_string(),
            base_url: None,
        })
    }

    pub fn talabat() -> ProviderConfig {
        ProviderConfig::Talabat(TalabatConfig {
            vendor_id: "vendor-9".to_string(),
            chain_code: "chain-abc".to_string(),
            api_key: "tk_test".to_string(),
            base_url: None,
        })
    }

    pub fn deliveroo() -> ProviderConfig {
        ProviderConfig::Deliveroo(DeliverooConfig {
            brand_id: "brand-7".to_string(),
            site_id: "site-3".to_string(),
            api_key: "dk_test".to_string(),
            base_url: None,
        })
    }

    pub fn for_platform(platform: PlatformType) -> ProviderConfig {
        match platform {
            PlatformType::Careem => careem(),
            PlatformType::Talabat => talabat(),
            PlatformType::Deliveroo => deliveroo(),
        }
    }
}
