//! Careem Now 适配器
//!
//! 价格为十进制字符串（"12.50"），按品牌 + 门店推送整份菜单。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    parse_json_response, retain_items, validate_common, HttpMethod, ProviderAdapter,
    ProviderConfig, ProviderEndpoint, ProviderMenuPayload, ProviderResponse, ProviderTemplate,
    ValidationError,
};
use crate::menu::{format_minor, CanonicalMenu, LocalizedText, ModifierGroup, Product};
use crate::platform::PlatformType;

const DEFAULT_BASE_URL: &str = "https://api.careemnow.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CareemConfig {
    pub brand_id: String,
    pub branch_id: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CareemAdapter;

impl CareemAdapter {
    pub fn new() -> Self {
        Self
    }

    fn item(product: &Product, exponent: u32) -> Value {
        json!({
            "id": product.id,
            "name": localized(&product.name),
            "description": localized(&product.description),
            "price": format_minor(product.price_minor, exponent),
            "is_available": product.available,
            "image_url": product.image.as_ref().map(|m| m.url.clone()),
            "option_groups": product
                .modifier_groups
                .iter()
                .map(|g| Self::option_group(g, exponent))
                .collect::<Vec<_>>(),
        })
    }

    fn option_group(group: &ModifierGroup, exponent: u32) -> Value {
        json!({
            "id": group.id,
            "name": localized(&group.name),
            "min": group.min_selections,
            "max": group.max_selections,
            "options": group
                .modifiers
                .iter()
                .map(|m| json!({
                    "id": m.id,
                    "name": localized(&m.name),
                    "price": format_minor(m.price_minor, exponent),
                    "is_available": m.available,
                }))
                .collect::<Vec<_>>(),
        })
    }
}

fn localized(text: &LocalizedText) -> Value {
    json!(text)
}

impl ProviderAdapter for CareemAdapter {
    fn platform(&self) -> PlatformType {
        PlatformType::Careem
    }

    fn transform(
        &self,
        menu: &CanonicalMenu,
        config: &ProviderConfig,
    ) -> Result<ProviderMenuPayload, ValidationError> {
        ValidationError::check(
            self.platform(),
            validate_common(self.platform(), menu, config),
        )?;
        let ProviderConfig::Careem(cfg) = config else {
            return Err(ValidationError::mismatch(self.platform(), config.platform()));
        };

        let exponent = menu.currency_exponent();
        let item_ids = menu.products().map(|p| p.id.clone()).collect();
        let body = json!({
            "brand_id": cfg.brand_id,
            "branch_id": cfg.branch_id,
            "currency": menu.currency,
            "name": localized(&menu.name),
            "update_type": "full",
            "categories": menu
                .categories
                .iter()
                .map(|c| json!({
                    "id": c.id,
                    "name": localized(&c.name),
                    "is_available": c.available,
                    "items": c.products.iter().map(|p| Self::item(p, exponent)).collect::<Vec<_>>(),
                }))
                .collect::<Vec<_>>(),
        });

        Ok(ProviderMenuPayload::new(
            self.platform(),
            &menu.id,
            body,
            item_ids,
            false,
        ))
    }

    fn apply_partial_update(
        &self,
        payload: &ProviderMenuPayload,
        item_ids: &[String],
    ) -> Result<ProviderMenuPayload, ValidationError> {
        let (mut body, kept) = retain_items(payload, "/categories", "items", item_ids)?;
        body["update_type"] = json!("partial");
        Ok(ProviderMenuPayload::new(
            self.platform(),
            &payload.metadata.menu_id,
            body,
            kept,
            true,
        ))
    }

    fn templates(&self) -> Vec<ProviderTemplate> {
        vec![
            ProviderTemplate {
                name: "standard_restaurant".to_string(),
                description: "Single branch, auto-accept orders".to_string(),
                defaults: json!({ "auto_accept": true, "prep_time_minutes": 20 }),
            },
            ProviderTemplate {
                name: "cloud_kitchen".to_string(),
                description: "Multiple virtual brands on one branch".to_string(),
                defaults: json!({ "auto_accept": true, "prep_time_minutes": 15, "multi_brand": true }),
            },
        ]
    }

    fn endpoint(&self, config: &ProviderConfig) -> ProviderEndpoint {
        let (base, brand, branch, key) = match config {
            ProviderConfig::Careem(c) => (
                c.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
                c.brand_id.as_str(),
                c.branch_id.as_str(),
                c.api_key.as_str(),
            ),
            _ => (DEFAULT_BASE_URL, "", "", ""),
        };
        ProviderEndpoint {
            method: HttpMethod::Put,
            url: format!(
                "{}/v1/brands/{}/branches/{}/menu",
                base.trim_end_matches('/'),
                brand,
                branch
            ),
            headers: vec![("X-Api-Key".to_string(), key.to_string())],
        }
    }

    fn parse_response(&self, status: u16, body: &[u8]) -> ProviderResponse {
        parse_json_response(status, body, &["menu_id", "job_id"], Some(202))
    }
}
