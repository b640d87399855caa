//! Deliveroo 适配器

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    parse_json_response, retain_items, validate_common, HttpMethod, ProviderAdapter,
    ProviderConfig, ProviderEndpoint, ProviderMenuPayload, ProviderResponse, ProviderTemplate,
    ValidationError,
};
use crate::menu::{CanonicalMenu, Product};
use crate::platform::PlatformType;

const DEFAULT_BASE_URL: &str = "https://api.developers.deliveroo.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverooConfig {
    pub brand_id: String,
    pub site_id: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeliverooAdapter;

impl DeliverooAdapter {
    pub fn new() -> Self {
        Self
    }

    fn item(product: &Product) -> Value {
        json!({
            "id": product.id,
            "name": product.name,
            "description": product.description,
            "price_info": { "price": product.price_minor },
            "is_available": product.available,
            "image": product.image.as_ref().map(|m| json!({ "url": m.url })),
            "modifiers": product
                .modifier_groups
                .iter()
                .map(|g| json!({
                    "id": g.id,
                    "name": g.name,
                    "min_selection": g.min_selections,
                    "max_selection": g.max_selections,
                    "item_ids": g.modifiers.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
                    "options": g
                        .modifiers
                        .iter()
                        .map(|m| json!({
                            "id": m.id,
                            "name": m.name,
                            "price_info": { "price": m.price_minor },
                            "is_available": m.available,
                        }))
                        .collect::<Vec<_>>(),
                }))
                .collect::<Vec<_>>(),
        })
    }
}

impl ProviderAdapter for DeliverooAdapter {
    fn platform(&self) -> PlatformType {
        PlatformType::Deliveroo
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
        let ProviderConfig::Deliveroo(cfg) = config else {
            return Err(ValidationError::mismatch(self.platform(), config.platform()));
        };

        let item_ids = menu.products().map(|p| p.id.clone()).collect();
        let body = json!({
            "name": menu.name,
            "site_ids": [cfg.site_id],
            "currency": menu.currency,
            "categories": menu
                .categories
                .iter()
                .map(|c| json!({
                    "id": c.id,
                    "name": c.name,
                    "items": c.products.iter().map(Self::item).collect::<Vec<_>>(),
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
        let (body, kept) = retain_items(payload, "/categories", "items", item_ids)?;
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
                name: "single_site".to_string(),
                description: "One menu published to one site".to_string(),
                defaults: json!({ "publish": true }),
            },
            ProviderTemplate {
                name: "draft_review".to_string(),
                description: "Upload as draft for manual review in the Deliveroo hub".to_string(),
                defaults: json!({ "publish": false }),
            },
        ]
    }

    fn endpoint(&self, config: &ProviderConfig) -> ProviderEndpoint {
        let (base, brand, site, key) = match config {
            ProviderConfig::Deliveroo(c) => (
                c.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
                c.brand_id.as_str(),
                c.site_id.as_str(),
                c.api_key.as_str(),
            ),
            _ => (DEFAULT_BASE_URL, "", "", ""),
        };
        ProviderEndpoint {
            method: HttpMethod::Put,
            url: format!(
                "{}/menu/v1/brands/{}/menus/{}",
                base.trim_end_matches('/'),
                brand,
                site
            ),
            headers: vec![("Authorization".to_string(), format!("Bearer {}", key))],
        }
    }

    fn parse_response(&self, status: u16, body: &[u8]) -> ProviderResponse {
        parse_json_response(status, body, &["id", "menu_id"], None)
    }
}
