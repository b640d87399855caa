//! Talabat 适配器
//!
//! 价格使用最小货币单位整数；菜单导入为异步任务，平台返回 202 + import_id，
//! 结果通过 webhook 回传。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    parse_json_response, retain_items, validate_common, HttpMethod, ProviderAdapter,
    ProviderConfig, ProviderEndpoint, ProviderMenuPayload, ProviderResponse, ProviderTemplate,
    ValidationError,
};
use crate::menu::{CanonicalMenu, Product};
use crate::platform::PlatformType;

const DEFAULT_BASE_URL: &str = "https://integration.talabat.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalabatConfig {
    pub vendor_id: String,
    pub chain_code: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TalabatAdapter;

impl TalabatAdapter {
    pub fn new() -> Self {
        Self
    }

    fn product(product: &Product) -> Value {
        json!({
            "id": product.id,
            "title": product.name,
            "description": product.description,
            "price_minor": product.price_minor,
            "active": product.available,
            "images": product.image.iter().map(|m| m.url.clone()).collect::<Vec<_>>(),
            "toppings": product
                .modifier_groups
                .iter()
                .map(|g| json!({
                    "id": g.id,
                    "title": g.name,
                    "quantity": { "minimum": g.min_selections, "maximum": g.max_selections },
                    "options": g
                        .modifiers
                        .iter()
                        .map(|m| json!({
                            "id": m.id,
                            "title": m.name,
                            "price_minor": m.price_minor,
                            "active": m.available,
                        }))
                        .collect::<Vec<_>>(),
                }))
                .collect::<Vec<_>>(),
        })
    }
}

impl ProviderAdapter for TalabatAdapter {
    fn platform(&self) -> PlatformType {
        PlatformType::Talabat
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
        let ProviderConfig::Talabat(cfg) = config else {
            return Err(ValidationError::mismatch(self.platform(), config.platform()));
        };

        let item_ids = menu.products().map(|p| p.id.clone()).collect();
        let body = json!({
            "vendor_id": cfg.vendor_id,
            "chain_code": cfg.chain_code,
            "menu": {
                "title": menu.name,
                "currency": menu.currency,
                "currency_exponent": menu.currency_exponent(),
                "categories": menu
                    .categories
                    .iter()
                    .map(|c| json!({
                        "id": c.id,
                        "title": c.name,
                        "active": c.available,
                        "products": c.products.iter().map(Self::product).collect::<Vec<_>>(),
                    }))
                    .collect::<Vec<_>>(),
            },
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
        let (body, kept) = retain_items(payload, "/menu/categories", "products", item_ids)?;
        Ok(ProviderMenuPayload::new(
            self.platform(),
            &payload.metadata.menu_id,
            body,
            kept,
            true,
        ))
    }

    fn templates(&self) -> Vec<ProviderTemplate> {
        vec![ProviderTemplate {
            name: "chain_vendor".to_string(),
            description: "Chain-level catalog pushed to a single vendor".to_string(),
            defaults: json!({ "import_mode": "replace", "callback": true }),
        }]
    }

    fn endpoint(&self, config: &ProviderConfig) -> ProviderEndpoint {
        let (base, chain, vendor, key) = match config {
            ProviderConfig::Talabat(c) => (
                c.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
                c.chain_code.as_str(),
                c.vendor_id.as_str(),
                c.api_key.as_str(),
            ),
            _ => (DEFAULT_BASE_URL, "", "", ""),
        };
        ProviderEndpoint {
            method: HttpMethod::Post,
            url: format!(
                "{}/v2/chains/{}/vendors/{}/menu-import",
                base.trim_end_matches('/'),
                chain,
                vendor
            ),
            headers: vec![("Authorization".to_string(), format!("Bearer {}", key))],
        }
    }

    fn parse_response(&self, status: u16, body: &[u8]) -> ProviderResponse {
        parse_json_response(status, body, &["import_id", "id"], Some(202))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_configs;
    use crate::menu::fixtures::sample_menu;

    #[test]
    fn test_talabat_uses_minor_units() {
        let payload = TalabatAdapter::new()
            .transform(&sample_menu("menu-1"), &test_configs::talabat())
            .unwrap();
        let burger = &payload.body["menu"]["categories"][0]["products"][0];
        assert_eq!(burger["price_minor"], 3250);
        assert_eq!(burger["toppings"][0]["quantity"]["maximum"], 2);
        assert_eq!(burger["images"][0], "https://cdn.example.com/burger.jpg");
    }

    #[test]
    fn test_talabat_async_import_response() {
        let adapter = TalabatAdapter::new();
        let resp = adapter.parse_response(202, br#"{"import_id":"imp-77"}"#);
        assert!(resp.accepted_async);
        assert_eq!(resp.external_reference.as_deref(), Some("imp-77"));

        let endpoint = adapter.endpoint(&test_configs::talabat());
        assert_eq!(endpoint.method, HttpMethod::Post);
        assert!(endpoint.url.ends_with("/v2/chains/chain-abc/vendors/vendor-9/menu-import"));
        assert_eq!(endpoint.headers[0].1, "Bearer tk_test");
    }
}
