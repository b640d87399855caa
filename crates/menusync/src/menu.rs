//! 规范菜单模型（平台无关）
//!
//! 分类 → 商品 → 加料组 → 加料，文本均为多语言，价格以最小货币单位（整数）存储。
//! 同步期间引擎只读此结构，菜单的编辑与持久化由外部系统负责。

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;

/// 多语言文本：locale -> 文本（BTreeMap 保证序列化顺序稳定）
pub type LocalizedText = BTreeMap<String, String>;

/// 取指定语言的非空文本
pub fn text_for<'a>(text: &'a LocalizedText, locale: &str) -> Option<&'a str> {
    text.get(locale)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

/// 媒体引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifier {
    pub id: String,
    pub name: LocalizedText,
    /// 加价（最小货币单位，可为 0）
    pub price_minor: i64,
    #[serde(default = "default_true")]
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifierGroup {
    pub id: String,
    pub name: LocalizedText,
    pub min_selections: u32,
    pub max_selections: u32,
    pub modifiers: Vec<Modifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: LocalizedText,
    #[serde(default)]
    pub description: LocalizedText,
    /// 售价（最小货币单位）
    pub price_minor: i64,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub image: Option<MediaRef>,
    #[serde(default)]
    pub modifier_groups: Vec<ModifierGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: LocalizedText,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub image: Option<MediaRef>,
    pub products: Vec<Product>,
}

/// 规范菜单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMenu {
    pub id: String,
    pub name: LocalizedText,
    /// 商品名称校验使用的语言
    pub default_locale: String,
    /// ISO 4217 币种，如 AED、KWD
    pub currency: String,
    pub categories: Vec<Category>,
}

fn default_true() -> bool {
    true
}

impl CanonicalMenu {
    /// 商品总数
    pub fn product_count(&self) -> usize {
        self.categories.iter().map(|c| c.products.len()).sum()
    }

    /// 遍历所有商品
    pub fn products(&self) -> impl Iterator<Item = &Product> {
        self.categories.iter().flat_map(|c| c.products.iter())
    }

    /// 币种小数位（KWD/BHD/OMR/JOD 为 3 位）
    pub fn currency_exponent(&self) -> u32 {
        match self.currency.to_ascii_uppercase().as_str() {
            "KWD" | "BHD" | "OMR" | "JOD" => 3,
            _ => 2,
        }
    }
}

/// 将最小货币单位格式化为十进制字符串，例如 (1250, 2) -> "12.50"
pub fn format_minor(amount: i64, exponent: u32) -> String {
    let scale = 10i64.pow(exponent);
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs() as i64;
    if exponent == 0 {
        return format!("{}{}", sign, abs);
    }
    format!(
        "{}{}.{:0width$}",
        sign,
        abs / scale,
        abs % scale,
        width = exponent as usize
    )
}

/// 菜单来源（外部协作方：菜单存储）
#[async_trait]
pub trait MenuSource: Send + Sync {
    /// 读取菜单快照；不存在返回 None
    async fn load_menu(&self, menu_id: &str) -> Result<Option<CanonicalMenu>>;
}

/// 内存菜单来源（嵌入式部署与测试使用）
#[derive(Debug, Default)]
pub struct MemoryMenuSource {
    menus: RwLock<HashMap<String, CanonicalMenu>>,
}

impl MemoryMenuSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, menu: CanonicalMenu) {
        self.menus.write().insert(menu.id.clone(), menu);
    }

    pub fn remove(&self, menu_id: &str) -> Option<CanonicalMenu> {
        self.menus.write().remove(menu_id)
    }
}

#[async_trait]
impl MenuSource for MemoryMenuSource {
    async fn load_menu(&self, menu_id: &str) -> Result<Option<CanonicalMenu>> {
        Ok(self.menus.read().get(menu_id).cloned())
    }
}

/// 测试用菜单构造
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn text(en: &str, ar: &str) -> LocalizedText {
        let mut t = LocalizedText::new();
        t.insert("en".to_string(), en.to_string());
        t.insert("ar".to_string(), ar.to_string());
        t
    }

    pub fn product(id: &str, name: &str, price_minor: i64) -> Product {
        Product {
            id: id.to_string(),
            name: text(name, name),
            description: LocalizedText::new(),
            price_minor,
            available: true,
            image: None,
            modifier_groups: Vec::new(),
        }
    }

    pub fn sample_menu(id: &str) -> CanonicalMenu {
        let mut burger = product("p-burger", "Classic Burger", 3250);
        burger.image = Some(MediaRef {
            url: "https://cdn.example.com/burger.jpg".to_string(),
            alt: None,
        });
        burger.modifier_groups.push(ModifierGroup {
            id: "mg-extras".to_string(),
            name: text("Extras", "إضافات"),
            min_selections: 0,
            max_selections: 2,
            modifiers: vec![
                Modifier {
                    id: "m-cheese".to_string(),
                    name: text("Cheese", "جبن"),
                    price_minor: 300,
                    available: true,
                },
                Modifier {
                    id: "m-bacon".to_string(),
                    name: text("Beef Bacon", "لحم مقدد"),
                    price_minor: 500,
                    available: true,
                },
            ],
        });
        CanonicalMenu {
            id: id.to_string(),
            name: text("Main Menu", "القائمة الرئيسية"),
            default_locale: "en".to_string(),
            currency: "AED".to_string(),
            categories: vec![
                Category {
                    id: "c-burgers".to_string(),
                    name: text("Burgers", "برجر"),
                    available: true,
                    image: None,
                    products: vec![burger, product("p-chicken", "Chicken Burger", 2900)],
                },
                Category {
                    id: "c-drinks".to_string(),
                    name: text("Drinks", "مشروبات"),
                    available: true,
                    image: None,
                    products: vec![product("p-cola", "Cola", 800)],
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_minor() {
        assert_eq!(format_minor(1250, 2), "12.50");
        assert_eq!(format_minor(5, 2), "0.05");
        assert_eq!(format_minor(1500, 3), "1.500");
        assert_eq!(format_minor(-75, 2), "-0.75");
        assert_eq!(format_minor(42, 0), "42");
    }

    #[test]
    fn test_text_for_ignores_blank() {
        let mut t = LocalizedText::new();
        t.insert("en".to_string(), "   ".to_string());
        t.insert("ar".to_string(), "برجر".to_string());
        assert_eq!(text_for(&t, "en"), None);
        assert_eq!(text_for(&t, "ar"), Some("برجر"));
    }

    #[tokio::test]
    async fn test_memory_menu_source() {
        let source = MemoryMenuSource::new();
        source.put(fixtures::sample_menu("menu-1"));
        let menu = source.load_menu("menu-1").await.unwrap().unwrap();
        assert_eq!(menu.product_count(), 3);
        assert!(source.load_menu("missing").await.unwrap().is_none());
    }
}
