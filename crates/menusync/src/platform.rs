//! 外卖平台标识

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MenuSyncError;

/// 支持同步的外卖平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformType {
    Careem,
    Talabat,
    Deliveroo,
}

impl PlatformType {
    pub const ALL: [PlatformType; 3] = [
        PlatformType::Careem,
        PlatformType::Talabat,
        PlatformType::Deliveroo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformType::Careem => "careem",
            PlatformType::Talabat => "talabat",
            PlatformType::Deliveroo => "deliveroo",
        }
    }

    /// 在 `ALL` 中的位置
    pub fn index(&self) -> usize {
        match self {
            PlatformType::Careem => 0,
            PlatformType::Talabat => 1,
            PlatformType::Deliveroo => 2,
        }
    }

    /// 平台展示名称
    pub fn display_name(&self) -> &'static str {
        match self {
            PlatformType::Careem => "Careem Now",
            PlatformType::Talabat => "Talabat",
            PlatformType::Deliveroo => "Deliveroo",
        }
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformType {
    type Err = MenuSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "careem" | "careem_now" => Ok(PlatformType::Careem),
            "talabat" => Ok(PlatformType::Talabat),
            "deliveroo" => Ok(PlatformType::Deliveroo),
            other => Err(MenuSyncError::InvalidArgument(format!("未知平台类型: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse_and_display() {
        for platform in PlatformType::ALL {
            let parsed: PlatformType = platform.as_str().parse().unwrap();
            assert_eq!(parsed, platform);
        }
        assert_eq!("Careem".parse::<PlatformType>().unwrap(), PlatformType::Careem);
        assert!("ubereats".parse::<PlatformType>().is_err());
        assert_eq!(
            serde_json::to_string(&PlatformType::Talabat).unwrap(),
            "\"talabat\""
        );
    }
}
