//! 日志初始化

use tracing::Level;

/// 安装 fmt 订阅者；已安装过时返回 false
pub fn init_logging(debug: bool) -> bool {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(debug)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_logging(true);
        assert!(!init_logging(false));
    }
}
