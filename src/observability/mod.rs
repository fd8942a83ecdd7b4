//! 可观测性：tracing 订阅器

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局订阅器；RUST_LOG 优先，否则使用给定级别。重复调用无效果
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
