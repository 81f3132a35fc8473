//! 日志初始化
//!
//! 安装 `tracing-subscriber` 的 fmt 输出，过滤规则取自 `RUST_LOG`，
//! 未设置时使用 `info`。`log` crate 的记录通过 `tracing-log` 转发。

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// 默认过滤级别
pub const DEFAULT_FILTER: &str = "info";

/// 初始化日志（重复调用是空操作）
pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}

/// 以 `default_filter` 作为 `RUST_LOG` 缺省值初始化日志
pub fn init_with_filter(default_filter: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        // 其他组件可能已经安装了全局 subscriber
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
        let _ = tracing_log::LogTracer::init();
        tracing::debug!("Logging initialised (default filter '{}')", default_filter);
    });
}
