//! 日志初始化
//!
//! 默认级别 info，可用 RUST_LOG 覆盖。日志写 stderr，stdout 留给 REPL 回复。
//! 能力调用的审计行（event=capability_audit）也走这里。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    init_with_default("info");
}

/// 以给定的默认过滤指令初始化；重复初始化时静默忽略
pub fn init_with_default(directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
