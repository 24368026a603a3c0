//! # 日志订阅器安装
//!
//! 子系统各 crate 只通过 `tracing` 宏打点，进程入口调用一次 [`install`] 即可把事件输出到标准输出。
//! 过滤指令优先读取 `RUST_LOG`，其次使用配置中的 `default_directive`，两者都不可用时退回 `info`。

use std::sync::OnceLock;

use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

use crate::config::HceConfig;

/// 安装状态的全局缓存，确保 `install` 仅生效一次。
static INSTALLED: OnceLock<()> = OnceLock::new();

/// 订阅器安装错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ObservabilityError {
    /// `install` 被重复调用。
    #[error("hce observability is already installed")]
    AlreadyInstalled,
    /// 外部已设置全局 `tracing` Subscriber。
    #[error("a global tracing subscriber is already set: {detail}")]
    SubscriberAlreadySet { detail: String },
}

/// 安装全局 `tracing` 订阅器。
///
/// # 教案式说明
/// - **意图 (Why)**：宿主进程可能已有自己的订阅器，本函数绝不 panic，冲突时以错误返回；
/// - **契约 (What)**：成功后后续调用返回 [`ObservabilityError::AlreadyInstalled`]；
/// - **执行 (How)**：`registry` 叠加 `EnvFilter` 与 `fmt` 层后设为全局默认。
pub fn install(config: &HceConfig) -> Result<(), ObservabilityError> {
    if INSTALLED.get().is_some() {
        return Err(ObservabilityError::AlreadyInstalled);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    tracing::subscriber::set_global_default(subscriber).map_err(|err| {
        ObservabilityError::SubscriberAlreadySet {
            detail: err.to_string(),
        }
    })?;
    INSTALLED
        .set(())
        .map_err(|()| ObservabilityError::AlreadyInstalled)
}
