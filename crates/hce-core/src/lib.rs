//! # hce-core
//!
//! ## 定位与职责（Why）
//! - 承载卡模拟（HCE）子系统中与硬件、传输都无关的纯数据契约：AID 模式、模式集合、服务实体与错误分类；
//! - 路由规划（`hce-router`）与协议状态机（`hce-switch`）都只依赖本 crate 暴露的类型，
//!   从而让“匹配语义”只存在一份实现。
//!
//! ## 架构嵌入（Where）
//! - `aid` 模块：AID 文本格式的解析、冲突判定与集合语义；
//! - `service` 模块：服务身份、执行环境、静态/动态模式集合与通道句柄；
//! - `channel` 模块：与远端服务交换 APDU 的双工通道契约；
//! - `config` / `observability`：配置载入与 `tracing` 订阅器安装；
//! - `error` 模块：统一错误枚举与稳定错误码。

pub mod aid;
pub mod channel;
pub mod config;
pub mod error;
pub mod observability;
pub mod service;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use aid::{AidMode, AidPattern, AidPatternSet, PatternSetDocument};
pub use channel::{ApduChannel, ChannelId, DeactivationReason, HceMessage};
pub use config::{ConfigError, HceConfig};
pub use error::{AidError, HceError};
pub use service::{Category, ExecutionEnvironment, Service, ServiceBuilder, ServiceId};
