//! # 子系统配置
//!
//! 配置以 TOML 文本提供，全部字段带缺省值，未知字段直接报错以便尽早暴露拼写错误：
//!
//! ```toml
//! priority_category = "secure"
//! default_directive = "hce_switch=debug,info"
//! header_cost = 4
//! conflict_tolerant_locations = ["host"]
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::{Category, ExecutionEnvironment};

/// 每条路由表条目的固定开销：TAG + ROUTE + LEN + POWER 各 1 字节。
pub const DEFAULT_HEADER_COST: usize = 4;

/// 配置载入错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// TOML 语法或字段类型错误。
    #[error("invalid hce configuration: {detail}")]
    Parse { detail: String },

    /// 字段取值越界。
    #[error("hce configuration field `{field}` is out of range: {detail}")]
    OutOfRange { field: &'static str, detail: String },
}

/// 卡模拟子系统配置。
///
/// # 教案式说明
/// - **意图 (Why)**：把优先类别、条目开销与日志缺省级别这类“部署相关”的常量集中起来；
/// - **契约 (What)**：`Default` 与空 TOML 文本得到相同结果；`header_cost` 必须大于 0；
/// - **风险 (Trade-offs)**：`conflict_tolerant_locations` 放宽了冲突过滤，只应包含由控制器优先级
///   自行裁决重叠的执行环境（通常只有 host）。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HceConfig {
    /// 路由策略中的优先类别。
    pub priority_category: Category,
    /// `RUST_LOG` 未设置时使用的过滤指令。
    pub default_directive: String,
    /// 每条路由表条目的固定开销。
    pub header_cost: usize,
    /// 允许 AID 冲突共存的执行环境。
    pub conflict_tolerant_locations: Vec<String>,
}

impl Default for HceConfig {
    fn default() -> Self {
        Self {
            priority_category: Category::Secure,
            default_directive: "info".to_owned(),
            header_cost: DEFAULT_HEADER_COST,
            conflict_tolerant_locations: vec![ExecutionEnvironment::HOST.to_owned()],
        }
    }
}

impl HceConfig {
    /// 从 TOML 文本载入配置。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: HceConfig = toml::from_str(text).map_err(|err| ConfigError::Parse {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段取值。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.header_cost == 0 {
            return Err(ConfigError::OutOfRange {
                field: "header_cost",
                detail: "must be at least 1 byte".to_owned(),
            });
        }
        Ok(())
    }

    /// 允许冲突共存的执行环境。
    pub fn tolerant_environments(&self) -> Vec<ExecutionEnvironment> {
        self.conflict_tolerant_locations
            .iter()
            .map(ExecutionEnvironment::new)
            .collect()
    }
}
