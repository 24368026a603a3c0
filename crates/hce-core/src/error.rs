//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为卡模拟子系统对外暴露的全部失败语义提供集中定义；
//! - 每个变体都映射到稳定的点分错误码（`hce.*`），注册接口据此向调用方返回非零结果码，
//!   日志也以同一错误码作为检索字段。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，保持 `Clone + Eq`，便于测试直接比较；
//! - AID 文本格式错误单独建模为 [`AidError`]，通过 `From` 汇入 [`HceError`]；
//! - 协议层（APDU 分发）的失败从不以 `Err` 形式出现，而是降级为状态字，见 `hce-switch`。

use thiserror::Error;

/// AID 文本解析错误。
///
/// # 教案式说明
/// - **意图 (Why)**：AID 文本格式是与配置数据、注册接口互通的唯一线上格式，
///   解析失败需要精确指出是“长度”还是“字符”问题；
/// - **契约 (What)**：`literal` 保留调用方传入的原文，便于排障；
/// - **风险 (Trade-offs)**：原文可能较长，但 AID 上限仅 33 个字符，复制成本可忽略。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum AidError {
    /// 十六进制位数为奇数或不在 `[10, 32]` 区间内。
    #[error("AID `{literal}` has {digits} hex digits, expected an even count in [10, 32]")]
    InvalidLength { literal: String, digits: usize },

    /// 出现非十六进制字符，或模式标记不在末尾。
    #[error("AID `{literal}` has an invalid character {found:?} at position {position}")]
    InvalidCharacter {
        literal: String,
        found: char,
        position: usize,
    },
}

impl AidError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            AidError::InvalidLength { .. } => "hce.aid.invalid_length",
            AidError::InvalidCharacter { .. } => "hce.aid.invalid_character",
        }
    }
}

/// 卡模拟子系统的统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把模式解析、硬件适配、路由规划与注册接口的失败收敛到一个枚举，
///   调用方只需匹配一次即可决定重试、告警或直接返回错误码；
/// - **契约 (What)**：
///   - 变体携带可读上下文（服务标识、容量等），`Display` 输出英文诊断信息；
///   - [`HceError::code`] 返回稳定错误码，永不随措辞调整而变化；
/// - **执行 (How)**：AID 解析错误经 `#[from]` 自动转换，`?` 可直接跨层传播；
/// - **风险 (Trade-offs)**：上下文使用 `String` 保存，牺牲少量堆分配换取可读性。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum HceError {
    /// AID 文本格式错误。
    #[error(transparent)]
    Aid(#[from] AidError),

    /// 写入硬件路由表的 AID 字节长度不在 `[5, 16]` 区间内。
    #[error("routing entry AID of {len} bytes is outside [5, 16]")]
    IllegalAidLength { len: usize },

    /// 模式集合中两个模式互相冲突。
    #[error("pattern `{pattern}` conflicts with `{existing}`")]
    ConflictingPattern { pattern: String, existing: String },

    /// 试图注册一个空的模式集合。
    #[error("pattern set of category `{category}` contains no AID")]
    EmptyPatternSet { category: String },

    /// 执行环境适配器尚未从控制器取得能力信息。
    #[error("execution environment adapter is not ready: {detail}")]
    AdapterNotReady { detail: String },

    /// 控制器拒绝了一次路由表操作。
    #[error("controller rejected `{operation}`")]
    ControllerRejected { operation: String },

    /// 路由表容量不足以容纳默认兜底条目。
    #[error("routing table capacity {capacity} bytes cannot hold the default entry ({required} bytes)")]
    InsufficientCapacity { capacity: usize, required: usize },

    /// 控制器拒绝提交新的路由表。
    #[error("controller rejected routing table commit at revision {revision}")]
    CommitFailed { revision: u64 },

    /// 注册接口引用了未注册的服务。
    #[error("service `{service}` is not registered")]
    NoSuchService { service: String },

    /// 服务标识为空或格式非法。
    #[error("invalid service identity: {detail}")]
    InvalidIdentity { detail: String },

    /// 服务重复注册。
    #[error("service `{service}` is already registered")]
    ServiceAlreadyRegistered { service: String },

    /// 模式集合类别不是 `normal`/`secure`。
    #[error("unknown pattern set category `{category}`")]
    InvalidCategory { category: String },

    /// 控制器不支持的执行环境名称。
    #[error("execution environment `{name}` is not supported by the controller")]
    InvalidExecutionEnvironment { name: String },

    /// 候选前台服务与默认服务的安全类 AID 冲突。
    #[error("service `{service}` conflicts with the default handler")]
    ConflictsWithDefault { service: String },

    /// 执行环境为 host 的服务不允许迁移。
    #[error("execution environment of service `{service}` cannot be moved to or from host")]
    HostModificationNotAllowed { service: String },
}

impl HceError {
    /// 稳定错误码。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：注册接口需要向外部注册中心返回机器可读的结果码；
    /// - **契约 (What)**：返回 `'static` 字符串，格式为 `hce.<域>.<原因>`；
    /// - **风险 (Trade-offs)**：新增变体时必须同步补充错误码，`match` 的穷尽性检查会提醒这一点。
    pub fn code(&self) -> &'static str {
        match self {
            HceError::Aid(inner) => inner.code(),
            HceError::IllegalAidLength { .. } => "hce.routing.illegal_aid_length",
            HceError::ConflictingPattern { .. } => "hce.aid.conflict",
            HceError::EmptyPatternSet { .. } => "hce.aid.empty_set",
            HceError::AdapterNotReady { .. } => "hce.adapter.not_ready",
            HceError::ControllerRejected { .. } => "hce.adapter.rejected",
            HceError::InsufficientCapacity { .. } => "hce.routing.insufficient_capacity",
            HceError::CommitFailed { .. } => "hce.routing.commit_failed",
            HceError::NoSuchService { .. } => "hce.registry.no_such_service",
            HceError::InvalidIdentity { .. } => "hce.registry.invalid_identity",
            HceError::ServiceAlreadyRegistered { .. } => "hce.registry.duplicate_service",
            HceError::InvalidCategory { .. } => "hce.registry.invalid_category",
            HceError::InvalidExecutionEnvironment { .. } => "hce.registry.invalid_environment",
            HceError::ConflictsWithDefault { .. } => "hce.registry.conflicts_with_default",
            HceError::HostModificationNotAllowed { .. } => "hce.registry.host_immutable",
        }
    }
}
