//! # 执行环境适配器
//!
//! ## 核心意图（Why）
//! - 把“执行环境”这一抽象概念（host、嵌入式安全元件 eSE、SIM）翻译为控制器理解的路由编号；
//! - 缓存控制器上报的能力（默认路由、模式位图、路由表容量、off-host 路由列表），避免每次规划都查询硬件。
//!
//! ## 契约（What）
//! - 首次使用时惰性初始化，成功后结果不再变化；控制器尚未就绪时返回
//!   [`HceError::AdapterNotReady`]，下次调用会重新尝试；
//! - 路由表变更操作只做一件事：把调用转交控制器并如实报告其布尔结果；
//! - `add_entry` 在触碰硬件前校验 AID 长度，空 AID 仅用于默认兜底条目。

use std::sync::Arc;

use hce_core::aid::{AidMode, MAX_AID_BYTES, MIN_AID_BYTES};
use hce_core::{ExecutionEnvironment, HceError};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// host 执行环境的路由编号。
pub const HOST_ROUTE: u8 = 0x00;
/// 控制器模式位图：支持前缀匹配。
pub const MODE_PREFIX: u8 = 0x01;
/// 控制器模式位图：支持子集匹配。
pub const MODE_SUBSET: u8 = 0x02;

/// off-host 执行环境的种类。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OffHostKind {
    /// 嵌入式安全元件，对外名称 `eSE<n>`。
    Ese,
    /// SIM 卡，对外名称 `SIM<n>`。
    Uicc,
}

impl OffHostKind {
    /// 对外名称前缀。
    pub fn name_prefix(self) -> &'static str {
        match self {
            OffHostKind::Ese => "eSE",
            OffHostKind::Uicc => "SIM",
        }
    }
}

/// NFC 控制器（device host）的能力查询与路由表操作。
///
/// # 教案式说明
/// - **意图 (Why)**：底层 NCI 驱动不在本子系统范围内，规划器只通过该 trait 与硬件交互；
/// - **契约 (What)**：
///   - 所有方法都不得 panic，失败以 `false`/`None` 表示；
///   - `default_route` 返回 `None` 表示控制器尚未就绪；
///   - `transmit` 把响应字节发回读卡器；
/// - **风险 (Trade-offs)**：实现可能在内部阻塞等待硬件应答，调用方不应在热路径上频繁调用查询接口，
///   [`ExecutionEnvironmentAdapter`] 因此缓存了能力信息。
pub trait DeviceHost: Send + Sync + 'static {
    /// 控制器默认路由；未就绪时返回 `None`。
    fn default_route(&self) -> Option<u8>;
    /// 控制器默认 off-host 路由。
    fn default_off_host_route(&self) -> Option<u8>;
    /// 支持的模式位图（[`MODE_PREFIX`] / [`MODE_SUBSET`]）。
    fn supported_pattern_modes(&self) -> u8;
    /// 路由表字节容量。
    fn routing_table_capacity(&self) -> usize;
    /// 某类 off-host 执行环境的路由编号，按对外编号顺序排列。
    fn off_host_routes(&self, kind: OffHostKind) -> Vec<u8>;
    /// 暂存一条路由条目。
    fn add_entry(&self, aid: &[u8], route: u8, pattern_type: u8) -> bool;
    /// 移除一条路由条目。
    fn remove_entry(&self, aid: &[u8]) -> bool;
    /// 清空暂存的路由表。
    fn clear(&self) -> bool;
    /// 提交暂存的路由表。
    fn commit(&self) -> bool;
    /// 向读卡器发送响应。
    fn transmit(&self, response: &[u8]) -> bool;
}

/// 控制器能力快照。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControllerProfile {
    /// 默认路由。
    pub default_route: u8,
    /// 默认 off-host 路由。
    pub default_off_host_route: u8,
    /// 模式位图。
    pub pattern_modes: u8,
    /// 路由表字节容量。
    pub capacity: usize,
    /// eSE 路由编号，下标 0 对应 `eSE1`。
    pub eses: Vec<u8>,
    /// SIM 路由编号，下标 0 对应 `SIM1`。
    pub uiccs: Vec<u8>,
}

impl ControllerProfile {
    /// 控制器是否支持某种匹配模式；精确匹配总是支持。
    pub fn supports(&self, mode: AidMode) -> bool {
        match mode {
            AidMode::Exact => true,
            AidMode::Prefix => self.pattern_modes & MODE_PREFIX != 0,
            AidMode::Subset => self.pattern_modes & MODE_SUBSET != 0,
        }
    }

    /// 把执行环境名称解析为路由编号；未知名称或编号越界返回 `None`。
    ///
    /// - `host`（大小写不敏感）→ [`HOST_ROUTE`]；
    /// - `eSE`/`SIM` 前缀大小写不敏感，裸名称等价于编号 1，编号从 1 开始。
    pub fn resolve(&self, name: &str) -> Option<u8> {
        let name = name.trim();
        if name.eq_ignore_ascii_case(ExecutionEnvironment::HOST) {
            return Some(HOST_ROUTE);
        }
        for kind in [OffHostKind::Ese, OffHostKind::Uicc] {
            let prefix = kind.name_prefix();
            let Some(head) = name.get(..prefix.len()) else {
                continue;
            };
            if !head.eq_ignore_ascii_case(prefix) {
                continue;
            }
            let suffix = &name[prefix.len()..];
            let index = if suffix.is_empty() {
                1
            } else if suffix.bytes().all(|byte| byte.is_ascii_digit()) {
                suffix.parse::<usize>().ok()?
            } else {
                return None;
            };
            let routes = match kind {
                OffHostKind::Ese => &self.eses,
                OffHostKind::Uicc => &self.uiccs,
            };
            return index.checked_sub(1).and_then(|i| routes.get(i)).copied();
        }
        None
    }

    fn names(kind: OffHostKind, count: usize) -> impl Iterator<Item = String> {
        (1..=count).map(move |n| format!("{}{n}", kind.name_prefix()))
    }
}

/// 执行环境适配器。
///
/// # 教案式说明
/// - **意图 (Why)**：集中处理“名称 → 路由编号”的解析与能力缓存，规划器与策略只面对字符串名称；
/// - **契约 (What)**：`profile` 惰性初始化且幂等；所有查询都以 `Result` 报告未就绪；
/// - **执行 (How)**：`parking_lot::Mutex<Option<Arc<ControllerProfile>>>` 保存缓存，
///   初始化失败不写缓存；
/// - **风险 (Trade-offs)**：缓存不会感知控制器热插拔 SIM，需要时重建适配器。
pub struct ExecutionEnvironmentAdapter {
    host: Arc<dyn DeviceHost>,
    profile: Mutex<Option<Arc<ControllerProfile>>>,
}

impl ExecutionEnvironmentAdapter {
    /// 以控制器句柄构造适配器，不触发任何硬件查询。
    pub fn new(host: Arc<dyn DeviceHost>) -> Self {
        Self {
            host,
            profile: Mutex::new(None),
        }
    }

    /// 底层控制器句柄。
    pub fn device_host(&self) -> &Arc<dyn DeviceHost> {
        &self.host
    }

    /// 控制器能力快照，首次调用时向控制器查询。
    pub fn profile(&self) -> Result<Arc<ControllerProfile>, HceError> {
        let mut cached = self.profile.lock();
        if let Some(profile) = cached.as_ref() {
            return Ok(Arc::clone(profile));
        }

        let default_route = self.host.default_route().ok_or_else(|| HceError::AdapterNotReady {
            detail: "controller did not report a default route".to_owned(),
        })?;
        let profile = Arc::new(ControllerProfile {
            default_route,
            default_off_host_route: self.host.default_off_host_route().unwrap_or(default_route),
            pattern_modes: self.host.supported_pattern_modes(),
            capacity: self.host.routing_table_capacity(),
            eses: self.host.off_host_routes(OffHostKind::Ese),
            uiccs: self.host.off_host_routes(OffHostKind::Uicc),
        });
        debug!(
            default_route = profile.default_route,
            modes = profile.pattern_modes,
            capacity = profile.capacity,
            eses = profile.eses.len(),
            uiccs = profile.uiccs.len(),
            "controller profile cached"
        );
        *cached = Some(Arc::clone(&profile));
        Ok(profile)
    }

    /// 控制器默认路由。
    pub fn default_route(&self) -> Result<u8, HceError> {
        Ok(self.profile()?.default_route)
    }

    /// 控制器默认 off-host 路由。
    pub fn default_off_host_route(&self) -> Result<u8, HceError> {
        Ok(self.profile()?.default_off_host_route)
    }

    /// 模式位图。
    pub fn aid_routing_mode(&self) -> Result<u8, HceError> {
        Ok(self.profile()?.pattern_modes)
    }

    /// 路由表字节容量。
    pub fn capacity(&self) -> Result<usize, HceError> {
        Ok(self.profile()?.capacity)
    }

    /// 名称解析为路由编号，无法解析时返回 `fallback`。
    pub fn location_to_route(&self, name: &str, fallback: u8) -> Result<u8, HceError> {
        Ok(self.profile()?.resolve(name).unwrap_or(fallback))
    }

    /// 名称是否能被控制器寻址；未就绪时视为不支持。
    pub fn is_supported(&self, name: &str) -> bool {
        !name.trim().is_empty()
            && self
                .profile()
                .is_ok_and(|profile| profile.resolve(name).is_some())
    }

    /// 名称是否解析到控制器默认路由；无法解析的名称按默认路由处理。
    pub fn is_default_route(&self, name: &str) -> Result<bool, HceError> {
        let profile = self.profile()?;
        let route = profile.resolve(name).unwrap_or(profile.default_route);
        Ok(route == profile.default_route)
    }

    /// 可寻址的 eSE 名称：`eSE1..n`。
    pub fn supported_eses(&self) -> Result<Vec<String>, HceError> {
        let profile = self.profile()?;
        Ok(ControllerProfile::names(OffHostKind::Ese, profile.eses.len()).collect())
    }

    /// 可寻址的 SIM 名称：`SIM1..n`。
    pub fn supported_uiccs(&self) -> Result<Vec<String>, HceError> {
        let profile = self.profile()?;
        Ok(ControllerProfile::names(OffHostKind::Uicc, profile.uiccs.len()).collect())
    }

    /// 全部可寻址位置：`host`、各 SIM、各 eSE。
    pub fn supported_locations(&self) -> Result<Vec<String>, HceError> {
        let mut locations = vec![ExecutionEnvironment::HOST.to_owned()];
        locations.extend(self.supported_uiccs()?);
        locations.extend(self.supported_eses()?);
        Ok(locations)
    }

    /// 暂存一条路由条目；非空 AID 的长度必须在 `[5, 16]` 内。
    pub fn add_entry(&self, aid: &[u8], route: u8, mode: AidMode) -> Result<(), HceError> {
        if !aid.is_empty() && !(MIN_AID_BYTES..=MAX_AID_BYTES).contains(&aid.len()) {
            return Err(HceError::IllegalAidLength { len: aid.len() });
        }
        self.profile()?;
        if self.host.add_entry(aid, route, mode.route_bits()) {
            Ok(())
        } else {
            warn!(aid_len = aid.len(), route, "controller rejected routing entry");
            Err(HceError::ControllerRejected {
                operation: "add_entry".to_owned(),
            })
        }
    }

    /// 移除一条路由条目。
    pub fn remove_entry(&self, aid: &[u8]) -> Result<(), HceError> {
        self.profile()?;
        if self.host.remove_entry(aid) {
            Ok(())
        } else {
            Err(HceError::ControllerRejected {
                operation: "remove_entry".to_owned(),
            })
        }
    }

    /// 清空暂存的路由表。
    pub fn clear(&self) -> Result<(), HceError> {
        self.profile()?;
        if self.host.clear() {
            Ok(())
        } else {
            Err(HceError::ControllerRejected {
                operation: "clear".to_owned(),
            })
        }
    }

    /// 提交暂存的路由表。
    pub fn commit(&self) -> Result<(), HceError> {
        self.profile()?;
        if self.host.commit() {
            Ok(())
        } else {
            Err(HceError::ControllerRejected {
                operation: "commit".to_owned(),
            })
        }
    }
}
