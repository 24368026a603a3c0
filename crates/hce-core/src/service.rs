//! # 卡模拟服务实体
//!
//! ## 核心意图（Why）
//! - 描述路由规划与协议分发所需的服务字段：身份、执行环境、静态/动态模式集合与通道句柄；
//! - 服务的持久化与安装信息属于外部注册中心，本模块只关心“它声明了哪些 AID、跑在哪里、怎么联系它”。
//!
//! ## 合并规则（What）
//! - 同一类别若同时存在静态与动态集合，动态集合整体覆盖静态集合，绝不逐元素合并；
//! - 执行环境缺省为 `host`；声明在 host 上的服务不允许迁移到其他执行环境，反之亦然。
//!
//! ## 并发约束（How）
//! - 服务以 `Arc<Service>` 共享，可变字段（执行环境、动态集合、通道）各自由 `parking_lot::RwLock` 保护，
//!   读多写少；模式集合以 `Arc<AidPatternSet>` 发布，路由快照持有的旧集合在替换后自然释放。

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::aid::AidPatternSet;
use crate::channel::{ApduChannel, ChannelId};
use crate::error::HceError;

/// 模式集合类别。
///
/// # 教案式说明
/// - **意图 (Why)**：`secure` 类别承载支付等安全敏感 AID，由系统默认（primary）服务独占；
///   `normal` 类别允许前台应用通过 preferred 覆盖；
/// - **契约 (What)**：文本形式为小写 `normal`/`secure`，解析大小写不敏感；
/// - **风险 (Trade-offs)**：枚举是封闭的，注册接口收到其他文本时返回 [`HceError::InvalidCategory`]，
///   JSON 文档则宽松地映射为 `normal`。
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// 普通类别。
    #[default]
    Normal,
    /// 安全类别。
    Secure,
}

impl Category {
    /// 小写文本形式。
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Normal => "normal",
            Category::Secure => "secure",
        }
    }

    /// 严格解析，未知文本返回 [`HceError::InvalidCategory`]。
    pub fn parse(text: &str) -> Result<Self, HceError> {
        if text.eq_ignore_ascii_case("normal") {
            Ok(Category::Normal)
        } else if text.eq_ignore_ascii_case("secure") {
            Ok(Category::Secure)
        } else {
            Err(HceError::InvalidCategory {
                category: text.to_owned(),
            })
        }
    }

    /// 宽松解析，未知文本视为 `normal`。
    pub fn parse_lenient(text: &str) -> Self {
        Self::parse(text).unwrap_or(Category::Normal)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = HceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::parse(s)
    }
}

/// 服务身份：`(bundle, ability)` 二元组，文本形式为 `bundle/ability`。
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ServiceId {
    bundle: Arc<str>,
    ability: Arc<str>,
}

impl ServiceId {
    /// 构造服务身份，任一分量为空时返回 [`HceError::InvalidIdentity`]。
    pub fn new(bundle: impl AsRef<str>, ability: impl AsRef<str>) -> Result<Self, HceError> {
        let (bundle, ability) = (bundle.as_ref().trim(), ability.as_ref().trim());
        if bundle.is_empty() || ability.is_empty() {
            return Err(HceError::InvalidIdentity {
                detail: format!("bundle `{bundle}` / ability `{ability}` must both be non-empty"),
            });
        }
        Ok(Self {
            bundle: Arc::from(bundle),
            ability: Arc::from(ability),
        })
    }

    /// 包名。
    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    /// 能力名。
    pub fn ability(&self) -> &str {
        &self.ability
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bundle, self.ability)
    }
}

impl FromStr for ServiceId {
    type Err = HceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bundle, ability) = s.split_once('/').ok_or_else(|| HceError::InvalidIdentity {
            detail: format!("`{s}` is not of the form bundle/ability"),
        })?;
        ServiceId::new(bundle, ability)
    }
}

/// 执行环境名称：`host`、`eSE`/`eSE<n>`、`SIM`/`SIM<n>` 或控制器上报的其他名称。
///
/// - 空名称视为 `host`；
/// - 名称比较大小写不敏感的场景由调用方显式处理，本类型只保留原文。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ExecutionEnvironment(Arc<str>);

impl ExecutionEnvironment {
    /// 主机执行环境的名称。
    pub const HOST: &'static str = "host";

    /// 主机执行环境。
    pub fn host() -> Self {
        Self(Arc::from(Self::HOST))
    }

    /// 按名称构造，空白名称视为 host。
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref().trim();
        if name.is_empty() {
            Self::host()
        } else {
            Self(Arc::from(name))
        }
    }

    /// 名称文本。
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 是否为主机执行环境（大小写不敏感）。
    pub fn is_host(&self) -> bool {
        self.0.eq_ignore_ascii_case(Self::HOST)
    }
}

impl Default for ExecutionEnvironment {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for ExecutionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 已注册的卡模拟服务。
///
/// # 教案式说明
/// - **意图 (Why)**：路由策略需要遍历服务的合并集合，协议状态机需要服务的通道句柄；
/// - **契约 (What)**：
///   - 只能经 [`ServiceBuilder::build`] 构造为 `Arc<Service>`，静态集合的 `owner` 在构造时回填；
///   - 动态集合通过 [`Service::set_dynamic`] 写入，同类别覆盖旧值；
///   - 通道句柄可随时绑定/清除，死亡通知只清除 id 匹配的那个通道；
/// - **风险 (Trade-offs)**：服务之间没有锁顺序，调用方不应在持有一个服务的写锁时访问另一个服务。
pub struct Service {
    id: ServiceId,
    declared_environment: ExecutionEnvironment,
    environment: RwLock<ExecutionEnvironment>,
    static_sets: BTreeMap<Category, Arc<AidPatternSet>>,
    dynamic_sets: RwLock<BTreeMap<Category, Arc<AidPatternSet>>>,
    channel: RwLock<Option<Arc<dyn ApduChannel>>>,
}

impl Service {
    /// 开始构造服务。
    pub fn builder(id: ServiceId) -> ServiceBuilder {
        ServiceBuilder::new(id)
    }

    /// 服务身份。
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// 当前执行环境（可能已被标记为 off-host）。
    pub fn environment(&self) -> ExecutionEnvironment {
        self.environment.read().clone()
    }

    /// 注册时声明的执行环境。
    pub fn declared_environment(&self) -> &ExecutionEnvironment {
        &self.declared_environment
    }

    /// 写入动态集合，返回被覆盖的旧集合。
    pub fn set_dynamic(self: &Arc<Self>, mut set: AidPatternSet) -> Option<Arc<AidPatternSet>> {
        set.set_owner(Arc::downgrade(self));
        let category = set.category();
        self.dynamic_sets.write().insert(category, Arc::new(set))
    }

    /// 移除某类别的动态集合；静态集合不受影响。
    pub fn remove_dynamic(&self, category: Category) -> Option<Arc<AidPatternSet>> {
        self.dynamic_sets.write().remove(&category)
    }

    /// 某类别的生效集合：动态优先，否则静态。
    pub fn set_for(&self, category: Category) -> Option<Arc<AidPatternSet>> {
        self.dynamic_sets
            .read()
            .get(&category)
            .or_else(|| self.static_sets.get(&category))
            .cloned()
    }

    /// 是否存在某类别的生效集合。
    pub fn has_category(&self, category: Category) -> bool {
        self.set_for(category).is_some()
    }

    /// 合并后的全部生效集合，`priority` 类别排在最前，其余按类别名排序。
    pub fn merged_sets(&self, priority: Category) -> Vec<Arc<AidPatternSet>> {
        let mut merged = self.static_sets.clone();
        for (category, set) in self.dynamic_sets.read().iter() {
            merged.insert(*category, Arc::clone(set));
        }
        let mut sets: Vec<_> = merged.into_values().collect();
        sets.sort_by_key(|set| (set.category() != priority, set.category().as_str()));
        sets
    }

    /// 将服务标记到 off-host 执行环境。
    ///
    /// - 当前处于 host 的服务不可迁移，也不允许把任何服务标记回 host，二者都返回
    ///   [`HceError::HostModificationNotAllowed`]；
    /// - 执行环境名称是否被控制器支持由注册中心在调用前校验。
    pub fn mark_off_host(&self, environment: ExecutionEnvironment) -> Result<(), HceError> {
        let mut current = self.environment.write();
        if current.is_host() || environment.is_host() {
            return Err(HceError::HostModificationNotAllowed {
                service: self.id.to_string(),
            });
        }
        *current = environment;
        Ok(())
    }

    /// 恢复为声明时的执行环境。
    pub fn unmark_off_host(&self) -> Result<(), HceError> {
        let mut current = self.environment.write();
        if current.is_host() {
            return Err(HceError::HostModificationNotAllowed {
                service: self.id.to_string(),
            });
        }
        *current = self.declared_environment.clone();
        Ok(())
    }

    /// 服务主动注册的 APDU 通道。
    pub fn channel(&self) -> Option<Arc<dyn ApduChannel>> {
        self.channel.read().clone()
    }

    /// 绑定通道，返回被替换的旧通道。
    pub fn bind_channel(&self, channel: Arc<dyn ApduChannel>) -> Option<Arc<dyn ApduChannel>> {
        self.channel.write().replace(channel)
    }

    /// 若当前通道的 id 为 `id` 则清除它。
    pub fn clear_channel(&self, id: ChannelId) -> bool {
        let mut slot = self.channel.write();
        if slot.as_ref().is_some_and(|channel| channel.id() == id) {
            *slot = None;
            return true;
        }
        false
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("environment", &self.environment())
            .field("sets", &self.merged_sets(Category::Secure))
            .field("channel", &self.channel().map(|channel| channel.id()))
            .finish()
    }
}

/// [`Service`] 的构造器。
#[derive(Debug)]
pub struct ServiceBuilder {
    id: ServiceId,
    environment: ExecutionEnvironment,
    static_sets: Vec<AidPatternSet>,
}

impl ServiceBuilder {
    /// 以服务身份开始构造，执行环境缺省为 host。
    pub fn new(id: ServiceId) -> Self {
        Self {
            id,
            environment: ExecutionEnvironment::host(),
            static_sets: Vec::new(),
        }
    }

    /// 声明执行环境。
    pub fn environment(mut self, environment: ExecutionEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// 追加一个静态集合；空集合被忽略，同类别以后者为准。
    pub fn static_set(mut self, set: AidPatternSet) -> Self {
        if !set.is_empty() {
            self.static_sets.push(set);
        }
        self
    }

    /// 完成构造，静态集合的 `owner` 指向新服务。
    pub fn build(self) -> Arc<Service> {
        let ServiceBuilder {
            id,
            environment,
            static_sets,
        } = self;
        Arc::new_cyclic(|owner: &Weak<Service>| {
            let static_sets = static_sets
                .into_iter()
                .map(|mut set| {
                    set.set_owner(owner.clone());
                    (set.category(), Arc::new(set))
                })
                .collect();
            Service {
                id,
                declared_environment: environment.clone(),
                environment: RwLock::new(environment),
                static_sets,
                dynamic_sets: RwLock::new(BTreeMap::new()),
                channel: RwLock::new(None),
            }
        })
    }
}
