//! # 服务注册中心
//!
//! ## 核心意图（Why）
//! - 对外暴露注册与查询接口：注册/注销服务、增删动态模式集合、设置 primary/preferred、
//!   标记 off-host、登记与清理通道，以及“某服务是否是某 AID 的默认处理者”一类查询；
//! - 任何改变路由结果的调用都在返回前同步重建路由表。
//!
//! ## 契约（What）
//! - 注册状态先落地，再重建；重建失败（`CommitFailed`、`AdapterNotReady`、`InsufficientCapacity` 等）
//!   作为返回值交给调用方，已记录的状态不回滚；
//! - 参数校验失败（服务不存在、类别非法、AID 非法、执行环境不可寻址）时状态不变，也不重建。
//!
//! ## 并发（How）
//! - 注册状态由一把 `parking_lot::Mutex` 保护，重建在持锁期间进行，锁顺序固定为“注册中心 → 规划器”。

use core::fmt;
use std::sync::Arc;

use hce_core::aid::AidPatternSet;
use hce_core::{
    ApduChannel, Category, ChannelId, ExecutionEnvironment, HceConfig, HceError, Service,
    ServiceId,
};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::ee::ExecutionEnvironmentAdapter;
use crate::planner::{ApplyReport, RouteMatch, RoutingTablePlanner};
use crate::policy::TagPriorityPolicy;

#[derive(Default)]
struct RegistryState {
    services: Vec<Arc<Service>>,
    primary: Option<Arc<Service>>,
    preferred: Option<Arc<Service>>,
}

impl RegistryState {
    fn find(&self, id: &ServiceId) -> Result<&Arc<Service>, HceError> {
        self.services
            .iter()
            .find(|service| service.id() == id)
            .ok_or_else(|| HceError::NoSuchService {
                service: id.to_string(),
            })
    }
}

/// 卡模拟服务注册中心。
///
/// # 教案式说明
/// - **意图 (Why)**：把“谁注册了什么”与“路由表长什么样”绑定在一起，调用方无需关心重建时机；
/// - **契约 (What)**：
///   - 服务身份唯一，重复注册返回 [`HceError::ServiceAlreadyRegistered`]；
///   - 注销 primary/preferred 服务时同时清除对应角色；
///   - `set_preferred` 拒绝持有优先类别集合的服务，也拒绝与 primary 优先类别集合冲突的服务；
/// - **执行 (How)**：所有变更走 `mutate`：持锁修改状态，随后调用规划器重建；
/// - **风险 (Trade-offs)**：重建在锁内执行，注册接口的延迟包含一次硬件提交。
pub struct ServiceRegistry {
    planner: Arc<RoutingTablePlanner>,
    priority: Category,
    state: Mutex<RegistryState>,
}

impl ServiceRegistry {
    /// 以现成的规划器构造。
    pub fn new(planner: Arc<RoutingTablePlanner>, priority: Category) -> Self {
        Self {
            planner,
            priority,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// 依据配置组装适配器、策略与规划器。
    pub fn from_config(adapter: Arc<ExecutionEnvironmentAdapter>, config: &HceConfig) -> Self {
        let policy = TagPriorityPolicy::from_config(Arc::clone(&adapter), config);
        let planner = RoutingTablePlanner::with_header_cost(
            Box::new(policy),
            adapter,
            config.header_cost,
        );
        Self::new(Arc::new(planner), config.priority_category)
    }

    /// 关联的规划器。
    pub fn planner(&self) -> &Arc<RoutingTablePlanner> {
        &self.planner
    }

    /// 优先类别。
    pub fn priority(&self) -> Category {
        self.priority
    }

    /// 已注册服务，按注册顺序排列。
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.state.lock().services.clone()
    }

    /// 按身份取服务。
    pub fn service(&self, id: &ServiceId) -> Result<Arc<Service>, HceError> {
        self.state.lock().find(id).cloned()
    }

    /// 当前 primary 服务。
    pub fn primary(&self) -> Option<ServiceId> {
        self.state.lock().primary.as_ref().map(|service| service.id().clone())
    }

    /// 当前 preferred 服务。
    pub fn preferred(&self) -> Option<ServiceId> {
        self.state
            .lock()
            .preferred
            .as_ref()
            .map(|service| service.id().clone())
    }

    /// 以当前状态重建路由表。
    pub fn replan(&self) -> Result<ApplyReport, HceError> {
        let state = self.state.lock();
        self.rebuild(&state)
    }

    fn rebuild(&self, state: &RegistryState) -> Result<ApplyReport, HceError> {
        self.planner
            .apply(&state.services, state.primary.as_ref(), state.preferred.as_ref())
            .inspect_err(|err| warn!(code = err.code(), error = %err, "routing rebuild failed"))
    }

    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut RegistryState) -> Result<T, HceError>,
    ) -> Result<T, HceError> {
        let mut state = self.state.lock();
        let value = change(&mut state)?;
        self.rebuild(&state)?;
        Ok(value)
    }

    /// 注册服务。
    pub fn register_service(&self, service: Arc<Service>) -> Result<(), HceError> {
        self.mutate(|state| {
            if state.find(service.id()).is_ok() {
                return Err(HceError::ServiceAlreadyRegistered {
                    service: service.id().to_string(),
                });
            }
            info!(service = %service.id(), environment = %service.environment(), "service registered");
            state.services.push(service);
            Ok(())
        })
    }

    /// 注销服务，返回被移除的服务。
    pub fn unregister_service(&self, id: &ServiceId) -> Result<Arc<Service>, HceError> {
        self.mutate(|state| {
            let position = state
                .services
                .iter()
                .position(|service| service.id() == id)
                .ok_or_else(|| HceError::NoSuchService {
                    service: id.to_string(),
                })?;
            let removed = state.services.remove(position);
            for role in [&mut state.primary, &mut state.preferred] {
                if role.as_ref().is_some_and(|service| Arc::ptr_eq(service, &removed)) {
                    *role = None;
                }
            }
            info!(service = %id, "service unregistered");
            Ok(removed)
        })
    }

    /// 为服务写入某类别的动态集合，覆盖同类别的旧集合。
    pub fn add_pattern_set<I, S>(
        &self,
        id: &ServiceId,
        category: &str,
        aids: I,
    ) -> Result<(), HceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let category = Category::parse(category)?;
        let set = AidPatternSet::from_literals(category, aids)?;
        self.mutate(|state| {
            let service = state.find(id)?;
            info!(service = %id, category = %category, aids = set.len(), "dynamic pattern set added");
            service.set_dynamic(set);
            Ok(())
        })
    }

    /// 移除服务某类别的动态集合，返回是否存在过。
    pub fn remove_pattern_set(&self, id: &ServiceId, category: &str) -> Result<bool, HceError> {
        let category = Category::parse(category)?;
        self.mutate(|state| Ok(state.find(id)?.remove_dynamic(category).is_some()))
    }

    /// 设置或清除 primary 服务。
    pub fn set_primary(&self, id: Option<&ServiceId>) -> Result<(), HceError> {
        self.mutate(|state| {
            let primary = id.map(|id| state.find(id).cloned()).transpose()?;
            state.primary = primary;
            info!(primary = ?id.map(ToString::to_string), "primary service changed");
            Ok(())
        })
    }

    /// 设置或清除 preferred 服务。
    pub fn set_preferred(&self, id: Option<&ServiceId>) -> Result<(), HceError> {
        self.mutate(|state| {
            let Some(id) = id else {
                state.preferred = None;
                return Ok(());
            };
            let service = Arc::clone(state.find(id)?);
            if service.has_category(self.priority) {
                return Err(HceError::ConflictsWithDefault {
                    service: id.to_string(),
                });
            }
            if let Some(default_set) = state
                .primary
                .as_ref()
                .and_then(|primary| primary.set_for(self.priority))
                && service
                    .merged_sets(self.priority)
                    .iter()
                    .any(|set| set.conflicts_with(&default_set))
            {
                return Err(HceError::ConflictsWithDefault {
                    service: id.to_string(),
                });
            }
            info!(preferred = %id, "preferred service changed");
            state.preferred = Some(service);
            Ok(())
        })
    }

    /// 把服务标记到可寻址的 off-host 执行环境。
    pub fn mark_off_host(&self, id: &ServiceId, environment: &str) -> Result<(), HceError> {
        let environment = ExecutionEnvironment::new(environment);
        if !environment.is_host() && !self.planner.adapter().is_supported(environment.as_str()) {
            return Err(HceError::InvalidExecutionEnvironment {
                name: environment.to_string(),
            });
        }
        self.mutate(|state| {
            state.find(id)?.mark_off_host(environment.clone())?;
            info!(service = %id, environment = %environment, "service marked off-host");
            Ok(())
        })
    }

    /// 恢复服务声明时的执行环境。
    pub fn unmark_off_host(&self, id: &ServiceId) -> Result<(), HceError> {
        self.mutate(|state| state.find(id)?.unmark_off_host())
    }

    /// 登记服务主动建立的通道，不触发重建。
    pub fn register_channel(
        &self,
        id: &ServiceId,
        channel: Arc<dyn ApduChannel>,
    ) -> Result<(), HceError> {
        let service = self.service(id)?;
        info!(service = %id, channel = %channel.id(), "channel registered");
        service.bind_channel(channel);
        Ok(())
    }

    /// 通道死亡：清除所有服务上 id 匹配的通道，返回受影响的服务数。
    pub fn on_channel_died(&self, channel: ChannelId) -> usize {
        let cleared = self
            .state
            .lock()
            .services
            .iter()
            .filter(|service| service.clear_channel(channel))
            .count();
        if cleared > 0 {
            info!(channel = %channel, cleared, "dead channel cleared");
        }
        cleared
    }

    /// 按 AID 文本查找，结果按计划优先级排列。
    pub fn lookup(&self, aid: &str) -> Result<Vec<RouteMatch>, HceError> {
        self.planner.lookup(aid)
    }

    /// 服务是否是该 AID 的首选处理者。
    pub fn is_default_service_for_aid(&self, id: &ServiceId, aid: &str) -> Result<bool, HceError> {
        Ok(self
            .lookup(aid)?
            .first()
            .is_some_and(|hit| hit.service.id() == id))
    }

    /// 服务是否是该类别的默认处理者：优先类别看 primary，其余类别看 preferred。
    pub fn is_default_service_for_category(&self, id: &ServiceId, category: Category) -> bool {
        let state = self.state.lock();
        let holder = if category == self.priority {
            state.primary.as_ref()
        } else {
            state.preferred.as_ref()
        };
        holder.is_some_and(|service| service.id() == id)
    }

    /// 服务在某类别下的生效 AID 文本。
    pub fn aids_for_service(&self, id: &ServiceId, category: Category) -> Result<Vec<String>, HceError> {
        Ok(self
            .service(id)?
            .set_for(category)
            .map(|set| set.literals())
            .unwrap_or_default())
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServiceRegistry")
            .field("priority", &self.priority)
            .field("services", &state.services.len())
            .field("primary", &state.primary.as_ref().map(|service| service.id()))
            .field("preferred", &state.preferred.as_ref().map(|service| service.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDeviceHost;
    use hce_core::testing::RecordingChannel;

    fn registry(host: &Arc<InMemoryDeviceHost>) -> ServiceRegistry {
        let adapter = Arc::new(ExecutionEnvironmentAdapter::new(Arc::clone(host) as _));
        ServiceRegistry::from_config(adapter, &HceConfig::default())
    }

    fn id(name: &str) -> ServiceId {
        ServiceId::new("com.example", name).expect("身份合法")
    }

    fn host_service(name: &str) -> Arc<Service> {
        Service::builder(id(name)).build()
    }

    #[test]
    fn every_mutation_replans() {
        let host = InMemoryDeviceHost::builder().default_route(0x81).uiccs([0x81]).build();
        let registry = registry(&host);
        registry.register_service(host_service("Pay")).expect("注册成功");
        assert_eq!(host.commits(), 1);

        registry
            .add_pattern_set(&id("Pay"), "secure", ["F0102030405060"])
            .expect("集合合法");
        assert_eq!(host.commits(), 2);
        assert_eq!(host.committed().len(), 2);

        assert!(registry.remove_pattern_set(&id("Pay"), "secure").expect("服务存在"));
        assert_eq!(host.committed().len(), 1);
        assert_eq!(registry.planner().revision(), 3);
    }

    #[test]
    fn invalid_input_changes_nothing() {
        let host = InMemoryDeviceHost::builder().build();
        let registry = registry(&host);
        registry.register_service(host_service("Pay")).expect("注册成功");

        let duplicate = registry.register_service(host_service("Pay")).expect_err("重复注册");
        assert_eq!(duplicate.code(), "hce.registry.duplicate_service");
        assert!(matches!(
            registry.add_pattern_set(&id("Pay"), "payment", ["F0102030405060"]),
            Err(HceError::InvalidCategory { .. })
        ));
        assert!(matches!(
            registry.add_pattern_set(&id("Ghost"), "normal", ["F0102030405060"]),
            Err(HceError::NoSuchService { .. })
        ));
        assert!(registry.add_pattern_set(&id("Pay"), "normal", ["F01"]).is_err());
        assert_eq!(host.commits(), 1);
    }

    #[test]
    fn preferred_may_not_shadow_default() {
        let host = InMemoryDeviceHost::builder().build();
        let registry = registry(&host);
        for name in ["Wallet", "Transit", "Loyalty"] {
            registry.register_service(host_service(name)).expect("注册成功");
        }
        registry
            .add_pattern_set(&id("Wallet"), "secure", ["A000000003*"])
            .expect("合法");
        registry
            .add_pattern_set(&id("Transit"), "normal", ["A0000000031010"])
            .expect("合法");
        registry
            .add_pattern_set(&id("Loyalty"), "normal", ["B000000003"])
            .expect("合法");
        registry.set_primary(Some(&id("Wallet"))).expect("存在");

        assert!(matches!(
            registry.set_preferred(Some(&id("Wallet"))),
            Err(HceError::ConflictsWithDefault { .. })
        ));
        assert!(matches!(
            registry.set_preferred(Some(&id("Transit"))),
            Err(HceError::ConflictsWithDefault { .. })
        ));
        registry.set_preferred(Some(&id("Loyalty"))).expect("不冲突");
        assert!(registry.is_default_service_for_category(&id("Loyalty"), Category::Normal));
        assert!(registry.is_default_service_for_category(&id("Wallet"), Category::Secure));

        registry.unregister_service(&id("Loyalty")).expect("存在");
        assert_eq!(registry.preferred(), None);
    }

    #[test]
    fn lookup_queries_follow_plan_order() {
        let host = InMemoryDeviceHost::builder().build();
        let registry = registry(&host);
        for name in ["Wallet", "Other"] {
            registry.register_service(host_service(name)).expect("注册成功");
        }
        registry
            .add_pattern_set(&id("Other"), "normal", ["A000000003*"])
            .expect("合法");
        registry
            .add_pattern_set(&id("Wallet"), "normal", ["A0000000031010"])
            .expect("合法");

        assert!(registry.is_default_service_for_aid(&id("Wallet"), "A0000000031010").expect("合法"));
        registry.set_primary(Some(&id("Other"))).expect("存在");
        assert!(registry.is_default_service_for_aid(&id("Other"), "A0000000031010").expect("合法"));
        assert_eq!(
            registry.aids_for_service(&id("Other"), Category::Normal).expect("存在"),
            vec!["A000000003*"]
        );
        assert!(registry.aids_for_service(&id("Other"), Category::Secure).expect("存在").is_empty());
    }

    #[test]
    fn off_host_marking_requires_supported_location() {
        let host = InMemoryDeviceHost::builder().eses([0x86]).uiccs([0x81]).build();
        let registry = registry(&host);
        let card = Service::builder(id("Card"))
            .environment(ExecutionEnvironment::new("SIM1"))
            .build();
        registry.register_service(card).expect("注册成功");

        assert!(matches!(
            registry.mark_off_host(&id("Card"), "eSE9"),
            Err(HceError::InvalidExecutionEnvironment { .. })
        ));
        registry.mark_off_host(&id("Card"), "eSE1").expect("可寻址");
        assert_eq!(registry.service(&id("Card")).expect("存在").environment().as_str(), "eSE1");
        registry.unmark_off_host(&id("Card")).expect("可恢复");
        assert_eq!(registry.service(&id("Card")).expect("存在").environment().as_str(), "SIM1");
    }

    #[test]
    fn channel_death_clears_bound_channels() {
        let host = InMemoryDeviceHost::builder().build();
        let registry = registry(&host);
        registry.register_service(host_service("Pay")).expect("注册成功");
        let channel = RecordingChannel::new(ChannelId::new(3));
        registry.register_channel(&id("Pay"), channel).expect("存在");
        assert!(registry.service(&id("Pay")).expect("存在").channel().is_some());

        assert_eq!(registry.on_channel_died(ChannelId::new(4)), 0);
        assert_eq!(registry.on_channel_died(ChannelId::new(3)), 1);
        assert!(registry.service(&id("Pay")).expect("存在").channel().is_none());
    }

    #[test]
    fn rebuild_failure_is_reported_after_state_change() {
        let host = InMemoryDeviceHost::builder().build();
        let registry = registry(&host);
        host.fail_commits(true);
        assert!(matches!(
            registry.register_service(host_service("Pay")),
            Err(HceError::CommitFailed { revision: 1 })
        ));
        assert_eq!(registry.services().len(), 1);
    }
}
