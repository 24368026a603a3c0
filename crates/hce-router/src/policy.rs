//! # 路由策略
//!
//! ## 核心意图（Why）
//! - 从全部已注册服务中挑出一组“可以同时写进控制器路由表”的模式集合，并给出确定的优先顺序；
//! - 策略以 trait 暴露，生产实现为 [`TagPriorityPolicy`]，测试可替换为任意固定计划。
//!
//! ## 过滤链（What）
//! 候选集合依次经过四个过滤器，全部通过才会被接纳：
//! 1. [`LocationFilter`]：集合的执行环境必须是控制器可寻址的位置；
//! 2. [`ModeFilter`]：集合内每个模式都必须是控制器支持的匹配模式；
//! 3. [`CategoryFilter`]：优先类别的集合至多接纳一个；
//! 4. [`ConflictFilter`]：与已接纳集合冲突时拒绝，下列情形除外：
//!    已接纳集合属于 primary 服务、候选集合属于优先类别、双方都位于容忍冲突的执行环境（通常为 host）。
//!
//! ## 遍历顺序（How）
//! primary → preferred（与 primary 不同时）→ 其余服务按注册顺序；单个服务内部优先类别的集合排在最前。

use std::sync::Arc;

use hce_core::aid::AidPatternSet;
use hce_core::{Category, ExecutionEnvironment, HceConfig, Service};
use tracing::{debug, warn};

use crate::ee::{ControllerProfile, ExecutionEnvironmentAdapter};

/// 路由策略：给出经过过滤且有序的模式集合计划。
pub trait RoutingPolicy: Send + Sync {
    /// 生成计划；顺序即优先级，越靠前越优先。
    fn plan(
        &self,
        services: &[Arc<Service>],
        primary: Option<&Arc<Service>>,
        preferred: Option<&Arc<Service>>,
    ) -> Vec<Arc<AidPatternSet>>;
}

/// 单次规划中过滤器可见的上下文。
#[derive(Clone, Copy)]
pub struct FilterContext<'a> {
    /// 已接纳的集合，按接纳顺序排列。
    pub admitted: &'a [Arc<AidPatternSet>],
    /// 本次规划的 primary 服务。
    pub primary: Option<&'a Arc<Service>>,
}

/// 过滤链中的一环。
pub trait RoutingFilter: Send + Sync {
    /// 过滤器名称，用于日志。
    fn name(&self) -> &'static str;

    /// 候选集合能否被接纳。
    fn allow(&self, candidate: &AidPatternSet, context: FilterContext<'_>) -> bool;
}

/// 执行环境过滤：可寻址位置中存在以集合执行环境开头的名称（大小写不敏感）。
///
/// 因此 `eSE` 能匹配 `eSE1`；所属服务已注销的集合一律拒绝。
#[derive(Clone, Debug)]
pub struct LocationFilter {
    supported: Vec<String>,
}

impl LocationFilter {
    /// 以可寻址位置列表构造。
    pub fn new(supported: Vec<String>) -> Self {
        Self {
            supported: supported
                .into_iter()
                .map(|location| location.to_ascii_lowercase())
                .collect(),
        }
    }
}

impl RoutingFilter for LocationFilter {
    fn name(&self) -> &'static str {
        "location"
    }

    fn allow(&self, candidate: &AidPatternSet, _context: FilterContext<'_>) -> bool {
        let Some(environment) = candidate.execution_environment() else {
            return false;
        };
        let wanted = environment.as_str().to_ascii_lowercase();
        self.supported
            .iter()
            .any(|location| location.starts_with(&wanted))
    }
}

/// 匹配模式过滤。
#[derive(Clone, Debug)]
pub struct ModeFilter {
    profile: Arc<ControllerProfile>,
}

impl ModeFilter {
    /// 以控制器能力构造。
    pub fn new(profile: Arc<ControllerProfile>) -> Self {
        Self { profile }
    }
}

impl RoutingFilter for ModeFilter {
    fn name(&self) -> &'static str {
        "mode"
    }

    fn allow(&self, candidate: &AidPatternSet, _context: FilterContext<'_>) -> bool {
        candidate
            .iter()
            .all(|pattern| self.profile.supports(pattern.mode()))
    }
}

/// 优先类别唯一性过滤。
#[derive(Clone, Copy, Debug)]
pub struct CategoryFilter {
    priority: Category,
}

impl CategoryFilter {
    /// 以优先类别构造。
    pub fn new(priority: Category) -> Self {
        Self { priority }
    }
}

impl RoutingFilter for CategoryFilter {
    fn name(&self) -> &'static str {
        "category"
    }

    fn allow(&self, candidate: &AidPatternSet, context: FilterContext<'_>) -> bool {
        candidate.category() != self.priority
            || !context
                .admitted
                .iter()
                .any(|set| set.category() == self.priority)
    }
}

/// 两两冲突过滤。
///
/// # 教案式说明
/// - **契约 (What)**：候选集合与每个冲突的已接纳集合 `r` 之间，至少满足一条容忍条件：
///   - `r` 属于 primary 服务；
///   - 候选集合属于优先类别；
///   - 候选集合自身的执行环境在容忍列表中（与 `r` 位于何处无关）；
/// - **风险 (Trade-offs)**：容忍列表只应包含由控制器自身优先级裁决重叠的位置。
#[derive(Clone, Debug)]
pub struct ConflictFilter {
    priority: Category,
    tolerant: Vec<ExecutionEnvironment>,
}

impl ConflictFilter {
    /// 以优先类别与容忍冲突的执行环境构造。
    pub fn new(priority: Category, tolerant: Vec<ExecutionEnvironment>) -> Self {
        Self { priority, tolerant }
    }

    fn is_tolerant(&self, environment: Option<ExecutionEnvironment>) -> bool {
        environment.is_some_and(|environment| {
            self.tolerant
                .iter()
                .any(|tolerant| tolerant.as_str().eq_ignore_ascii_case(environment.as_str()))
        })
    }
}

impl RoutingFilter for ConflictFilter {
    fn name(&self) -> &'static str {
        "conflict"
    }

    fn allow(&self, candidate: &AidPatternSet, context: FilterContext<'_>) -> bool {
        if candidate.category() == self.priority
            || self.is_tolerant(candidate.execution_environment())
        {
            return true;
        }
        context
            .admitted
            .iter()
            .filter(|admitted| admitted.conflicts_with(candidate))
            .all(|admitted| {
                context
                    .primary
                    .is_some_and(|primary| admitted.belongs_to(primary))
            })
    }
}

/// 按类别优先级排序的生产策略。
///
/// # 教案式说明
/// - **意图 (Why)**：支付类（优先类别）AID 由 primary 服务独占，前台 preferred 服务次之；
/// - **契约 (What)**：
///   - 每次 `plan` 都依据适配器缓存的能力重新构造过滤链；
///   - 适配器未就绪时返回空计划并告警，规划器会在此之前就以 `AdapterNotReady` 失败；
///   - 输出确定：相同输入总是得到相同顺序；
/// - **执行 (How)**：逐服务、逐集合地把候选交给过滤链，通过者追加到结果末尾。
pub struct TagPriorityPolicy {
    adapter: Arc<ExecutionEnvironmentAdapter>,
    priority: Category,
    tolerant: Vec<ExecutionEnvironment>,
}

impl TagPriorityPolicy {
    /// 构造策略。
    pub fn new(
        adapter: Arc<ExecutionEnvironmentAdapter>,
        priority: Category,
        tolerant: Vec<ExecutionEnvironment>,
    ) -> Self {
        Self {
            adapter,
            priority,
            tolerant,
        }
    }

    /// 依据配置构造策略。
    pub fn from_config(adapter: Arc<ExecutionEnvironmentAdapter>, config: &HceConfig) -> Self {
        Self::new(
            adapter,
            config.priority_category,
            config.tolerant_environments(),
        )
    }

    /// 优先类别。
    pub fn priority(&self) -> Category {
        self.priority
    }

    fn filters(&self) -> Option<Vec<Box<dyn RoutingFilter>>> {
        let profile = self.adapter.profile().ok()?;
        let locations = self.adapter.supported_locations().ok()?;
        Some(vec![
            Box::new(LocationFilter::new(locations)) as Box<dyn RoutingFilter>,
            Box::new(ModeFilter::new(profile)),
            Box::new(CategoryFilter::new(self.priority)),
            Box::new(ConflictFilter::new(self.priority, self.tolerant.clone())),
        ])
    }
}

impl RoutingPolicy for TagPriorityPolicy {
    fn plan(
        &self,
        services: &[Arc<Service>],
        primary: Option<&Arc<Service>>,
        preferred: Option<&Arc<Service>>,
    ) -> Vec<Arc<AidPatternSet>> {
        let Some(filters) = self.filters() else {
            warn!("controller not ready, routing plan is empty");
            return Vec::new();
        };

        let preferred = preferred.filter(|preferred| {
            primary.is_none_or(|primary| !Arc::ptr_eq(primary, preferred))
        });
        let is_named = |service: &Arc<Service>| {
            primary.is_some_and(|primary| Arc::ptr_eq(primary, service))
                || preferred.is_some_and(|preferred| Arc::ptr_eq(preferred, service))
        };
        let ordered = primary
            .into_iter()
            .chain(preferred)
            .chain(services.iter().filter(|&service| !is_named(service)));

        let mut admitted: Vec<Arc<AidPatternSet>> = Vec::new();
        for service in ordered {
            for set in service.merged_sets(self.priority) {
                let context = FilterContext {
                    admitted: &admitted,
                    primary,
                };
                match filters.iter().find(|filter| !filter.allow(&set, context)) {
                    Some(filter) => debug!(
                        service = %service.id(),
                        category = %set.category(),
                        filter = filter.name(),
                        "pattern set rejected"
                    ),
                    None => admitted.push(set),
                }
            }
        }
        admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDeviceHost;
    use hce_core::ServiceId;

    fn service(name: &str, environment: &str, sets: &[(Category, &[&str])]) -> Arc<Service> {
        let id = ServiceId::new("com.example", name).expect("身份合法");
        let mut builder =
            Service::builder(id).environment(ExecutionEnvironment::new(environment));
        for (category, aids) in sets {
            builder = builder.static_set(
                AidPatternSet::from_literals(*category, aids.iter()).expect("集合合法"),
            );
        }
        builder.build()
    }

    fn policy(host: Arc<InMemoryDeviceHost>) -> TagPriorityPolicy {
        let adapter = Arc::new(ExecutionEnvironmentAdapter::new(host));
        TagPriorityPolicy::from_config(adapter, &HceConfig::default())
    }

    fn owners(plan: &[Arc<AidPatternSet>]) -> Vec<String> {
        plan.iter()
            .map(|set| {
                set.owner()
                    .map(|owner| format!("{}:{}", owner.id().ability(), set.category()))
                    .unwrap_or_default()
            })
            .collect()
    }

    #[test]
    fn primary_then_preferred_then_registration_order() {
        let policy = policy(InMemoryDeviceHost::builder().build());
        let a = service("A", "host", &[(Category::Normal, &["A000000001"])]);
        let b = service("B", "host", &[(Category::Normal, &["A000000002"])]);
        let c = service(
            "C",
            "host",
            &[
                (Category::Normal, &["A000000003"]),
                (Category::Secure, &["F000000003"]),
            ],
        );
        let services = [Arc::clone(&a), Arc::clone(&b), Arc::clone(&c)];

        let plan = policy.plan(&services, Some(&c), Some(&b));
        assert_eq!(owners(&plan), vec!["C:secure", "C:normal", "B:normal", "A:normal"]);

        let plan = policy.plan(&services, Some(&b), Some(&b));
        assert_eq!(owners(&plan), vec!["B:normal", "A:normal", "C:secure", "C:normal"]);
    }

    #[test]
    fn only_one_priority_set_is_admitted() {
        let policy = policy(InMemoryDeviceHost::builder().build());
        let a = service("A", "host", &[(Category::Secure, &["F000000001"])]);
        let b = service("B", "host", &[(Category::Secure, &["F000000002"])]);
        let plan = policy.plan(&[Arc::clone(&a), Arc::clone(&b)], None, None);
        assert_eq!(owners(&plan), vec!["A:secure"]);
    }

    #[test]
    fn unsupported_locations_and_modes_are_filtered() {
        let host = InMemoryDeviceHost::builder().pattern_modes(0x01).eses([0x86]).build();
        let policy = policy(host);
        let on_sim = service("Sim", "SIM1", &[(Category::Normal, &["A000000001"])]);
        let on_ese = service("Ese", "eSE", &[(Category::Normal, &["A000000002"])]);
        let subset = service("Subset", "host", &[(Category::Normal, &["A000000003#"])]);
        let prefix = service("Prefix", "host", &[(Category::Normal, &["A000000004*"])]);
        let plan = policy.plan(&[on_sim, on_ese, subset, prefix], None, None);
        assert_eq!(owners(&plan), vec!["Ese:normal", "Prefix:normal"]);
    }

    #[test]
    fn conflicts_tolerated_only_by_documented_rules() {
        let host = InMemoryDeviceHost::builder().eses([0x86, 0x87]).build();
        let policy = policy(host);

        let primary = service("Primary", "eSE1", &[(Category::Normal, &["A000000003*"])]);
        let ese = service("Ese", "eSE2", &[(Category::Normal, &["A0000000031010"])]);
        let ese_late = service("EseLate", "eSE2", &[(Category::Normal, &["A00000000310*"])]);
        let host_a = service("HostA", "host", &[(Category::Normal, &["B000000003*"])]);
        let host_b = service("HostB", "host", &[(Category::Normal, &["B0000000031010"])]);
        let secure = service("Secure", "eSE2", &[(Category::Secure, &["B00000000310"])]);

        let plan = policy.plan(
            &[
                Arc::clone(&primary),
                Arc::clone(&ese),
                Arc::clone(&ese_late),
                Arc::clone(&host_a),
                Arc::clone(&host_b),
                Arc::clone(&secure),
            ],
            Some(&primary),
            None,
        );
        assert_eq!(
            owners(&plan),
            vec![
                "Primary:normal",
                "Ese:normal",
                "HostA:normal",
                "HostB:normal",
                "Secure:secure"
            ]
        );
    }

    #[test]
    fn host_candidate_tolerates_earlier_off_host_overlap() {
        let host = InMemoryDeviceHost::builder().eses([0x86]).build();
        let policy = policy(host);

        let ese = service("Ese", "eSE1", &[(Category::Normal, &["A000000003*"])]);
        let on_host = service("Host", "host", &[(Category::Normal, &["A0000000031010"])]);
        let ese_late = service("EseLate", "eSE1", &[(Category::Normal, &["A0000000031020"])]);

        let plan = policy.plan(
            &[Arc::clone(&ese), Arc::clone(&on_host), Arc::clone(&ese_late)],
            None,
            None,
        );
        assert_eq!(owners(&plan), vec!["Ese:normal", "Host:normal"]);
    }

    #[test]
    fn not_ready_controller_yields_empty_plan() {
        let policy = policy(InMemoryDeviceHost::builder().not_ready().build());
        let a = service("A", "host", &[(Category::Normal, &["A000000001"])]);
        assert!(policy.plan(&[a], None, None).is_empty());
    }
}
