//! # 路由表规划器
//!
//! ## 核心意图（Why）
//! - 把策略给出的有序计划落地为控制器路由表，并同步发布供运行时查找的路由快照；
//! - 读路径（协议状态机每次 SELECT 都会查找）与写路径（注册变更触发重建）彻底分离。
//!
//! ## 契约（What）
//! - 单个模式集合要么全部写入，要么一条都不写入；
//! - 容量不足时按“host 是否为默认路由”决定后续集合的去留，详见 [`RoutingTablePlanner::apply`]；
//! - 查找总是看到某次完整重建的结果，绝不会看到半成品。
//!
//! ## 执行（How）
//! - 快照由 `ArcSwap<RoutingSnapshot>` 持有，重建完成后整体 `store`，读方 `load_full` 无锁读取；
//! - 重建过程由 `parking_lot::Mutex<()>` 串行化，世代号由 `AtomicU64` 单调递增。

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hce_core::aid::{AidMode, AidPattern, AidPatternSet};
use hce_core::config::DEFAULT_HEADER_COST;
use hce_core::{Category, ExecutionEnvironment, HceError, Service};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::ee::{ControllerProfile, ExecutionEnvironmentAdapter};
use crate::policy::RoutingPolicy;

/// 一次查找命中的服务与类别。
#[derive(Clone, Debug)]
pub struct RouteMatch {
    /// 命中集合所属的服务。
    pub service: Arc<Service>,
    /// 命中集合的类别。
    pub category: Category,
    /// 命中的集合本身。
    pub set: Arc<AidPatternSet>,
}

/// 一次重建的结果摘要。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ApplyReport {
    /// 新快照的世代号。
    pub revision: u64,
    /// 写入控制器的条目数，含默认兜底条目。
    pub programmed_entries: usize,
    /// 写入后剩余的字节容量。
    pub remaining_bytes: usize,
    /// 因容量不足或所属服务已注销而被丢弃的集合数。
    pub dropped_sets: usize,
}

/// 某次重建发布的路由快照。
///
/// # 教案式说明
/// - **意图 (Why)**：作为 `ArcSwap` 的载荷，只承载查找所需的最小数据集；
/// - **契约 (What)**：`sets` 保持计划顺序；`exact` 索引把精确模式的字节映射到集合下标，
///   前缀与子集模式所在集合记录在 `wildcard` 中，查找时两者合并后按下标升序输出；
/// - **风险 (Trade-offs)**：快照持有集合的强引用，服务注销后集合仍存活到下次重建，
///   但 `owner` 已失效，查找会跳过这类集合。
#[derive(Default)]
pub struct RoutingSnapshot {
    revision: u64,
    sets: Vec<Arc<AidPatternSet>>,
    exact: HashMap<Box<[u8]>, Vec<usize>>,
    wildcard: Vec<usize>,
}

impl RoutingSnapshot {
    fn build(revision: u64, sets: Vec<Arc<AidPatternSet>>) -> Self {
        let mut exact: HashMap<Box<[u8]>, Vec<usize>> = HashMap::new();
        let mut wildcard = Vec::new();
        for (index, set) in sets.iter().enumerate() {
            let mut has_wildcard = false;
            for pattern in set.iter() {
                match pattern.mode() {
                    AidMode::Exact => {
                        let slot = exact.entry(pattern.as_bytes().into()).or_default();
                        if slot.last() != Some(&index) {
                            slot.push(index);
                        }
                    }
                    AidMode::Prefix | AidMode::Subset => has_wildcard = true,
                }
            }
            if has_wildcard {
                wildcard.push(index);
            }
        }
        Self {
            revision,
            sets,
            exact,
            wildcard,
        }
    }

    /// 世代号；初始空快照为 0。
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// 已接纳的集合，按计划顺序排列。
    pub fn sets(&self) -> &[Arc<AidPatternSet>] {
        &self.sets
    }

    /// 查找覆盖 `aid` 的全部集合，按计划顺序输出。
    pub fn lookup(&self, aid: &AidPattern) -> Vec<RouteMatch> {
        let mut candidates: Vec<usize> = self
            .exact
            .get(aid.as_bytes())
            .into_iter()
            .flatten()
            .copied()
            .chain(self.wildcard.iter().copied())
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        candidates
            .into_iter()
            .filter_map(|index| {
                let set = &self.sets[index];
                if !set.matches(aid) {
                    return None;
                }
                let service = set.owner()?;
                Some(RouteMatch {
                    service,
                    category: set.category(),
                    set: Arc::clone(set),
                })
            })
            .collect()
    }

    /// 诊断输出：每行一个集合。
    pub fn describe(&self) -> String {
        let mut out = format!("routing snapshot r{} ({} sets)\n", self.revision, self.sets.len());
        for (index, set) in self.sets.iter().enumerate() {
            let owner = set
                .owner()
                .map(|service| service.id().to_string())
                .unwrap_or_else(|| "<gone>".to_owned());
            let environment = set
                .execution_environment()
                .map(|environment| environment.to_string())
                .unwrap_or_default();
            out.push_str(&format!("  #{index} {owner} @{environment} {set}\n"));
        }
        out
    }
}

impl fmt::Debug for RoutingSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingSnapshot")
            .field("revision", &self.revision)
            .field("sets", &self.sets)
            .finish()
    }
}

/// 容量不足后的截断方式。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Truncation {
    /// 仍在正常写入。
    Open,
    /// host 为默认路由：后续只保留 host 集合。
    HostOnly,
    /// 后续集合全部丢弃。
    All,
}

struct Staged {
    accepted: Vec<Arc<AidPatternSet>>,
    programmed: usize,
    remaining: usize,
    dropped: usize,
}

/// 路由表规划器。
///
/// # 教案式说明
/// - **意图 (Why)**：注册中心任意变更后都调用 [`apply`](Self::apply) 重建，运行时通过
///   [`lookup`](Self::lookup) 查询；
/// - **契约 (What)**：
///   - 重建串行执行；
///   - 快照先于 `commit` 发布，`commit` 失败时返回 [`HceError::CommitFailed`] 并携带新世代号，
///     由调用方决定是否重试；
/// - **风险 (Trade-offs)**：控制器中途拒绝条目时，本轮已暂存的条目会被清空、快照保持不变，
///   与控制器中仍生效的上一次提交一致；调用方收到 [`HceError::ControllerRejected`] 后应整体重试。
pub struct RoutingTablePlanner {
    policy: Box<dyn RoutingPolicy>,
    adapter: Arc<ExecutionEnvironmentAdapter>,
    header_cost: usize,
    snapshot: ArcSwap<RoutingSnapshot>,
    revision: AtomicU64,
    rebuild: Mutex<()>,
}

impl RoutingTablePlanner {
    /// 以策略与适配器构造，条目开销取默认值。
    pub fn new(policy: Box<dyn RoutingPolicy>, adapter: Arc<ExecutionEnvironmentAdapter>) -> Self {
        Self::with_header_cost(policy, adapter, DEFAULT_HEADER_COST)
    }

    /// 指定每条条目的固定开销；0 会被提升为 1。
    pub fn with_header_cost(
        policy: Box<dyn RoutingPolicy>,
        adapter: Arc<ExecutionEnvironmentAdapter>,
        header_cost: usize,
    ) -> Self {
        Self {
            policy,
            adapter,
            header_cost: header_cost.max(1),
            snapshot: ArcSwap::from_pointee(RoutingSnapshot::default()),
            revision: AtomicU64::new(0),
            rebuild: Mutex::new(()),
        }
    }

    /// 关联的执行环境适配器。
    pub fn adapter(&self) -> &Arc<ExecutionEnvironmentAdapter> {
        &self.adapter
    }

    /// 当前快照。
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.load_full()
    }

    /// 当前世代号。
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// 重建路由表并发布新快照。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 容量连默认兜底条目都放不下时返回 [`HceError::InsufficientCapacity`]，硬件表保持原样；
    ///   - 执行环境等于控制器默认路由的集合不写入硬件，但仍进入快照供查找；
    ///   - 某集合放不下时整组丢弃并停止正常写入：host 为默认路由时仅保留后续 host 集合，
    ///     否则后续集合全部丢弃；
    ///   - 最后追加一条空 AID 的兜底条目指向默认路由；
    /// - **执行 (How)**：
    ///   1. 读取控制器能力并校验容量；
    ///   2. 向策略要计划，清空硬件表；
    ///   3. 逐集合计算开销（字节长度 + 条目开销），能放下才逐条暂存；
    ///   4. 发布快照，再提交硬件表。
    pub fn apply(
        &self,
        services: &[Arc<Service>],
        primary: Option<&Arc<Service>>,
        preferred: Option<&Arc<Service>>,
    ) -> Result<ApplyReport, HceError> {
        let _guard = self.rebuild.lock();

        let profile = self.adapter.profile()?;
        if profile.capacity < self.header_cost {
            return Err(HceError::InsufficientCapacity {
                capacity: profile.capacity,
                required: self.header_cost,
            });
        }
        let host_is_default = self.adapter.is_default_route(ExecutionEnvironment::HOST)?;

        let plan = self.policy.plan(services, primary, preferred);
        self.adapter.clear()?;

        let staged = match self.stage(plan, &profile, host_is_default) {
            Ok(staged) => staged,
            Err(err) => {
                warn!(code = err.code(), error = %err, "routing table staging aborted");
                if self.adapter.clear().is_err() {
                    warn!("controller refused to discard partially staged entries");
                }
                return Err(err);
            }
        };
        let Staged {
            accepted,
            programmed,
            remaining,
            dropped,
        } = staged;

        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        let accepted_sets = accepted.len();
        self.snapshot
            .store(Arc::new(RoutingSnapshot::build(revision, accepted)));

        if self.adapter.commit().is_err() {
            warn!(revision, "controller rejected routing table commit");
            return Err(HceError::CommitFailed { revision });
        }

        info!(
            revision,
            sets = accepted_sets,
            entries = programmed,
            remaining,
            dropped,
            "routing table committed"
        );
        Ok(ApplyReport {
            revision,
            programmed_entries: programmed,
            remaining_bytes: remaining,
            dropped_sets: dropped,
        })
    }

    /// 按计划暂存条目（不提交）；任何控制器错误都原样返回，由 `apply` 负责丢弃暂存结果。
    fn stage(
        &self,
        plan: Vec<Arc<AidPatternSet>>,
        profile: &ControllerProfile,
        host_is_default: bool,
    ) -> Result<Staged, HceError> {
        let mut remaining = profile.capacity - self.header_cost;
        let mut programmed = 0usize;
        let mut truncation = Truncation::Open;
        let mut accepted = Vec::with_capacity(plan.len());
        let mut dropped = 0usize;

        for set in plan {
            let Some(environment) = set.execution_environment() else {
                dropped += 1;
                continue;
            };
            match truncation {
                Truncation::All => {
                    dropped += 1;
                    continue;
                }
                Truncation::HostOnly if !environment.is_host() => {
                    dropped += 1;
                    continue;
                }
                _ => {}
            }

            if self.adapter.is_default_route(environment.as_str())? {
                debug!(environment = %environment, set = %set, "set served by default route");
                accepted.push(set);
                continue;
            }

            let required: usize = set
                .iter()
                .map(|pattern| pattern.as_bytes().len() + self.header_cost)
                .sum();
            if required > remaining {
                warn!(
                    environment = %environment,
                    set = %set,
                    required,
                    remaining,
                    "routing table full, pattern set dropped"
                );
                dropped += 1;
                truncation = if host_is_default {
                    Truncation::HostOnly
                } else {
                    Truncation::All
                };
                continue;
            }

            let route = self
                .adapter
                .location_to_route(environment.as_str(), profile.default_route)?;
            for pattern in set.iter() {
                self.adapter.add_entry(pattern.as_bytes(), route, pattern.mode())?;
            }
            remaining -= required;
            programmed += set.len();
            accepted.push(set);
        }

        self.adapter
            .add_entry(&[], profile.default_route, AidMode::Prefix)?;
        programmed += 1;

        Ok(Staged {
            accepted,
            programmed,
            remaining,
            dropped,
        })
    }

    /// 按 AID 文本查找；文本非法时返回解析错误。
    pub fn lookup(&self, aid: &str) -> Result<Vec<RouteMatch>, HceError> {
        let pattern = AidPattern::parse(aid)?;
        Ok(self.lookup_pattern(&pattern))
    }

    /// 按已解析的 AID 查找。
    pub fn lookup_pattern(&self, aid: &AidPattern) -> Vec<RouteMatch> {
        self.snapshot.load().lookup(aid)
    }
}

impl fmt::Debug for RoutingTablePlanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTablePlanner")
            .field("header_cost", &self.header_cost)
            .field("revision", &self.revision())
            .finish()
    }
}
