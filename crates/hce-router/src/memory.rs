//! # 内存控制器
//!
//! 不接真实硬件的 [`DeviceHost`] 实现：能力可编程、操作全部记录，并支持注入失败。
//! 既用于本工作区的测试，也适合在没有 NFC 控制器的环境里演练路由规划。

use std::sync::Arc;

use parking_lot::Mutex;

use crate::ee::{DeviceHost, HOST_ROUTE, MODE_PREFIX, MODE_SUBSET, OffHostKind};

/// 一条暂存或已提交的路由条目。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StagedEntry {
    /// AID 字节；兜底条目为空。
    pub aid: Vec<u8>,
    /// 路由编号。
    pub route: u8,
    /// 模式编码。
    pub pattern_type: u8,
}

#[derive(Debug)]
struct State {
    ready: bool,
    default_route: u8,
    default_off_host_route: Option<u8>,
    pattern_modes: u8,
    capacity: usize,
    eses: Vec<u8>,
    uiccs: Vec<u8>,
    staged: Vec<StagedEntry>,
    committed: Vec<StagedEntry>,
    commits: usize,
    clears: usize,
    capability_queries: usize,
    transmitted: Vec<Vec<u8>>,
    fail_commits: bool,
    /// 还能接受的条目数；`None` 表示不限。
    entry_budget: Option<usize>,
}

/// 可编程、可记录的内存控制器。
#[derive(Debug)]
pub struct InMemoryDeviceHost {
    state: Mutex<State>,
}

/// [`InMemoryDeviceHost`] 的构造器。
///
/// 缺省能力：已就绪、默认路由为 host、同时支持前缀与子集模式、512 字节容量、没有 off-host 位置。
#[derive(Debug)]
pub struct InMemoryDeviceHostBuilder {
    state: State,
}

impl InMemoryDeviceHostBuilder {
    /// 默认路由。
    pub fn default_route(mut self, route: u8) -> Self {
        self.state.default_route = route;
        self
    }

    /// 默认 off-host 路由。
    pub fn default_off_host_route(mut self, route: u8) -> Self {
        self.state.default_off_host_route = Some(route);
        self
    }

    /// 模式位图。
    pub fn pattern_modes(mut self, modes: u8) -> Self {
        self.state.pattern_modes = modes;
        self
    }

    /// 路由表字节容量。
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.state.capacity = capacity;
        self
    }

    /// eSE 路由编号。
    pub fn eses(mut self, routes: impl IntoIterator<Item = u8>) -> Self {
        self.state.eses = routes.into_iter().collect();
        self
    }

    /// SIM 路由编号。
    pub fn uiccs(mut self, routes: impl IntoIterator<Item = u8>) -> Self {
        self.state.uiccs = routes.into_iter().collect();
        self
    }

    /// 以“未就绪”状态启动，默认路由查询返回 `None`。
    pub fn not_ready(mut self) -> Self {
        self.state.ready = false;
        self
    }

    /// 完成构造。
    pub fn build(self) -> Arc<InMemoryDeviceHost> {
        Arc::new(InMemoryDeviceHost {
            state: Mutex::new(self.state),
        })
    }
}

impl InMemoryDeviceHost {
    /// 开始构造。
    pub fn builder() -> InMemoryDeviceHostBuilder {
        InMemoryDeviceHostBuilder {
            state: State {
                ready: true,
                default_route: HOST_ROUTE,
                default_off_host_route: None,
                pattern_modes: MODE_PREFIX | MODE_SUBSET,
                capacity: 512,
                eses: Vec::new(),
                uiccs: Vec::new(),
                staged: Vec::new(),
                committed: Vec::new(),
                commits: 0,
                clears: 0,
                capability_queries: 0,
                transmitted: Vec::new(),
                fail_commits: false,
                entry_budget: None,
            },
        }
    }

    /// 切换就绪状态。
    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    /// 让后续 `commit` 失败。
    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().fail_commits = fail;
    }

    /// 让后续 `add_entry` 失败。
    pub fn reject_entries(&self, reject: bool) {
        self.state.lock().entry_budget = reject.then_some(0);
    }

    /// 再接受 `accepted` 条条目后开始拒绝 `add_entry`。
    pub fn reject_entries_after(&self, accepted: usize) {
        self.state.lock().entry_budget = Some(accepted);
    }

    /// 当前暂存的条目。
    pub fn staged(&self) -> Vec<StagedEntry> {
        self.state.lock().staged.clone()
    }

    /// 最近一次成功提交的条目。
    pub fn committed(&self) -> Vec<StagedEntry> {
        self.state.lock().committed.clone()
    }

    /// 成功提交次数。
    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    /// 清空次数。
    pub fn clears(&self) -> usize {
        self.state.lock().clears
    }

    /// 默认路由被查询的次数。
    pub fn capability_queries(&self) -> usize {
        self.state.lock().capability_queries
    }

    /// 发往读卡器的全部响应。
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.state.lock().transmitted.clone()
    }
}

impl DeviceHost for InMemoryDeviceHost {
    fn default_route(&self) -> Option<u8> {
        let mut state = self.state.lock();
        state.capability_queries += 1;
        state.ready.then_some(state.default_route)
    }

    fn default_off_host_route(&self) -> Option<u8> {
        self.state.lock().default_off_host_route
    }

    fn supported_pattern_modes(&self) -> u8 {
        self.state.lock().pattern_modes
    }

    fn routing_table_capacity(&self) -> usize {
        self.state.lock().capacity
    }

    fn off_host_routes(&self, kind: OffHostKind) -> Vec<u8> {
        let state = self.state.lock();
        match kind {
            OffHostKind::Ese => state.eses.clone(),
            OffHostKind::Uicc => state.uiccs.clone(),
        }
    }

    fn add_entry(&self, aid: &[u8], route: u8, pattern_type: u8) -> bool {
        let mut state = self.state.lock();
        match state.entry_budget {
            Some(0) => return false,
            Some(budget) => state.entry_budget = Some(budget - 1),
            None => {}
        }
        state.staged.push(StagedEntry {
            aid: aid.to_vec(),
            route,
            pattern_type,
        });
        true
    }

    fn remove_entry(&self, aid: &[u8]) -> bool {
        let mut state = self.state.lock();
        let before = state.staged.len();
        state.staged.retain(|entry| entry.aid != aid);
        before != state.staged.len()
    }

    fn clear(&self) -> bool {
        let mut state = self.state.lock();
        state.staged.clear();
        state.clears += 1;
        true
    }

    fn commit(&self) -> bool {
        let mut state = self.state.lock();
        if state.fail_commits {
            return false;
        }
        state.committed = state.staged.clone();
        state.commits += 1;
        true
    }

    fn transmit(&self, response: &[u8]) -> bool {
        self.state.lock().transmitted.push(response.to_vec());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_snapshots_staged_entries() {
        let host = InMemoryDeviceHost::builder().build();
        assert!(host.add_entry(&[1, 2, 3, 4, 5], 0, 0x10));
        assert!(host.commit());
        assert!(host.remove_entry(&[1, 2, 3, 4, 5]));
        assert!(!host.remove_entry(&[1, 2, 3, 4, 5]));
        assert_eq!(host.committed().len(), 1);
        assert!(host.staged().is_empty());

        host.fail_commits(true);
        assert!(!host.commit());
        assert_eq!(host.commits(), 1);
    }

    #[test]
    fn rejected_entries_are_not_staged() {
        let host = InMemoryDeviceHost::builder().build();
        host.reject_entries(true);
        assert!(!host.add_entry(&[1, 2, 3, 4, 5], 0, 0));
        assert!(host.staged().is_empty());

        host.reject_entries_after(1);
        assert!(host.add_entry(&[1, 2, 3, 4, 5], 0, 0));
        assert!(!host.add_entry(&[1, 2, 3, 4, 6], 0, 0));
        assert_eq!(host.staged().len(), 1);
    }
}
