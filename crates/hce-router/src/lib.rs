//! # hce-router
//!
//! ## 定位与职责（Why）
//! - 决定哪些服务的 AID 能进入 NFC 控制器的硬件路由表，以及运行时一个 SELECT 应交给谁；
//! - 规划结果以带世代号的不可变快照发布，协议状态机只读快照，注册中心只写快照。
//!
//! ## 模块地图（Where）
//! - [`ee`]：控制器能力契约 [`DeviceHost`] 与执行环境适配器；
//! - [`policy`]：路由策略 trait 与按类别优先的过滤链实现；
//! - [`planner`]：容量约束下的路由表写入与快照发布；
//! - [`registry`]：注册与查询接口，每次变更同步重建；
//! - [`memory`]：可编程的内存控制器。

pub mod ee;
pub mod memory;
pub mod planner;
pub mod policy;
pub mod registry;

pub use ee::{
    ControllerProfile, DeviceHost, ExecutionEnvironmentAdapter, HOST_ROUTE, MODE_PREFIX,
    MODE_SUBSET, OffHostKind,
};
pub use memory::{InMemoryDeviceHost, InMemoryDeviceHostBuilder, StagedEntry};
pub use planner::{ApplyReport, RouteMatch, RoutingSnapshot, RoutingTablePlanner};
pub use policy::{
    CategoryFilter, ConflictFilter, FilterContext, LocationFilter, ModeFilter, RoutingFilter,
    RoutingPolicy, TagPriorityPolicy,
};
pub use registry::ServiceRegistry;
