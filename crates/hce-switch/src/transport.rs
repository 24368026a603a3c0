//! # 传输上下文
//!
//! 状态机不知道远端服务住在哪里、通过什么 IPC 到达，只通过 [`Connector`] 发起连接请求；
//! 连接结果由传输层稍后回调 `on_connection_established` / `on_connection_failed`。

use hce_core::ServiceId;

/// 向远端服务发起连接的传输上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：由进程显式创建并注入调度器，生命周期与调度器绑定，不存在进程级全局池；
/// - **契约 (What)**：
///   - `connect` 只负责“受理请求”，返回 `false` 表示请求当场被拒绝；
///   - 连接结果必须异步回报，实现不得在 `connect` 内同步回调调度器，否则会在调度器锁上自锁；
/// - **风险 (Trade-offs)**：没有内置超时，外部看门狗放弃连接时应调用 `on_connection_failed`。
pub trait Connector: Send + Sync + 'static {
    /// 请求建立到 `service` 的连接。
    fn connect(&self, service: &ServiceId) -> bool;
}
