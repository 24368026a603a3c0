//! # APDU 通道契约
//!
//! 远端服务通过一条双工通道与卡模拟子系统交换消息。传输层本身（IPC/RPC）不在本子系统范围内，
//! 这里只约定消息形状与“发送即返回”的语义：
//! - [`ApduChannel::send`] 不阻塞、不返回结果，投递失败由传输层异步上报为通道死亡；
//! - 服务的响应以 [`HceMessage::ResponseApdu`] 的形式经另一次回调送达，绝不假设同步请求/应答配对。

use core::fmt;

use bytes::Bytes;

/// 通道标识，由传输层分配，用于匹配死亡通知与响应来源。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChannelId(u64);

impl ChannelId {
    /// 以传输层给出的原始值构造。
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 原始值。
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// 通知服务“交易结束”的原因。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DeactivationReason {
    /// 射频场消失。
    LinkLoss,
    /// 读卡器选择了其他应用，或交易转到了其他执行环境。
    Deselected,
}

impl DeactivationReason {
    /// 线上编码：`LinkLoss = 0`，`Deselected = 1`。
    pub fn code(self) -> u8 {
        match self {
            DeactivationReason::LinkLoss => 0,
            DeactivationReason::Deselected => 1,
        }
    }
}

/// 通道上交换的消息。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HceMessage {
    /// 读卡器发来的命令 APDU，转发给服务。
    CommandApdu(Bytes),
    /// 服务给出的响应 APDU，转发给读卡器。
    ResponseApdu(Bytes),
    /// 交易结束通知。
    Deactivated(DeactivationReason),
    /// 服务声明无法处理当前命令。
    Unhandled,
}

impl HceMessage {
    /// 线上消息编号：命令 0、响应 1、去激活 2、未处理 3。
    pub fn kind(&self) -> u8 {
        match self {
            HceMessage::CommandApdu(_) => 0,
            HceMessage::ResponseApdu(_) => 1,
            HceMessage::Deactivated(_) => 2,
            HceMessage::Unhandled => 3,
        }
    }
}

/// 通往远端服务的双工通道。
///
/// # 教案式说明
/// - **意图 (Why)**：把具体传输（进程内、IPC、测试替身）隔离在 trait 之后，状态机只依赖发送语义；
/// - **契约 (What)**：
///   - `id` 在通道生命周期内保持不变；
///   - `send` 必须是非阻塞的“发出即忘”，实现不得在内部等待远端应答；
/// - **风险 (Trade-offs)**：调用方在持有分发器互斥锁时调用 `send`，实现若回调分发器会造成死锁，
///   应把回调投递到传输层自己的线程上。
pub trait ApduChannel: Send + Sync + 'static {
    /// 通道标识。
    fn id(&self) -> ChannelId;

    /// 发送一条消息。
    fn send(&self, message: HceMessage);

    /// 通道是否仍可用；传输层能感知断开时应覆盖，缺省视为可用。
    fn is_open(&self) -> bool {
        true
    }
}
