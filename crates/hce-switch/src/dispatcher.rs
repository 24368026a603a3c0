//! # 卡模拟协议状态机
//!
//! ## 核心意图（Why）
//! - 控制器每收到一条 APDU 就回调一次 [`CardEmulationDispatcher::on_data_received`]，
//!   状态机据此决定：解析 SELECT、查路由、复用或建立通道、转发或拒绝；
//! - 读卡器永远会得到回应：任何失败路径都以状态字结束，而不是静默丢弃。
//!
//! ## 状态图（What）
//! ```text
//! Idle ──field on──▶ AwaitingSelect ──SELECT, 通道已在──▶ Transferring
//!                         │                                  │  ▲
//!                         └──SELECT, 需连接──▶ AwaitingConnection ┘  │ 连接建立
//! Transferring ──服务请求释放──▶ AwaitingDeactivation
//! 任意状态 ──field off──▶ Idle；任意状态 ──field on / 其他路由交易──▶ AwaitingSelect
//! ```
//!
//! ## 并发（How）
//! - 全部迁移与通道缓存修改都在同一把 `parking_lot::Mutex` 内完成；
//! - 持锁期间只做非阻塞操作：通道 `send` 即发即返回，连接请求只做受理，状态字经控制器发出。

use core::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use hce_core::aid::AidPattern;
use hce_core::{ApduChannel, Category, ChannelId, DeactivationReason, HceMessage, ServiceId};
use hce_router::{DeviceHost, RouteMatch, RoutingTablePlanner, ServiceRegistry};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::apdu::{StatusWord, find_select_aid};
use crate::transport::Connector;

/// 调度器状态。
///
/// # 教案式说明
/// - **意图 (Why)**：把“一次场会话”内的协议阶段显式化，非法组合由 [`can_transition_to`] 拦截；
/// - **契约 (What)**：初始为 `Idle`，没有终止态，随场的开合循环；
/// - **风险 (Trade-offs)**：`AwaitingDeactivation` 只在服务主动请求释放后进入，此后到场关闭前的命令一律回 `6F00`。
///
/// [`can_transition_to`]: DispatcherState::can_transition_to
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum DispatcherState {
    /// 没有射频场。
    #[default]
    Idle,
    /// 场已建立，等待读卡器 SELECT。
    AwaitingSelect,
    /// 已向目标服务发起连接，SELECT 已缓存。
    AwaitingConnection,
    /// 与活动服务交换 APDU。
    Transferring,
    /// 服务已请求结束交易，等待场关闭。
    AwaitingDeactivation,
}

impl DispatcherState {
    /// 判断状态是否允许跃迁至 `target`。
    ///
    /// - 任意状态都可回到 `Idle`（场关闭）或 `AwaitingSelect`（场重新激活、交易走了其他路由、连接失败）；
    /// - 其余跃迁只沿 SELECT → 连接 → 传输 → 释放的方向前进。
    pub fn can_transition_to(self, target: DispatcherState) -> bool {
        use DispatcherState::*;
        self == target
            || matches!(
                (self, target),
                (_, Idle)
                    | (_, AwaitingSelect)
                    | (AwaitingSelect, AwaitingConnection)
                    | (AwaitingSelect, Transferring)
                    | (AwaitingConnection, Transferring)
                    | (Transferring, AwaitingConnection)
                    | (Transferring, AwaitingDeactivation)
            )
    }

    /// 诊断用名称。
    pub fn as_str(self) -> &'static str {
        match self {
            DispatcherState::Idle => "idle",
            DispatcherState::AwaitingSelect => "awaiting_select",
            DispatcherState::AwaitingConnection => "awaiting_connection",
            DispatcherState::Transferring => "transferring",
            DispatcherState::AwaitingDeactivation => "awaiting_deactivation",
        }
    }
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次回调的处理结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reply {
    /// 命令已转发给服务通道。
    Forwarded,
    /// 命令已缓存，等待连接建立。
    Pending,
    /// 服务响应已发回读卡器。
    Transmitted,
    /// 已向读卡器回复状态字。
    Status(StatusWord),
    /// 本次事件不需要回应读卡器。
    Silent,
}

struct Bound {
    service: ServiceId,
    channel: Arc<dyn ApduChannel>,
}

struct Active {
    service: ServiceId,
    channel: Weak<dyn ApduChannel>,
}

impl Active {
    fn live(&self) -> Option<Arc<dyn ApduChannel>> {
        self.channel.upgrade().filter(|channel| channel.is_open())
    }
}

struct PendingSelect {
    service: ServiceId,
    category: Category,
    apdu: Bytes,
}

#[derive(Default)]
struct Inner {
    state: DispatcherState,
    active: Option<Active>,
    primary_slot: Option<Bound>,
    preferred_slot: Option<Bound>,
    pending: Option<PendingSelect>,
}

impl Inner {
    fn live_active(&self) -> Option<(ServiceId, Arc<dyn ApduChannel>)> {
        let active = self.active.as_ref()?;
        Some((active.service.clone(), active.live()?))
    }

    fn cached_channel(&self, service: &ServiceId) -> Option<Arc<dyn ApduChannel>> {
        [&self.primary_slot, &self.preferred_slot]
            .into_iter()
            .flatten()
            .find(|bound| &bound.service == service && bound.channel.is_open())
            .map(|bound| Arc::clone(&bound.channel))
    }
}

/// 卡模拟调度器。
///
/// # 教案式说明
/// - **意图 (Why)**：把控制器回调、传输层回调串行化到一个状态机里，保证同一时刻只有一次迁移；
/// - **契约 (What)**：
///   - 所有回调都不返回错误，结果以 [`Reply`] 描述；需要回应读卡器的状态字由调度器自己经
///     [`DeviceHost::transmit`] 发出；
///   - 活动通道以弱引用保存，通道被释放后自然降级为“没有活动通道”；
///   - primary/preferred 槽位缓存异步建立的通道，死亡通知会清除它们；
/// - **执行 (How)**：路由查找读 [`RoutingTablePlanner`] 的快照，连接请求交给注入的 [`Connector`]；
/// - **风险 (Trade-offs)**：`Connector` 的实现若同步回调调度器会自锁，契约见 [`Connector`]。
pub struct CardEmulationDispatcher {
    planner: Arc<RoutingTablePlanner>,
    host: Arc<dyn DeviceHost>,
    connector: Arc<dyn Connector>,
    priority: Category,
    inner: Mutex<Inner>,
}

impl CardEmulationDispatcher {
    /// 构造调度器，初始状态为 `Idle`。
    pub fn new(
        planner: Arc<RoutingTablePlanner>,
        host: Arc<dyn DeviceHost>,
        connector: Arc<dyn Connector>,
        priority: Category,
    ) -> Self {
        Self {
            planner,
            host,
            connector,
            priority,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// 复用注册中心的规划器、控制器与优先类别。
    pub fn from_registry(registry: &ServiceRegistry, connector: Arc<dyn Connector>) -> Self {
        let planner = Arc::clone(registry.planner());
        let host = Arc::clone(planner.adapter().device_host());
        Self::new(planner, host, connector, registry.priority())
    }

    /// 当前状态。
    pub fn state(&self) -> DispatcherState {
        self.inner.lock().state
    }

    /// 射频场建立。
    pub fn on_field_activated(&self) {
        let mut inner = self.inner.lock();
        inner.pending = None;
        inner.active = None;
        self.transition(&mut inner, DispatcherState::AwaitingSelect);
    }

    /// 射频场消失：通知活动通道链路丢失并回到 `Idle`。
    pub fn on_field_deactivated(&self) {
        let mut inner = self.inner.lock();
        if let Some((service, channel)) = inner.live_active() {
            debug!(service = %service, channel = %channel.id(), "link lost");
            channel.send(HceMessage::Deactivated(DeactivationReason::LinkLoss));
        }
        inner.active = None;
        inner.pending = None;
        self.transition(&mut inner, DispatcherState::Idle);
    }

    /// 交易被控制器路由到了其他执行环境。
    pub fn on_transaction_on_other_route(&self) {
        let mut inner = self.inner.lock();
        if inner.state == DispatcherState::Transferring
            && let Some((service, channel)) = inner.live_active()
        {
            debug!(service = %service, "deselected by off-host transaction");
            channel.send(HceMessage::Deactivated(DeactivationReason::Deselected));
        }
        inner.active = None;
        inner.pending = None;
        self.transition(&mut inner, DispatcherState::AwaitingSelect);
    }

    /// 控制器送来一条命令 APDU。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - `Idle`/`AwaitingDeactivation`：回 `6F00`；
    ///   - 带 SELECT 且查不到路由：回 `6A82`，状态不变；
    ///   - 带 SELECT 且命中：`AwaitingSelect` 下接通服务；`Transferring` 下目标变化时先通知旧通道
    ///     `Deselected` 再切换；`AwaitingConnection` 下回 `6F00`；
    ///   - 不带 SELECT：`Transferring` 下转发给仍存活的活动通道，通道已失效回 `6A82`；
    ///     `AwaitingSelect`/`AwaitingConnection` 下回 `6F00`；
    /// - **执行 (How)**：先在锁外解析 SELECT 与查路由（只读快照），再持锁决定迁移。
    pub fn on_data_received(&self, apdu: &[u8]) -> Reply {
        let select = find_select_aid(apdu);
        let hit = select
            .as_ref()
            .map(|aid| self.planner.lookup_pattern(aid).into_iter().next());
        let payload = Bytes::copy_from_slice(apdu);

        let mut inner = self.inner.lock();
        let state = inner.state;
        debug!(state = %state, len = apdu.len(), select = ?select.as_ref().map(AidPattern::to_string), "apdu received");

        if matches!(
            state,
            DispatcherState::Idle | DispatcherState::AwaitingDeactivation
        ) {
            return self.reject(StatusWord::UNEXPECTED, state);
        }

        match hit {
            Some(None) => self.reject(StatusWord::AID_NOT_HANDLED, state),
            Some(Some(hit)) => match state {
                DispatcherState::AwaitingSelect => self.route_to(&mut inner, hit, payload),
                DispatcherState::Transferring => {
                    match inner.live_active() {
                        Some((service, channel)) if &service == hit.service.id() => {
                            channel.send(HceMessage::CommandApdu(payload));
                            Reply::Forwarded
                        }
                        Some((service, channel)) => {
                            info!(from = %service, to = %hit.service.id(), "switching active service");
                            channel.send(HceMessage::Deactivated(DeactivationReason::Deselected));
                            self.route_to(&mut inner, hit, payload)
                        }
                        None => self.route_to(&mut inner, hit, payload),
                    }
                }
                _ => self.reject(StatusWord::UNEXPECTED, state),
            },
            None => match state {
                DispatcherState::Transferring => match inner.live_active() {
                    Some((_, channel)) => {
                        channel.send(HceMessage::CommandApdu(payload));
                        Reply::Forwarded
                    }
                    None => {
                        inner.active = None;
                        self.reject(StatusWord::AID_NOT_HANDLED, state)
                    }
                },
                _ => self.reject(StatusWord::UNEXPECTED, state),
            },
        }
    }

    /// 异步连接建立：写入槽位，冲刷缓存的 SELECT，返回是否发生了冲刷。
    pub fn on_connection_established(
        &self,
        service: &ServiceId,
        channel: Arc<dyn ApduChannel>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let matches_pending = inner.state == DispatcherState::AwaitingConnection
            && inner
                .pending
                .as_ref()
                .is_some_and(|pending| &pending.service == service);
        if !matches_pending {
            debug!(service = %service, state = %inner.state, "unexpected connection ignored");
            return false;
        }
        let Some(pending) = inner.pending.take() else {
            return false;
        };

        let bound = Bound {
            service: service.clone(),
            channel: Arc::clone(&channel),
        };
        if pending.category == self.priority {
            inner.primary_slot = Some(bound);
        } else {
            inner.preferred_slot = Some(bound);
        }
        info!(service = %service, channel = %channel.id(), "service connected");
        channel.send(HceMessage::CommandApdu(pending.apdu));
        inner.active = Some(Active {
            service: service.clone(),
            channel: Arc::downgrade(&channel),
        });
        self.transition(&mut inner, DispatcherState::Transferring);
        true
    }

    /// 异步连接失败：丢弃缓存的 SELECT、回到 `AwaitingSelect` 并回复 `6A82`。
    pub fn on_connection_failed(&self, service: &ServiceId) -> bool {
        let mut inner = self.inner.lock();
        let matches_pending = inner.state == DispatcherState::AwaitingConnection
            && inner
                .pending
                .as_ref()
                .is_some_and(|pending| &pending.service == service);
        if !matches_pending {
            return false;
        }
        inner.pending = None;
        warn!(service = %service, "connection to service failed");
        self.transition(&mut inner, DispatcherState::AwaitingSelect);
        self.send_status(StatusWord::AID_NOT_HANDLED);
        true
    }

    /// 通道死亡：清除槽位、活动通道以及路由快照中各服务上 id 匹配的引用，不改变状态。
    ///
    /// 只收到这一条通知也足以让后续 SELECT 不再复用死通道；注册中心的
    /// `on_channel_died` 另外覆盖未进入快照的服务。
    pub fn on_channel_died(&self, channel: ChannelId) {
        let released = self
            .planner
            .snapshot()
            .sets()
            .iter()
            .filter_map(|set| set.owner())
            .filter(|owner| owner.clear_channel(channel))
            .count();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        for slot in [&mut inner.primary_slot, &mut inner.preferred_slot] {
            if slot.as_ref().is_some_and(|bound| bound.channel.id() == channel) {
                *slot = None;
            }
        }
        let active_gone = inner
            .active
            .as_ref()
            .is_some_and(|active| active.live().is_none_or(|live| live.id() == channel));
        if active_gone {
            inner.active = None;
        }
        debug!(channel = %channel, released, state = %inner.state, "channel death recorded");
    }

    /// 服务经通道回送消息。
    ///
    /// - `Transferring` 下来自活动通道的响应 APDU 发回读卡器；
    /// - 活动服务发来 `Deactivated` 时进入 `AwaitingDeactivation`；
    /// - 其余组合（包括 `Unhandled`）回复 `6A82`。
    pub fn on_service_response(&self, channel: ChannelId, message: HceMessage) -> Reply {
        let mut inner = self.inner.lock();
        let state = inner.state;
        let from_active = state == DispatcherState::Transferring
            && inner
                .live_active()
                .is_some_and(|(_, active)| active.id() == channel);

        match message {
            HceMessage::ResponseApdu(response) if from_active => {
                debug!(channel = %channel, len = response.len(), "response relayed to reader");
                if !self.host.transmit(&response) {
                    warn!(channel = %channel, "controller failed to transmit response");
                }
                Reply::Transmitted
            }
            HceMessage::Deactivated(reason) if from_active => {
                info!(channel = %channel, reason = reason.code(), "service released the link");
                inner.active = None;
                self.transition(&mut inner, DispatcherState::AwaitingDeactivation);
                Reply::Silent
            }
            _ => self.reject(StatusWord::AID_NOT_HANDLED, state),
        }
    }

    fn route_to(&self, inner: &mut Inner, hit: RouteMatch, payload: Bytes) -> Reply {
        let service = hit.service.id().clone();
        let channel = inner
            .cached_channel(&service)
            .or_else(|| hit.service.channel().filter(|channel| channel.is_open()));

        if let Some(channel) = channel {
            debug!(service = %service, channel = %channel.id(), "forwarding to connected service");
            channel.send(HceMessage::CommandApdu(payload));
            inner.active = Some(Active {
                service,
                channel: Arc::downgrade(&channel),
            });
            self.transition(inner, DispatcherState::Transferring);
            return Reply::Forwarded;
        }

        inner.active = None;
        if self.connector.connect(&service) {
            info!(service = %service, category = %hit.category, "connection requested");
            inner.pending = Some(PendingSelect {
                service,
                category: hit.category,
                apdu: payload,
            });
            self.transition(inner, DispatcherState::AwaitingConnection);
            Reply::Pending
        } else {
            warn!(service = %service, "connection request refused");
            self.transition(inner, DispatcherState::AwaitingSelect);
            self.reject(StatusWord::AID_NOT_HANDLED, inner.state)
        }
    }

    fn transition(&self, inner: &mut Inner, target: DispatcherState) {
        let current = inner.state;
        if current == target {
            return;
        }
        if !current.can_transition_to(target) {
            warn!(from = %current, to = %target, "illegal dispatcher transition refused");
            return;
        }
        info!(from = %current, to = %target, "dispatcher state changed");
        inner.state = target;
    }

    fn reject(&self, status: StatusWord, state: DispatcherState) -> Reply {
        warn!(status = %status, state = %state, "apdu rejected");
        self.send_status(status);
        Reply::Status(status)
    }

    fn send_status(&self, status: StatusWord) {
        if !self.host.transmit(&status.to_bytes()) {
            warn!(status = %status, "controller failed to transmit status word");
        }
    }
}

impl fmt::Debug for CardEmulationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CardEmulationDispatcher")
            .field("state", &inner.state)
            .field("active", &inner.active.as_ref().map(|active| &active.service))
            .field("pending", &inner.pending.as_ref().map(|pending| &pending.service))
            .finish()
    }
}
