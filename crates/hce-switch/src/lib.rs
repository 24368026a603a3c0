//! # hce-switch
//!
//! ## 定位与职责（Why）
//! - 面向 NFC 控制器的实时协议面：识别读卡器的 SELECT，借助 `hce-router` 的路由快照找到目标服务，
//!   复用或建立通道后转发 APDU，并处理场关闭、交易改道、连接失败与通道死亡；
//! - 传输层以 [`Connector`] 注入，状态机本身不做任何阻塞 I/O。
//!
//! ## 模块地图（Where）
//! - [`apdu`]：SELECT 解析与状态字；
//! - [`transport`]：连接请求契约；
//! - [`dispatcher`]：状态机本体。

pub mod apdu;
pub mod dispatcher;
pub mod transport;

pub use apdu::{StatusWord, find_select_aid};
pub use dispatcher::{CardEmulationDispatcher, DispatcherState, Reply};
pub use transport::Connector;
