//! 测试替身：记录全部发出消息的 [`ApduChannel`] 实现。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::channel::{ApduChannel, ChannelId, DeactivationReason, HceMessage};

/// 把收到的消息按顺序记录下来的通道。
#[derive(Debug)]
pub struct RecordingChannel {
    id: ChannelId,
    sent: Mutex<Vec<HceMessage>>,
    closed: AtomicBool,
}

impl RecordingChannel {
    /// 构造共享的记录通道。
    pub fn new(id: ChannelId) -> Arc<Self> {
        Arc::new(Self {
            id,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// 模拟远端断开：此后 `is_open` 返回 `false`。
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// 已发送消息的快照。
    pub fn sent(&self) -> Vec<HceMessage> {
        self.sent.lock().clone()
    }

    /// 已转发的命令 APDU。
    pub fn commands(&self) -> Vec<Bytes> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                HceMessage::CommandApdu(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// 收到的去激活通知。
    pub fn deactivations(&self) -> Vec<DeactivationReason> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                HceMessage::Deactivated(reason) => Some(*reason),
                _ => None,
            })
            .collect()
    }
}

impl ApduChannel for RecordingChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, message: HceMessage) {
        self.sent.lock().push(message);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}
