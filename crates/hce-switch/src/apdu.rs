//! # APDU 辅助
//!
//! 只关心两件事：从命令 APDU 中识别 “SELECT by name” 并取出 AID，以及状态机回给读卡器的状态字。

use core::fmt;

use hce_core::aid::{AidMode, AidPattern, MAX_AID_BYTES, MIN_AID_BYTES};

/// ISO 7816-4 行业间类别字节。
pub const CLA_INTERINDUSTRY: u8 = 0x00;
/// SELECT 指令。
pub const INS_SELECT: u8 = 0xA4;
/// P1：按 DF 名称（AID）选择。
pub const P1_SELECT_BY_NAME: u8 = 0x04;

/// CLA、INS、P1、P2、Lc 共 5 字节。
const HEADER_LEN: usize = 5;
const LC_OFFSET: usize = 4;

/// 从命令 APDU 中提取 SELECT 的目标 AID。
///
/// # 教案式注释
/// - **契约 (What)**：
///   - 长度至少为头部加最短 AID（10 字节）；
///   - CLA = `00`、INS = `A4`、P1 = `04`，P2 不作约束；
///   - Lc 在 `[5, 16]` 内，且报文长度足以容纳 Lc 字节的 AID；
///   - 任一条件不满足都视为“没有 AID”，返回 `None`；
/// - **执行 (How)**：只读取头部与 AID 字段，尾随的 Le 字节被忽略。
pub fn find_select_aid(apdu: &[u8]) -> Option<AidPattern> {
    if apdu.len() < HEADER_LEN + MIN_AID_BYTES {
        return None;
    }
    if apdu[0] != CLA_INTERINDUSTRY || apdu[1] != INS_SELECT || apdu[2] != P1_SELECT_BY_NAME {
        return None;
    }
    let aid_len = usize::from(apdu[LC_OFFSET]);
    if !(MIN_AID_BYTES..=MAX_AID_BYTES).contains(&aid_len) {
        return None;
    }
    let aid = apdu.get(HEADER_LEN..HEADER_LEN + aid_len)?;
    AidPattern::from_bytes(aid, AidMode::Exact).ok()
}

/// 回给读卡器的两字节状态字。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StatusWord(u16);

impl StatusWord {
    /// `6F00`：当前状态下不期望收到该命令。
    pub const UNEXPECTED: StatusWord = StatusWord(0x6F00);
    /// `6A82`：没有服务处理该 AID。
    pub const AID_NOT_HANDLED: StatusWord = StatusWord(0x6A82);

    /// 由数值构造。
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// 数值形式。
    pub const fn get(self) -> u16 {
        self.0
    }

    /// 线上字节形式（SW1 SW2）。
    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_aid_from_select_by_name() {
        let apdu = [0x00, 0xA4, 0x04, 0x00, 0x05, 0xA1, 0x02, 0x03, 0x04, 0x05];
        let aid = find_select_aid(&apdu).expect("合法 SELECT");
        assert_eq!(aid.to_string(), "A102030405");

        let with_le = [0x00, 0xA4, 0x04, 0x0C, 0x05, 0xA1, 0x02, 0x03, 0x04, 0x05, 0x00];
        assert_eq!(find_select_aid(&with_le), Some(aid));
    }

    #[test]
    fn other_shapes_carry_no_aid() {
        let cases: [&[u8]; 6] = [
            &[0x00, 0xA4, 0x04, 0x00, 0x05, 0xA1, 0x02, 0x03, 0x04],
            &[0x80, 0xA4, 0x04, 0x00, 0x05, 0xA1, 0x02, 0x03, 0x04, 0x05],
            &[0x00, 0xB0, 0x04, 0x00, 0x05, 0xA1, 0x02, 0x03, 0x04, 0x05],
            &[0x00, 0xA4, 0x00, 0x00, 0x05, 0xA1, 0x02, 0x03, 0x04, 0x05],
            &[0x00, 0xA4, 0x04, 0x00, 0x04, 0xA1, 0x02, 0x03, 0x04, 0x05],
            &[0x00, 0xA4, 0x04, 0x00, 0x07, 0xA1, 0x02, 0x03, 0x04, 0x05],
        ];
        for apdu in cases {
            assert_eq!(find_select_aid(apdu), None, "{apdu:02X?}");
        }
    }

    #[test]
    fn status_words_render_as_wire_bytes() {
        assert_eq!(StatusWord::UNEXPECTED.to_bytes(), [0x6F, 0x00]);
        assert_eq!(StatusWord::AID_NOT_HANDLED.to_bytes(), [0x6A, 0x82]);
        assert_eq!(StatusWord::AID_NOT_HANDLED.to_string(), "6A82");
    }
}
