use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AidError;

/// AID 最短字节数。
pub const MIN_AID_BYTES: usize = 5;
/// AID 最长字节数。
pub const MAX_AID_BYTES: usize = 16;
/// 前缀匹配标记。
pub const PREFIX_MARKER: char = '*';
/// 子集匹配标记。
pub const SUBSET_MARKER: char = '#';

/// AID 匹配模式。
///
/// # 教案式说明
/// - **意图 (Why)**：同一个 AID 值可以按“精确”“前缀”“子集”三种方式覆盖读卡器发来的 SELECT；
/// - **契约 (What)**：
///   - `Exact`：读卡器选择的 AID 与模式逐字节相等；
///   - `Prefix`（尾随 `*`）：读卡器选择的 AID 以模式值开头；
///   - `Subset`（尾随 `#`）：模式值以读卡器选择的 AID 开头；
/// - **风险 (Trade-offs)**：控制器可能只支持部分模式，过滤逻辑见 `hce-router` 的模式过滤器。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AidMode {
    /// 精确匹配。
    Exact,
    /// 前缀匹配。
    Prefix,
    /// 子集匹配。
    Subset,
}

impl AidMode {
    /// 文本格式中的尾随标记；精确匹配没有标记。
    pub fn marker(self) -> Option<char> {
        match self {
            AidMode::Exact => None,
            AidMode::Prefix => Some(PREFIX_MARKER),
            AidMode::Subset => Some(SUBSET_MARKER),
        }
    }

    /// 由尾随标记反推模式。
    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            PREFIX_MARKER => Some(AidMode::Prefix),
            SUBSET_MARKER => Some(AidMode::Subset),
            _ => None,
        }
    }

    /// 写入控制器路由表时使用的模式编码。
    pub fn route_bits(self) -> u8 {
        match self {
            AidMode::Exact => 0x00,
            AidMode::Prefix => 0x10,
            AidMode::Subset => 0x20,
        }
    }

    fn rank(self) -> u8 {
        match self {
            AidMode::Exact => 0,
            AidMode::Subset => 1,
            AidMode::Prefix => 2,
        }
    }
}

/// 单个 AID 模式：5–16 字节的 AID 值加一种匹配模式。
///
/// # 教案式说明
/// - **意图 (Why)**：服务以文本形式声明 AID，运行时需要在字节层面做冲突检测与覆盖判断；
/// - **契约 (What)**：
///   - 只能通过 [`AidPattern::parse`] 或 [`AidPattern::from_bytes`] 构造，因此实例总是合法的；
///   - `Display` 输出规范形式：大写十六进制加可选尾随标记；
///   - 结构相等（`==`）比较的是字节与模式，冲突关系见 [`AidPattern::conflicts_with`]；
/// - **执行 (How)**：内部只保存字节，十六进制位数恒为偶数，因此“文本前缀”与“字节前缀”等价；
/// - **风险 (Trade-offs)**：冲突关系不是全序，故本类型不实现 `Ord`；集合去重由
///   [`AidPatternSet`](super::AidPatternSet) 在插入时按冲突关系完成。
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct AidPattern {
    bytes: Box<[u8]>,
    mode: AidMode,
}

impl AidPattern {
    /// 解析 AID 文本。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 接受大小写十六进制，输出统一为大写；
    ///   - 至多一个尾随 `*`/`#` 标记，出现在其他位置或出现其他字符时返回
    ///     [`AidError::InvalidCharacter`]；
    ///   - 十六进制位数（不含标记）为奇数或不在 `[10, 32]` 区间时返回 [`AidError::InvalidLength`]；
    /// - **执行 (How)**：先定位标记并校验字符，再校验长度，最后交给 `hex` 解码。
    pub fn parse(text: &str) -> Result<Self, AidError> {
        let (digits, mode) = match text.chars().last().and_then(AidMode::from_marker) {
            Some(mode) => (&text[..text.len() - 1], mode),
            None => (text, AidMode::Exact),
        };

        if let Some((position, found)) = digits
            .chars()
            .enumerate()
            .find(|(_, ch)| !ch.is_ascii_hexdigit())
        {
            return Err(AidError::InvalidCharacter {
                literal: text.to_owned(),
                found,
                position,
            });
        }

        let count = digits.len();
        if count % 2 != 0 || !(MIN_AID_BYTES * 2..=MAX_AID_BYTES * 2).contains(&count) {
            return Err(AidError::InvalidLength {
                literal: text.to_owned(),
                digits: count,
            });
        }

        let bytes = hex::decode(digits).map_err(|err| match err {
            hex::FromHexError::InvalidHexCharacter { c, index } => AidError::InvalidCharacter {
                literal: text.to_owned(),
                found: c,
                position: index,
            },
            _ => AidError::InvalidLength {
                literal: text.to_owned(),
                digits: count,
            },
        })?;

        Ok(Self {
            bytes: bytes.into_boxed_slice(),
            mode,
        })
    }

    /// 由原始字节构造模式，长度必须在 `[5, 16]` 区间内。
    pub fn from_bytes(bytes: &[u8], mode: AidMode) -> Result<Self, AidError> {
        if !(MIN_AID_BYTES..=MAX_AID_BYTES).contains(&bytes.len()) {
            return Err(AidError::InvalidLength {
                literal: hex::encode_upper(bytes),
                digits: bytes.len() * 2,
            });
        }
        Ok(Self {
            bytes: bytes.into(),
            mode,
        })
    }

    /// 匹配模式。
    pub fn mode(&self) -> AidMode {
        self.mode
    }

    /// AID 字节（不含模式标记）。
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// 解码后的 AID 字节副本，用于写入硬件路由表。
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    /// 去掉模式标记后的大写十六进制文本。
    pub fn literal(&self) -> String {
        hex::encode_upper(&self.bytes)
    }

    /// 以空格分隔字节的诊断文本，例如 `A0 00 00 00 03 *`。
    pub fn spaced(&self) -> String {
        let mut out = self
            .bytes
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(marker) = self.mode.marker() {
            out.push(' ');
            out.push(marker);
        }
        out
    }

    /// 忽略模式比较 AID 值。
    pub fn equals_ignoring_mode(&self, other: &AidPattern) -> bool {
        self.bytes == other.bytes
    }

    /// 判断是否存在某个具体 AID 能同时满足两个模式。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 精确 vs 精确：字节相等；
    ///   - 精确 vs 前缀：精确值以前缀值开头；
    ///   - 精确 vs 子集：子集值以精确值开头；
    ///   - 前缀/子集两两之间：任一方的值以另一方的值开头；
    /// - **风险 (Trade-offs)**：关系对称但不传递，不能当作等价关系排序。
    pub fn conflicts_with(&self, other: &AidPattern) -> bool {
        let (a, b) = (&*self.bytes, &*other.bytes);
        match (self.mode, other.mode) {
            (AidMode::Exact, AidMode::Exact) => a == b,
            (AidMode::Exact, AidMode::Prefix) => a.starts_with(b),
            (AidMode::Prefix, AidMode::Exact) => b.starts_with(a),
            (AidMode::Exact, AidMode::Subset) => b.starts_with(a),
            (AidMode::Subset, AidMode::Exact) => a.starts_with(b),
            _ => a.starts_with(b) || b.starts_with(a),
        }
    }

    /// 两个模式的交集：当一方覆盖的 AID 全部落在另一方之内时返回更具体的一方。
    ///
    /// - 精确值被前缀/子集覆盖时返回精确值；
    /// - 前缀之间返回更长的前缀，子集之间返回更短的子集；
    /// - 前缀与子集互不包含，返回 `None`。
    pub fn intersection(&self, other: &AidPattern) -> Option<AidPattern> {
        if !self.conflicts_with(other) {
            return None;
        }
        let (a, b) = (&*self.bytes, &*other.bytes);
        match (self.mode, other.mode) {
            (AidMode::Exact, _) => Some(self.clone()),
            (_, AidMode::Exact) => Some(other.clone()),
            (AidMode::Prefix, AidMode::Prefix) => {
                Some(if a.len() >= b.len() { self } else { other }.clone())
            }
            (AidMode::Subset, AidMode::Subset) => {
                Some(if a.len() <= b.len() { self } else { other }.clone())
            }
            _ => None,
        }
    }

    /// 判断读卡器选择的具体 AID 是否落在本模式的覆盖范围内。
    pub fn covers(&self, aid: &[u8]) -> bool {
        match self.mode {
            AidMode::Exact => &*self.bytes == aid,
            AidMode::Prefix => aid.starts_with(&self.bytes),
            AidMode::Subset => self.bytes.starts_with(aid),
        }
    }

    /// 冲突感知的“小于”关系：冲突的两个模式互不小于对方，其余按规范文本字典序比较。
    pub fn precedes(&self, other: &AidPattern) -> bool {
        !self.conflicts_with(other) && self.canonical_cmp(other) == Ordering::Less
    }

    /// 按规范文本的字典序比较（大写十六进制在前，标记在后）。
    pub fn canonical_cmp(&self, other: &AidPattern) -> Ordering {
        self.bytes
            .cmp(&other.bytes)
            .then_with(|| self.mode.rank().cmp(&other.mode.rank()))
    }
}

impl fmt::Display for AidPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.bytes.iter() {
            write!(f, "{byte:02X}")?;
        }
        if let Some(marker) = self.mode.marker() {
            write!(f, "{marker}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for AidPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AidPattern({self})")
    }
}

impl FromStr for AidPattern {
    type Err = AidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AidPattern::parse(s)
    }
}

impl Serialize for AidPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AidPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        AidPattern::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aid(text: &str) -> AidPattern {
        AidPattern::parse(text).expect("测试 AID 应合法")
    }

    #[test]
    fn parse_normalizes_case_and_keeps_marker() {
        let pattern = aid("a0000000031010*");
        assert_eq!(pattern.mode(), AidMode::Prefix);
        assert_eq!(pattern.to_string(), "A0000000031010*");
        assert_eq!(pattern.literal(), "A0000000031010");
        assert_eq!(pattern.to_bytes(), vec![0xA0, 0, 0, 0, 0x03, 0x10, 0x10]);
    }

    #[test]
    fn parse_rejects_bad_lengths() {
        let too_long = "A0".repeat(17);
        for text in ["", "A0", "A00000000", "A000000003101", "*", too_long.as_str()] {
            assert!(
                matches!(AidPattern::parse(text), Err(AidError::InvalidLength { .. })),
                "`{text}` 应因长度被拒绝"
            );
        }
    }

    #[test]
    fn parse_rejects_bad_characters() {
        assert!(matches!(
            AidPattern::parse("A00000000G"),
            Err(AidError::InvalidCharacter { found: 'G', position: 9, .. })
        ));
        assert!(matches!(
            AidPattern::parse("A000*000031"),
            Err(AidError::InvalidCharacter { found: '*', position: 4, .. })
        ));
        assert!(matches!(
            AidPattern::parse("A000000003**"),
            Err(AidError::InvalidCharacter { found: '*', .. })
        ));
        assert!(matches!(
            AidPattern::parse("A000000003*#"),
            Err(AidError::InvalidCharacter { found: '*', .. })
        ));
    }

    #[test]
    fn conflict_rules_follow_mode_pairs() {
        assert!(aid("A000000003").conflicts_with(&aid("A000000003")));
        assert!(!aid("A000000003").conflicts_with(&aid("A000000004")));
        assert!(aid("A00000000310").conflicts_with(&aid("A000000003*")));
        assert!(!aid("A000000004").conflicts_with(&aid("A000000003*")));
        assert!(aid("A000000003").conflicts_with(&aid("A00000000310#")));
        assert!(!aid("A00000000310").conflicts_with(&aid("A000000003#")));
        assert!(aid("A000000003*").conflicts_with(&aid("A00000000310*")));
        assert!(aid("A00000000310#").conflicts_with(&aid("A000000003#")));
        assert!(aid("A000000003*").conflicts_with(&aid("A00000000310#")));
        assert!(!aid("A000000003*").conflicts_with(&aid("B00000000310#")));
    }

    #[test]
    fn intersection_returns_more_specific_pattern() {
        assert_eq!(
            aid("A00000000310").intersection(&aid("A000000003*")),
            Some(aid("A00000000310"))
        );
        assert_eq!(
            aid("A000000003*").intersection(&aid("A00000000310*")),
            Some(aid("A00000000310*"))
        );
        assert_eq!(
            aid("A00000000310#").intersection(&aid("A000000003#")),
            Some(aid("A000000003#"))
        );
        assert_eq!(aid("A000000003*").intersection(&aid("A00000000310#")), None);
        assert_eq!(aid("A000000003").intersection(&aid("B000000003")), None);
    }

    #[test]
    fn coverage_by_mode() {
        let select = [0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10];
        assert!(aid("A0000000031010").covers(&select));
        assert!(aid("A000000003*").covers(&select));
        assert!(aid("A000000003101001#").covers(&select));
        assert!(!aid("A0000000031011").covers(&select));
        assert!(!aid("A00000000311*").covers(&select));
    }

    #[test]
    fn precedes_is_false_between_conflicting_patterns() {
        let a = aid("A000000003*");
        let b = aid("A00000000310");
        assert!(!a.precedes(&b));
        assert!(!b.precedes(&a));
        assert!(aid("A000000003").precedes(&aid("B000000003")));
    }

    #[test]
    fn spaced_form_for_diagnostics() {
        assert_eq!(aid("A102030405#").spaced(), "A1 02 03 04 05 #");
    }

    #[test]
    fn from_bytes_enforces_length() {
        assert!(AidPattern::from_bytes(&[1, 2, 3, 4], AidMode::Exact).is_err());
        let pattern = AidPattern::from_bytes(&[0xF0, 1, 2, 3, 4], AidMode::Subset)
            .expect("5 字节应合法");
        assert_eq!(pattern.to_string(), "F001020304#");
    }
}
