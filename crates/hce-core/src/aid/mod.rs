//! # AID 模式与模式集合
//!
//! - [`AidPattern`]：单个 AID 值加匹配模式（精确 / 前缀 `*` / 子集 `#`）；
//! - [`AidPatternSet`]：同一类别下互不冲突的模式集合，弱引用回指所属服务。
//!
//! 文本格式为大写十六进制（10–32 位），可带一个尾随模式标记，这是与配置数据和注册接口
//! 互通的唯一线上格式。

mod pattern;
mod set;

pub use pattern::{AidMode, AidPattern, MAX_AID_BYTES, MIN_AID_BYTES, PREFIX_MARKER, SUBSET_MARKER};
pub use set::{AidPatternSet, PatternSetDocument};
