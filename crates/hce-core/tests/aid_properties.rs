//! AID 模式的性质测试：解析往返、冲突对称性与冲突插入不改变集合。

use hce_core::aid::{AidPattern, AidPatternSet};
use hce_core::{AidError, Category};
use proptest::prelude::*;

fn hex_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 5..=16)
}

fn marker() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just(""), Just("*"), Just("#")]
}

/// 生成前缀相近的模式，使冲突分支被充分覆盖。
fn clustered_pattern() -> impl Strategy<Value = AidPattern> {
    (prop::collection::vec(0u8..2, 5..=8), marker()).prop_map(|(bytes, marker)| {
        let text = format!("{}{marker}", hex::encode(bytes));
        AidPattern::parse(&text).expect("生成的文本必然合法")
    })
}

proptest! {
    #[test]
    fn valid_text_round_trips_to_uppercase(bytes in hex_bytes(), marker in marker()) {
        let text = format!("{}{marker}", hex::encode(&bytes));
        let pattern = AidPattern::parse(&text).expect("合法文本应解析成功");
        prop_assert_eq!(pattern.to_string(), text.to_uppercase());
        prop_assert_eq!(pattern.to_bytes(), bytes);
    }

    #[test]
    fn wrong_length_is_rejected(digits in "[0-9A-F]{0,40}", marker in marker()) {
        prop_assume!(digits.len() % 2 != 0 || !(10..=32).contains(&digits.len()));
        let text = format!("{digits}{marker}");
        let is_invalid_length = matches!(
            AidPattern::parse(&text),
            Err(AidError::InvalidLength { .. })
        );
        prop_assert!(is_invalid_length);
    }

    #[test]
    fn foreign_characters_are_rejected(
        bytes in hex_bytes(),
        position in any::<prop::sample::Index>(),
        bad in "[G-Zg-z!@$%^&()]",
    ) {
        let mut text = hex::encode_upper(&bytes);
        let at = position.index(text.len());
        text.replace_range(at..=at, &bad);
        let is_invalid_character = matches!(
            AidPattern::parse(&text),
            Err(AidError::InvalidCharacter { .. })
        );
        prop_assert!(is_invalid_character);
    }

    #[test]
    fn conflicts_are_symmetric(a in clustered_pattern(), b in clustered_pattern()) {
        prop_assert_eq!(a.conflicts_with(&b), b.conflicts_with(&a));
    }

    #[test]
    fn conflicting_insert_keeps_size(
        members in prop::collection::vec(clustered_pattern(), 1..8),
        candidate in clustered_pattern(),
    ) {
        let mut set = AidPatternSet::new(Category::Normal);
        for member in members {
            set.insert(member);
        }
        let before = set.len();
        let conflicting = set.iter().any(|member| member.conflicts_with(&candidate));
        let inserted = set.insert(candidate);
        prop_assert_eq!(inserted, !conflicting);
        if conflicting {
            prop_assert_eq!(set.len(), before);
        } else {
            prop_assert_eq!(set.len(), before + 1);
        }
    }

    #[test]
    fn set_members_are_pairwise_conflict_free(
        members in prop::collection::vec(clustered_pattern(), 0..12),
    ) {
        let mut set = AidPatternSet::new(Category::Secure);
        for member in members {
            set.insert(member);
        }
        let all: Vec<_> = set.iter().cloned().collect();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                prop_assert!(!a.conflicts_with(b));
            }
        }
    }
}
