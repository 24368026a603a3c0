use core::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::pattern::AidPattern;
use crate::error::HceError;
use crate::service::{Category, ExecutionEnvironment, Service};

/// 同一类别下互不冲突的 AID 模式集合。
///
/// # 教案式说明
/// - **意图 (Why)**：服务按类别（`normal`/`secure`）声明一组 AID，路由规划与运行时查找都以集合为单位；
/// - **契约 (What)**：
///   - 插入冲突或非法模式时静默失败（返回 `false`），集合保持不变；
///   - `owner` 为指向所属服务的弱引用，服务注销后自然降级为“无主”，读取方必须处理 `None`；
///   - 执行环境不在集合中存储，而是经由 `owner` 推导；
/// - **执行 (How)**：内部按规范文本排序保存，插入时线性扫描冲突；单个服务的 AID 数量有限，
///   线性扫描足够；
/// - **风险 (Trade-offs)**：冲突关系不是全序，因此不能直接使用 `BTreeSet` 作为去重容器。
#[derive(Clone, Default)]
pub struct AidPatternSet {
    category: Category,
    description: String,
    owner: Weak<Service>,
    patterns: Vec<AidPattern>,
}

/// 模式集合的 JSON 文档形式：`{"type": …, "description": …, "aids": […]}`。
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PatternSetDocument {
    /// 类别文本，未知类别在转换时按 `normal` 处理。
    #[serde(rename = "type")]
    pub category: String,
    /// 人类可读描述。
    #[serde(default)]
    pub description: String,
    /// AID 文本列表。
    #[serde(default)]
    pub aids: Vec<String>,
}

impl AidPatternSet {
    /// 创建指定类别的空集合。
    pub fn new(category: Category) -> Self {
        Self {
            category,
            ..Self::default()
        }
    }

    /// 附加描述文本。
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 由 AID 文本列表整体构造集合。
    ///
    /// # 教案式注释
    /// - **意图 (Why)**：注册接口一次性提交整组 AID，部分成功会让服务处于半注册状态；
    /// - **契约 (What)**：任一文本非法或与已插入成员冲突时返回首个错误，不产生任何集合；
    ///   空列表返回 [`HceError::EmptyPatternSet`]。
    pub fn from_literals<I, S>(category: Category, aids: I) -> Result<Self, HceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new(category);
        for text in aids {
            let pattern = AidPattern::parse(text.as_ref())?;
            if let Some(existing) = set.find_conflict(&pattern) {
                return Err(HceError::ConflictingPattern {
                    pattern: pattern.to_string(),
                    existing: existing.to_string(),
                });
            }
            set.insert(pattern);
        }
        if set.is_empty() {
            return Err(HceError::EmptyPatternSet {
                category: category.to_string(),
            });
        }
        Ok(set)
    }

    /// 由 JSON 文档构造集合，未知类别按 `normal` 处理。
    pub fn from_document(document: &PatternSetDocument) -> Result<Self, HceError> {
        let category = Category::parse_lenient(&document.category);
        Ok(Self::from_literals(category, &document.aids)?.with_description(&document.description))
    }

    /// 导出 JSON 文档形式。
    pub fn to_document(&self) -> PatternSetDocument {
        PatternSetDocument {
            category: self.category.to_string(),
            description: self.description.clone(),
            aids: self.literals(),
        }
    }

    /// 序列化为 JSON 文本。
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_document())
    }

    /// 从 JSON 文本解析集合：外层错误表示文档结构非法，内层错误表示 AID 内容非法。
    pub fn from_json(text: &str) -> Result<Result<Self, HceError>, serde_json::Error> {
        let document: PatternSetDocument = serde_json::from_str(text)?;
        Ok(Self::from_document(&document))
    }

    /// 插入模式；与已有成员冲突时返回 `false` 且集合不变。
    pub fn insert(&mut self, pattern: AidPattern) -> bool {
        if let Some(existing) = self.find_conflict(&pattern) {
            warn!(
                category = %self.category,
                pattern = %pattern,
                existing = %existing,
                "conflicting aid pattern rejected"
            );
            return false;
        }
        let position = self
            .patterns
            .partition_point(|member| member.canonical_cmp(&pattern).is_lt());
        self.patterns.insert(position, pattern);
        true
    }

    /// 解析并插入 AID 文本；非法文本与冲突一样返回 `false`。
    pub fn insert_literal(&mut self, text: &str) -> bool {
        match AidPattern::parse(text) {
            Ok(pattern) => self.insert(pattern),
            Err(err) => {
                warn!(category = %self.category, code = err.code(), literal = text, "malformed aid rejected");
                false
            }
        }
    }

    /// 移除与 `pattern` 结构相等的成员。
    pub fn remove(&mut self, pattern: &AidPattern) -> bool {
        let before = self.patterns.len();
        self.patterns.retain(|member| member != pattern);
        before != self.patterns.len()
    }

    /// 判断 AID（忽略其模式）是否落在集合的覆盖范围内。
    pub fn matches(&self, aid: &AidPattern) -> bool {
        self.patterns
            .iter()
            .any(|member| member.covers(aid.as_bytes()))
    }

    /// 是否存在与 `aid` 值相同的成员（忽略模式）。
    pub fn contains_literal(&self, aid: &AidPattern) -> bool {
        self.patterns
            .iter()
            .any(|member| member.equals_ignoring_mode(aid))
    }

    /// 两个集合是否存在任意一对冲突成员。
    pub fn conflicts_with(&self, other: &AidPatternSet) -> bool {
        self.patterns
            .iter()
            .any(|mine| other.patterns.iter().any(|theirs| mine.conflicts_with(theirs)))
    }

    fn find_conflict(&self, pattern: &AidPattern) -> Option<&AidPattern> {
        self.patterns
            .iter()
            .find(|member| member.conflicts_with(pattern))
    }

    /// 集合类别。
    pub fn category(&self) -> Category {
        self.category
    }

    /// 描述文本。
    pub fn description(&self) -> &str {
        &self.description
    }

    /// 按规范文本顺序遍历成员。
    pub fn iter(&self) -> impl Iterator<Item = &AidPattern> {
        self.patterns.iter()
    }

    /// 成员数量。
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// 全部成员的规范文本。
    pub fn literals(&self) -> Vec<String> {
        self.patterns.iter().map(ToString::to_string).collect()
    }

    /// 所属服务；服务已注销时返回 `None`。
    pub fn owner(&self) -> Option<Arc<Service>> {
        self.owner.upgrade()
    }

    /// 是否属于给定服务。
    pub fn belongs_to(&self, service: &Arc<Service>) -> bool {
        Weak::ptr_eq(&self.owner, &Arc::downgrade(service))
    }

    /// 经由所属服务推导出的执行环境。
    pub fn execution_environment(&self) -> Option<ExecutionEnvironment> {
        self.owner().map(|service| service.environment())
    }

    pub(crate) fn set_owner(&mut self, owner: Weak<Service>) {
        self.owner = owner;
    }
}

impl fmt::Debug for AidPatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AidPatternSet")
            .field("category", &self.category)
            .field("owner", &self.owner().map(|service| service.id().to_string()))
            .field("patterns", &self.literals())
            .finish()
    }
}

impl fmt::Display for AidPatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: [{}]", self.category, self.literals().join(", "))
    }
}
