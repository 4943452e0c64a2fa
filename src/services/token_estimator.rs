//! Token 估算 - 业务能力层
//!
//! 按模型族估算文本消耗的 token 数。每个字符按类别计入固定的
//! 千分之一 token 成本，总和向上取整，因此：
//! - 同一 (text, model) 结果确定
//! - 在文本末尾追加内容时结果不会变小
//!
//! 新的模型族通过 [`TokenEstimator::with_family`] 注册，调用方无需改动。
//! 未知模型使用保守的通用估算，不会报错。

use std::sync::Arc;

/// 字符类别对应的成本（单位：千分之一 token）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharCosts {
    /// 中日韩文字
    pub cjk: u32,
    /// ASCII 字母和数字
    pub ascii_alnum: u32,
    /// 空白字符
    pub whitespace: u32,
    /// ASCII 标点与符号
    pub punctuation: u32,
    /// 其他字符（全角标点、重音字母、emoji 等）
    pub other: u32,
}

impl CharCosts {
    fn cost(&self, c: char) -> u32 {
        if is_cjk(c) {
            self.cjk
        } else if c.is_ascii_alphanumeric() {
            self.ascii_alnum
        } else if c.is_whitespace() {
            self.whitespace
        } else if c.is_ascii() {
            self.punctuation
        } else {
            self.other
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF      // CJK 统一汉字
        | 0x3400..=0x4DBF    // 扩展 A
        | 0x20000..=0x2A6DF  // 扩展 B
        | 0xF900..=0xFAFF    // 兼容汉字
        | 0x3040..=0x30FF    // 平假名 / 片假名
        | 0xAC00..=0xD7AF    // 韩文音节
    )
}

/// 一个模型族的分词规则
pub trait TokenizerFamily: Send + Sync {
    /// 模型族名称（用于日志）
    fn name(&self) -> &str;

    /// 该模型族是否负责这个模型
    fn matches(&self, model_id: &str) -> bool;

    /// 单个字符的成本（千分之一 token）
    fn char_cost(&self, c: char) -> u32;
}

/// 按模型名前缀匹配、按字符类别计价的模型族
#[derive(Debug, Clone)]
pub struct WeightedFamily {
    name: String,
    prefixes: Vec<String>,
    costs: CharCosts,
}

impl WeightedFamily {
    pub fn new(name: impl Into<String>, prefixes: &[&str], costs: CharCosts) -> Self {
        Self {
            name: name.into(),
            prefixes: prefixes.iter().map(|p| p.to_lowercase()).collect(),
            costs,
        }
    }
}

impl TokenizerFamily for WeightedFamily {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, model_id: &str) -> bool {
        let model_id = model_id.to_lowercase();
        self.prefixes.iter().any(|p| model_id.starts_with(p.as_str()))
    }

    fn char_cost(&self, c: char) -> u32 {
        self.costs.cost(c)
    }
}

/// 未知模型使用的保守估算
pub const GENERIC_COSTS: CharCosts = CharCosts {
    cjk: 1500,
    ascii_alnum: 340,
    whitespace: 100,
    punctuation: 1000,
    other: 1500,
};

/// Token 估算器
#[derive(Clone)]
pub struct TokenEstimator {
    families: Vec<Arc<dyn TokenizerFamily>>,
    fallback: Arc<dyn TokenizerFamily>,
}

impl TokenEstimator {
    /// 只有通用估算的空估算器
    pub fn generic_only() -> Self {
        Self {
            families: Vec::new(),
            fallback: Arc::new(WeightedFamily::new("generic", &[], GENERIC_COSTS)),
        }
    }

    /// 注册一个模型族；后注册的优先匹配
    pub fn with_family(mut self, family: impl TokenizerFamily + 'static) -> Self {
        self.families.insert(0, Arc::new(family));
        self
    }

    /// 估算文本在指定模型下的 token 数
    pub fn estimate(&self, text: &str, model_id: &str) -> usize {
        let family = self.family_for(model_id);
        let milli: u64 = text.chars().map(|c| u64::from(family.char_cost(c))).sum();
        milli.div_ceil(1000) as usize
    }

    /// 负责该模型的模型族名称
    pub fn family_name(&self, model_id: &str) -> &str {
        self.family_for(model_id).name()
    }

    fn family_for(&self, model_id: &str) -> &dyn TokenizerFamily {
        self.families
            .iter()
            .find(|f| f.matches(model_id))
            .map(|f| f.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::generic_only()
            .with_family(WeightedFamily::new(
                "openai",
                &["gpt", "o1", "o3", "o4", "chatgpt"],
                CharCosts {
                    cjk: 1000,
                    ascii_alnum: 250,
                    whitespace: 50,
                    punctuation: 500,
                    other: 1000,
                },
            ))
            .with_family(WeightedFamily::new(
                "gemini",
                &["gemini"],
                CharCosts {
                    cjk: 800,
                    ascii_alnum: 250,
                    whitespace: 50,
                    punctuation: 500,
                    other: 1000,
                },
            ))
            .with_family(WeightedFamily::new(
                "chinese-optimized",
                &["deepseek", "kimi", "moonshot", "qwen", "glm", "doubao"],
                CharCosts {
                    cjk: 650,
                    ascii_alnum: 250,
                    whitespace: 50,
                    punctuation: 500,
                    other: 1000,
                },
            ))
    }
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.families.iter().map(|f| f.name()).collect();
        f.debug_struct("TokenEstimator")
            .field("families", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_is_deterministic() {
        let estimator = TokenEstimator::default();
        let text = "牛顿第二定律 F = ma 描述了力与加速度的关系。";
        assert_eq!(
            estimator.estimate(text, "gpt-4o"),
            estimator.estimate(text, "gpt-4o")
        );
        assert_eq!(estimator.estimate("", "gpt-4o"), 0);
    }

    #[test]
    fn test_estimate_is_monotonic_when_appending() {
        let estimator = TokenEstimator::default();
        let source = "第一章 函数与极限\n\n函数是数学中的基本概念。A function maps x to f(x)！😀";
        for model in ["gpt-4o", "deepseek-chat", "gemini-2.5-pro", "unknown-model"] {
            let mut previous = 0;
            let mut prefix = String::new();
            for c in source.chars() {
                prefix.push(c);
                let current = estimator.estimate(&prefix, model);
                assert!(current >= previous, "{model}: {current} < {previous}");
                previous = current;
            }
        }
    }

    #[test]
    fn test_unknown_model_falls_back_to_generic() {
        let estimator = TokenEstimator::default();
        assert_eq!(estimator.family_name("some-new-model"), "generic");
        assert_eq!(estimator.family_name("deepseek-chat"), "chinese-optimized");
        assert_eq!(estimator.family_name("GPT-4o"), "openai");

        let text = "中文内容测试";
        assert!(estimator.estimate(text, "some-new-model") >= estimator.estimate(text, "gpt-4o"));
    }

    #[test]
    fn test_registered_family_takes_priority() {
        let estimator = TokenEstimator::default().with_family(WeightedFamily::new(
            "flat",
            &["gpt-4o-mini"],
            CharCosts {
                cjk: 1000,
                ascii_alnum: 1000,
                whitespace: 1000,
                punctuation: 1000,
                other: 1000,
            },
        ));
        assert_eq!(estimator.family_name("gpt-4o-mini"), "flat");
        assert_eq!(estimator.estimate("abcd", "gpt-4o-mini"), 4);
        assert_eq!(estimator.family_name("gpt-4o"), "openai");
    }
}
