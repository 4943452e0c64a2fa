//! 章节拆分 - 业务能力层
//!
//! 把超出模型安全阈值的正文拆成若干块，每块都不超过
//! `floor(max_context * safety_ratio)` 个 token。
//!
//! 依次尝试的结构单元：
//! 1. markdown 标题分节
//! 2. 空行分段
//! 3. 句子
//! 4. 按字符硬切（标记 `hard_split`）
//!
//! 每块都是原文中连续的一段，所有块按顺序拼接即得到原文。

use regex::Regex;
use std::ops::Range;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::config::{context_budget, ModelCatalog};
use crate::services::token_estimator::TokenEstimator;

/// 拆分出的文本块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    pub token_count: usize,
    /// 是否在句子内部硬切
    pub hard_split: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Section,
    Paragraph,
    Sentence,
}

impl Level {
    fn next(self) -> Option<Level> {
        match self {
            Level::Section => Some(Level::Paragraph),
            Level::Paragraph => Some(Level::Sentence),
            Level::Sentence => None,
        }
    }

    /// 切分点（相对 `text` 的字节偏移，不含 0 和 len）
    fn boundaries(self, text: &str) -> Vec<usize> {
        match self {
            Level::Section => section_re()
                .find_iter(text)
                .map(|m| m.start())
                .filter(|&pos| pos > 0)
                .collect(),
            Level::Paragraph => paragraph_re()
                .find_iter(text)
                .map(|m| m.end())
                .filter(|&pos| pos < text.len())
                .collect(),
            Level::Sentence => sentence_boundaries(text),
        }
    }
}

fn section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#{1,6}[ \t]").expect("section regex"))
}

fn paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n(?:[ \t]*\n)+").expect("paragraph regex"))
}

fn sentence_boundaries(text: &str) -> Vec<usize> {
    let mut cuts = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let end = i + c.len_utf8();
        let is_end = match c {
            '。' | '！' | '？' | '；' | '!' | '?' | ';' | '\n' => true,
            '.' => chars.peek().map(|(_, next)| next.is_whitespace()).unwrap_or(false),
            _ => false,
        };
        if is_end && end < text.len() {
            cuts.push(end);
        }
    }
    cuts
}

fn pieces(range: Range<usize>, cuts: Vec<usize>) -> Vec<Range<usize>> {
    let mut result = Vec::with_capacity(cuts.len() + 1);
    let mut start = range.start;
    for cut in cuts {
        let cut = range.start + cut;
        if cut > start {
            result.push(start..cut);
            start = cut;
        }
    }
    if start < range.end {
        result.push(start..range.end);
    }
    result
}

#[derive(Debug)]
struct Span {
    range: Range<usize>,
    hard: bool,
}

/// 章节拆分器
#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    estimator: TokenEstimator,
    catalog: Arc<ModelCatalog>,
}

impl ChunkSplitter {
    pub fn new(estimator: TokenEstimator, catalog: Arc<ModelCatalog>) -> Self {
        Self { estimator, catalog }
    }

    /// 模型的安全阈值
    pub fn budget_for(&self, model: &str, safety_ratio: f64) -> usize {
        context_budget(self.catalog.max_context(model), safety_ratio)
    }

    /// 估算文本在该模型下的 token 数（逻辑名会先解析为供应商模型 ID）
    pub fn estimate(&self, text: &str, model: &str) -> usize {
        self.estimator.estimate(text, self.model_id(model))
    }

    fn model_id<'a>(&'a self, model: &'a str) -> &'a str {
        self.catalog
            .resolve(model)
            .map(|m| m.model_id.as_str())
            .unwrap_or(model)
    }

    /// 按模型上下文窗口拆分
    pub fn split(&self, text: &str, model: &str, safety_ratio: f64) -> Vec<TextChunk> {
        let budget = self.budget_for(model, safety_ratio);
        self.split_with_budget(text, model, budget)
    }

    /// 按给定 token 预算拆分
    pub fn split_with_budget(&self, text: &str, model: &str, budget: usize) -> Vec<TextChunk> {
        if text.is_empty() {
            return Vec::new();
        }
        let model_id = self.model_id(model);
        let budget = budget.max(1);

        let mut spans = Vec::new();
        if self.fits(text, 0..text.len(), model_id, budget) {
            spans.push(Span {
                range: 0..text.len(),
                hard: false,
            });
        } else {
            self.pack(text, 0..text.len(), Level::Section, model_id, budget, &mut spans);
        }

        let chunks: Vec<TextChunk> = spans
            .into_iter()
            .enumerate()
            .map(|(index, span)| {
                let chunk_text = text[span.range].to_string();
                TextChunk {
                    index,
                    token_count: self.estimator.estimate(&chunk_text, model_id),
                    text: chunk_text,
                    hard_split: span.hard,
                }
            })
            .collect();

        let hard = chunks.iter().filter(|c| c.hard_split).count();
        if hard > 0 {
            warn!("⚠️ {} 个文本块在句子内部硬切 (预算 {} tokens)", hard, budget);
        }
        debug!("拆分完成: {} 块，预算 {} tokens，模型 {}", chunks.len(), budget, model_id);

        chunks
    }

    fn fits(&self, source: &str, range: Range<usize>, model_id: &str, budget: usize) -> bool {
        self.estimator.estimate(&source[range], model_id) <= budget
    }

    /// 在某一结构层级上贪心合并相邻单元；单个单元超预算时下沉到更细的层级
    fn pack(
        &self,
        source: &str,
        range: Range<usize>,
        level: Level,
        model_id: &str,
        budget: usize,
        out: &mut Vec<Span>,
    ) {
        let cuts = level.boundaries(&source[range.clone()]);
        let mut current: Option<Range<usize>> = None;

        for piece in pieces(range, cuts) {
            if self.fits(source, piece.clone(), model_id, budget) {
                current = match current.take() {
                    Some(cur) if self.fits(source, cur.start..piece.end, model_id, budget) => {
                        Some(cur.start..piece.end)
                    }
                    Some(cur) => {
                        out.push(Span { range: cur, hard: false });
                        Some(piece)
                    }
                    None => Some(piece),
                };
                continue;
            }

            if let Some(cur) = current.take() {
                out.push(Span { range: cur, hard: false });
            }
            match level.next() {
                Some(next) => self.pack(source, piece, next, model_id, budget, out),
                None => self.hard_split(source, piece, model_id, budget, out),
            }
        }

        if let Some(cur) = current {
            out.push(Span { range: cur, hard: false });
        }
    }

    /// 取不超预算的最长字符前缀（至少一个字符）
    fn hard_split(
        &self,
        source: &str,
        range: Range<usize>,
        model_id: &str,
        budget: usize,
        out: &mut Vec<Span>,
    ) {
        let piece = &source[range.clone()];
        let ends: Vec<usize> = piece.char_indices().map(|(i, c)| i + c.len_utf8()).collect();
        let mut from = 0;
        let mut idx = 0;

        while idx < ends.len() {
            let window = &ends[idx..];
            let fit = window.partition_point(|&end| {
                self.estimator.estimate(&piece[from..end], model_id) <= budget
            });
            let take = fit.max(1);
            let end = window[take - 1];
            out.push(Span {
                range: range.start + from..range.start + end,
                hard: true,
            });
            from = end;
            idx += take;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter() -> ChunkSplitter {
        ChunkSplitter::new(TokenEstimator::default(), Arc::new(ModelCatalog::builtin()))
    }

    fn joined(chunks: &[TextChunk]) -> String {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(splitter().split("", "gpt-4o", 0.8).is_empty());
    }

    #[test]
    fn test_text_under_budget_is_single_identical_chunk() {
        let text = "# 第一章\n\n短小的正文。";
        let chunks = splitter().split(text, "deepseek-v3", 0.8);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert!(!chunks[0].hard_split);
    }

    #[test]
    fn test_prefers_section_then_paragraph_boundaries() {
        let text = "# 一\n甲段落内容。\n\n乙段落内容。\n# 二\n丙段落内容。";
        let s = splitter();
        let budget = s.estimate("# 一\n甲段落内容。\n\n乙段落内容。\n", "gpt-4o");
        let chunks = s.split_with_budget(text, "gpt-4o", budget);

        assert_eq!(joined(&chunks), text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.starts_with("# 二"));
        assert!(chunks.iter().all(|c| c.token_count <= budget && !c.hard_split));
    }

    #[test]
    fn test_sentence_and_hard_split_respect_budget() {
        let text = "这是一个没有任何标点而且非常非常长的句子用来触发硬切逻辑的测试文本内容".repeat(4);
        let s = splitter();
        let chunks = s.split_with_budget(&text, "gpt-4o", 10);

        assert_eq!(joined(&chunks), text);
        assert!(chunks.iter().all(|c| c.token_count <= 10));
        assert!(chunks.iter().any(|c| c.hard_split));
        assert!(chunks.iter().enumerate().all(|(i, c)| c.index == i));
    }

    #[test]
    fn test_sentence_boundaries() {
        let cuts = sentence_boundaries("甲。乙！c. d");
        assert_eq!(cuts, vec!["甲。".len(), "甲。乙！".len(), "甲。乙！c.".len()]);
    }
}
