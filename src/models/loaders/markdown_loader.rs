use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tokio::fs;

use crate::models::chapter::{NewChapter, REFERENCE_MODEL};
use crate::services::token_estimator::TokenEstimator;

/// 切分出的一个章节片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownSegment {
    pub title: String,
    pub level: u8,
    pub content: String,
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(#{1,6})\s+(.+?)\s*$").expect("heading regex"))
}

fn chapter_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(第[一二三四五六七八九十百零〇0-9]+章|Chapter\s+\d+|CHAPTER\s+\d+|附录)")
            .expect("chapter title regex")
    })
}

fn toc_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(\s*([-*]|\d+\.)\s+\[.*\]\(.*\)|\s*(#+\s*)?(目录|table of contents)\s*$|#\s*第[一二三四五六七八九十零〇0-9]+章.*\s\d+\s*$)",
        )
        .expect("toc regex")
    })
}

/// 从本地 markdown 文件加载书籍并切分为章节
pub async fn load_markdown_book(path: &Path, estimator: &TokenEstimator) -> Result<Vec<NewChapter>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("无法读取markdown文件: {}", path.display()))?;

    let fallback_title = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "全文".to_string());

    let chapters: Vec<NewChapter> = segment_markdown(&content, &fallback_title)
        .into_iter()
        .map(|segment| NewChapter {
            token_count: estimator.estimate(&segment.content, REFERENCE_MODEL),
            title: segment.title,
            level: segment.level,
            content_md: segment.content,
        })
        .collect();

    tracing::info!(
        "成功加载 {} 个章节: {}",
        chapters.len(),
        path.file_name().unwrap_or_default().to_string_lossy()
    );

    Ok(chapters)
}

/// 按章节标题切分 markdown 文本
///
/// 优先识别"第X章 / Chapter N / 附录"形式的标题；没有时退回到一级标题，
/// 再没有时整篇作为一个章节。目录行不会被当作章节起点。
/// 第一个章节之前的内容并入第一个章节。
pub fn segment_markdown(text: &str, fallback_title: &str) -> Vec<MarkdownSegment> {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    if text.trim().is_empty() {
        return Vec::new();
    }
    let lines: Vec<&str> = text.split('\n').collect();

    let headings: Vec<(usize, u8, String)> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| !toc_line_re().is_match(line))
        .filter_map(|(i, line)| {
            heading_re().captures(line).map(|caps| {
                let level = caps[1].len() as u8;
                (i, level, caps[2].trim().to_string())
            })
        })
        .collect();

    let strong: Vec<_> = headings
        .iter()
        .filter(|(_, _, title)| chapter_title_re().is_match(title))
        .cloned()
        .collect();

    let heads = if !strong.is_empty() {
        strong
    } else {
        headings.into_iter().filter(|(_, level, _)| *level == 1).collect()
    };

    if heads.is_empty() {
        return vec![MarkdownSegment {
            title: fallback_title.to_string(),
            level: 1,
            content: text,
        }];
    }

    let mut segments = Vec::with_capacity(heads.len());
    for (idx, (start, level, title)) in heads.iter().enumerate() {
        let begin = if idx == 0 { 0 } else { *start };
        let end = heads.get(idx + 1).map(|h| h.0).unwrap_or(lines.len());
        segments.push(MarkdownSegment {
            title: title.clone(),
            level: *level,
            content: lines[begin..end].join("\n"),
        });
    }
    segments
}
