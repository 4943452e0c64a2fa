/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::models::GenerationRequest;
use crate::orchestrator::generation_runner::RunSummary;

/// 初始化日志输出
///
/// 级别由 `RUST_LOG` 控制，默认 `info`。重复调用不会报错。
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `config`: 当前配置
/// - `models`: 已注册的模型
pub fn log_startup(config: &Config, models: &[&str]) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 教材语料生成");
    info!("📖 教材文件: {}", config.book_path);
    info!("🤖 可用模型: {}", models.join(", "));
    info!("📐 安全阈值比例: {}", config.safety_ratio);
    info!("{}", "=".repeat(60));
}

/// 记录任务开始信息
///
/// # 参数
/// - `request`: 生成请求
pub fn log_run_start(request: &GenerationRequest) {
    info!("\n{}", "─".repeat(60));
    info!("📦 共 {} 个章节，每章 {} 个条目", request.chapter_ids.len(), request.count);
    info!(
        "⚙️ 模型 {} | 模式 {} | 类别 {} | 语言 {}",
        request.model,
        request.mode,
        request.kind,
        request.language()
    );
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `summary`: 任务汇总
/// - `output_file`: 结果文件路径
pub fn print_final_stats(summary: &RunSummary, output_file: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功章节: {}/{}", summary.succeeded(), summary.chapters.len());
    info!("❌ 失败章节: {}", summary.failed());
    info!("📝 保存条目: {}", summary.saved_items());
    for report in summary.chapters.iter().filter(|c| !c.succeeded()) {
        info!(
            "   - 《{}》: {}",
            report.title,
            report.error.as_deref().unwrap_or_default()
        );
    }
    if summary.cancelled {
        info!("🛑 任务被取消");
    }
    info!("{}", "=".repeat(60));
    info!("\n结果已保存至: {}", output_file);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text_counts_chars() {
        assert_eq!(truncate_text("函数与极限", 2), "函数...");
        assert_eq!(truncate_text("abc", 5), "abc");
    }
}
