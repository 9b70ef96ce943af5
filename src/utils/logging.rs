/// 日志工具模块
///
/// 初始化日志输出，并提供运行开始 / 结束时的横幅输出
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::Config;
use crate::models::OutcomeTally;

/// 持有后台写日志线程，drop 时刷新剩余日志
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// 初始化日志
///
/// - 终端：`RUST_LOG` 优先，否则 info（verbose 时 debug）
/// - `<results_dir>/console.log`：info 及以上
/// - `<results_dir>/debug.log`：本程序的 debug 及以上
pub fn init_logging(results_dir: &Path, verbose: bool) -> Result<LogGuards> {
    std::fs::create_dir_all(results_dir)?;

    let (console_file, console_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(results_dir, "console.log"));
    let (debug_file, debug_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(results_dir, "debug.log"));

    let level = if verbose { "debug" } else { "info" };
    let terminal_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,lazy_grader={}", level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(terminal_filter))
        .with(
            fmt::layer()
                .with_writer(console_file)
                .with_ansi(false)
                .with_target(false)
                .with_filter(LevelFilter::INFO),
        )
        .with(
            fmt::layer()
                .with_writer(debug_file)
                .with_ansi(false)
                .with_filter(
                    Targets::new()
                        .with_target("lazy_grader", Level::DEBUG)
                        .with_default(Level::INFO),
                ),
        )
        .try_init()?;

    Ok(LogGuards {
        _guards: vec![console_guard, debug_guard],
    })
}

/// 记录程序启动信息
pub fn log_startup(command: &str, config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - {}", command);
    info!("📂 提交目录: {}", config.source_dir.display());
    info!("🧪 测试目录: {}", config.test_cases_dir.display());
    info!("📊 并发数: {}", config.workers);
    info!(
        "⏱  编译超时 {}s / 测试超时 {}s / 内存上限 {}MB",
        config.compile_timeout_secs, config.test_timeout_secs, config.memory_limit_mb
    );
    info!("{}", "=".repeat(60));
}

/// 记录待批改单元信息
pub fn log_units_loaded(total: usize, pending: usize, workers: usize) {
    info!("✓ 共 {} 个提交，其中 {} 个需要批改", total, pending);
    if total > pending {
        info!("⏭  {} 个已有终态记录，跳过", total - pending);
    }
    info!("📋 最多同时批改 {} 个\n", workers);
}

/// 打印最终统计信息
pub fn print_final_stats(tally: &OutcomeTally, elapsed: Duration, journal_path: &Path) {
    info!("\n{}", "=".repeat(60));
    info!("📊 本次批改统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 完全评分: {}", tally.fully_graded);
    info!("🔍 需要复核: {}", tally.needs_review);
    info!("❌ 出错: {}", tally.errored_total());
    for (stage, count) in &tally.errored {
        info!("   - {}: {}", stage.label(), count);
    }
    info!("⏱  耗时: {:.1}s", elapsed.as_secs_f64());
    info!("{}", "=".repeat(60));
    info!("\n进度日志: {}", journal_path.display());
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
