//! 应用生命周期 - 编排层
//!
//! 四个命令：
//! - `grade`：扫描 → 续跑过滤 → 并发批改 → 生成报告
//! - `build`：只编译，输出成功 / 失败统计，不写进度日志
//! - `report`：只从进度日志重新生成报告
//! - `clear`：删除工作目录以及结果目录中除 `.log` 以外的文件

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::infrastructure::workspace::remove_work_root;
use crate::models::{load_test_cases, Submission, TestCaseStore};
use crate::orchestrator::batch_processor::{RunSummary, Scheduler, Selection};
use crate::services::report::generate_reports;
use crate::services::{
    Compiler, Discovery, Journal, JournalSnapshot, LlmService, ScoringOracle, UnconfiguredOracle,
};
use crate::utils::logging::{log_startup, log_units_loaded, print_final_stats, truncate_text};
use crate::workflow::GradingFlow;

/// 编译失败时在终端显示的诊断信息长度
const DIAGNOSTICS_PREVIEW: usize = 500;

/// 应用主结构
pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// 批改并生成报告
    pub async fn grade(&self, selection: Selection) -> Result<RunSummary> {
        let started = Instant::now();
        log_startup("批改模式", &self.config);

        // ========== 阶段 1: 环境检查 ==========
        Compiler::from_config(&self.config)
            .check_availability()
            .await?;

        let test_cases = load_test_cases(&self.config.test_cases_dir).await?;
        if test_cases.problem_count() == 0 {
            warn!("⚠️ 没有载入任何测试案例，所有单元都会记为 0 分");
        } else {
            info!("✓ 载入 {} 题的测试案例", test_cases.problem_count());
        }

        // ========== 阶段 2: 扫描与续跑过滤 ==========
        let units = self.discover()?;
        let snapshot = Journal::snapshot(&self.config.journal_path).await?;
        let total = units.len();
        let (pending, _skipped) = selection.plan(units, &snapshot);
        log_units_loaded(total, pending.len(), self.config.workers);

        if pending.is_empty() {
            info!("✓ 没有需要批改的单元");
            self.write_reports().await?;
            return Ok(RunSummary::default());
        }

        // ========== 阶段 3: 批改 ==========
        let oracle = self.build_oracle();
        let flow = Arc::new(GradingFlow::new(&self.config, Arc::new(test_cases), oracle));
        let journal = Arc::new(Journal::open(&self.config.journal_path).await?);
        let scheduler = Scheduler::new(flow, journal.clone(), self.config.workers);

        let summary = scheduler.run(pending, listen_for_interrupt()).await?;

        print_final_stats(&summary.tally, started.elapsed(), journal.path());
        if summary.lost > 0 {
            error!("❌ {} 个单元的任务异常退出，没有留下记录，请重新运行", summary.lost);
        }
        if summary.interrupted {
            warn!(
                "⚠️ 运行被中断，{} 个单元未开始，重新运行即可继续",
                summary.not_started
            );
        }

        // ========== 阶段 4: 报告 ==========
        self.write_reports().await?;
        Ok(summary)
    }

    /// 只编译，不测试不评分，也不写进度日志
    pub async fn build(&self, selection: Selection) -> Result<()> {
        let started = Instant::now();
        log_startup("编译模式", &self.config);

        Compiler::from_config(&self.config)
            .check_availability()
            .await?;

        let units = self.discover()?;
        let snapshot = Journal::snapshot(&self.config.journal_path).await?;
        let total = units.len();
        let (pending, _skipped) = selection.plan(units, &snapshot);
        log_units_loaded(total, pending.len(), self.config.workers);

        let flow = GradingFlow::new(
            &self.config,
            Arc::new(TestCaseStore::default()),
            Arc::new(UnconfiguredOracle),
        );

        let results: Vec<(Submission, _)> = stream::iter(pending)
            .map(|unit| {
                let flow = &flow;
                async move {
                    let build = flow.compile_only(&unit).await;
                    (unit, build)
                }
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut failures: Vec<_> = results.iter().filter(|(_, b)| !b.success).collect();
        failures.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        info!("\n{}", "=".repeat(60));
        info!("📊 编译统计");
        info!("{}", "=".repeat(60));
        info!("✅ 成功: {}", results.len() - failures.len());
        info!("❌ 失败: {}", failures.len());
        for (unit, build) in &failures {
            let reason = if build.timed_out { "编译超时" } else { "编译失败" };
            warn!("{} {}:\n{}", unit.id, reason, truncate_text(&build.diagnostics, DIAGNOSTICS_PREVIEW));
        }
        info!("⏱  耗时: {:.1}s", started.elapsed().as_secs_f64());
        info!("{}", "=".repeat(60));
        Ok(())
    }

    /// 只从进度日志生成报告
    pub async fn report(&self) -> Result<()> {
        log_startup("报告模式", &self.config);
        let snapshot = self.write_reports().await?;
        if snapshot.is_empty() {
            warn!("⚠️ 进度日志中没有任何记录: {}", self.config.journal_path.display());
        }
        Ok(())
    }

    /// 清除工作目录和结果文件（保留 `.log`）
    pub async fn clear(&self) -> Result<()> {
        if remove_work_root(&self.config.work_dir)
            .await
            .with_context(|| format!("无法删除工作目录: {}", self.config.work_dir.display()))?
        {
            info!("✓ 已删除工作目录: {}", self.config.work_dir.display());
        }

        let results_dir = self.config.results_dir.clone();
        let removed = tokio::task::spawn_blocking(move || clear_results(&results_dir))
            .await?
            .with_context(|| format!("无法清理结果目录: {}", self.config.results_dir.display()))?;
        info!("✓ 已删除结果目录中的 {} 个文件", removed);
        Ok(())
    }

    fn discover(&self) -> Result<Vec<Submission>> {
        info!("\n📁 正在扫描学生提交...");
        let discovery = Discovery::new(&self.config.student_id_pattern)?;
        let report = discovery.scan(&self.config.source_dir)?;
        if report.submissions.is_empty() {
            warn!("⚠️ 没有找到任何提交: {}", self.config.source_dir.display());
        }
        Ok(report.submissions)
    }

    fn build_oracle(&self) -> Arc<dyn ScoringOracle> {
        match LlmService::new(&self.config) {
            Some(service) => {
                info!(
                    "🤖 LLM 评分: {} ({} 个 key)",
                    self.config.llm_model_name,
                    self.config.llm_api_keys.len()
                );
                Arc::new(service)
            }
            None => {
                warn!("⚠️ 未配置 LLM_API_KEYS，部分通过的单元将记为评分失败");
                Arc::new(UnconfiguredOracle)
            }
        }
    }

    async fn write_reports(&self) -> Result<JournalSnapshot> {
        let snapshot = Journal::snapshot(&self.config.journal_path).await?;
        let paths = generate_reports(&snapshot, &self.config.results_dir).await?;
        info!("\n报告文件:");
        info!("  成绩表: {}", paths.score_sheet.display());
        info!("  摘要:   {}", paths.summary.display());
        info!("  明细:   {}", paths.details_dir.display());
        Ok(snapshot)
    }
}

/// Ctrl-C 时把停止信号发给调度器
fn listen_for_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });
    rx
}

/// 删除目录下所有非 `.log` 文件，再删掉变空的子目录，返回删除的文件数
fn clear_results(dir: &Path) -> std::io::Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            removed += clear_results(&path)?;
            if std::fs::read_dir(&path)?.next().is_none() {
                std::fs::remove_dir(&path)?;
            }
        } else if path.extension().map_or(true, |ext| ext != "log") {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
