//! 单元批改流程 - 流程层
//!
//! 核心职责：定义"一个提交"的完整批改流程
//!
//! 流程顺序：
//! 1. 准备工作目录
//! 2. 编译（失败直接 0 分）
//! 3. 逐个执行测试案例
//! 4. 评分（全过 / 全错直接给分，混合时调用 LLM）
//!
//! 每个阶段的失败都收进返回的 `GradingRecord`，不向上抛错。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::infrastructure::UnitWorkspace;
use crate::models::{BuildResult, ErrorStage, GradingRecord, Submission, TestCaseStore};
use crate::services::scorer::{PartialCreditScorer, RetryPolicy, ScoringOracle};
use crate::services::{Compiler, TestRunner};
use crate::workflow::unit_ctx::UnitCtx;

/// 单元批改流程的抽象，调度器只依赖这个接口
#[async_trait]
pub trait UnitPipeline: Send + Sync {
    /// 批改一个单元，总是返回一条终态或评分失败的记录
    async fn grade(&self, submission: &Submission, ctx: &UnitCtx) -> GradingRecord;
}

/// 单元批改流程
///
/// - 编排 编译 → 测试 → 评分
/// - 不写进度日志（由调度器在单元结束后追加）
/// - 只依赖业务能力（services）
pub struct GradingFlow {
    compiler: Compiler,
    runner: TestRunner,
    scorer: PartialCreditScorer,
    test_cases: Arc<TestCaseStore>,
    work_dir: PathBuf,
    max_score: u32,
    extra_max_score: u32,
}

impl GradingFlow {
    pub fn new(config: &Config, test_cases: Arc<TestCaseStore>, oracle: Arc<dyn ScoringOracle>) -> Self {
        let policy = RetryPolicy::new(
            config.llm_max_attempts,
            Duration::from_millis(config.llm_initial_backoff_ms),
        );
        Self {
            compiler: Compiler::from_config(config),
            runner: TestRunner::from_config(config),
            scorer: PartialCreditScorer::new(oracle, policy),
            test_cases,
            work_dir: config.work_dir.clone(),
            max_score: config.max_score,
            extra_max_score: config.extra_max_score,
        }
    }

    /// 只编译，不测试不评分
    pub async fn compile_only(&self, submission: &Submission) -> BuildResult {
        match UnitWorkspace::prepare(&self.work_dir, submission).await {
            Ok(workspace) => {
                self.compiler
                    .compile(
                        submission.language,
                        workspace.source_path(),
                        workspace.artifact_path(),
                    )
                    .await
            }
            Err(e) => BuildResult::failed(format!("建立工作目录失败: {}", e), false, 0),
        }
    }

    fn max_score_for(&self, submission: &Submission) -> u32 {
        if submission.id.is_extra() {
            self.extra_max_score
        } else {
            self.max_score
        }
    }
}

#[async_trait]
impl UnitPipeline for GradingFlow {
    async fn grade(&self, submission: &Submission, ctx: &UnitCtx) -> GradingRecord {
        let unit = submission.id.clone();
        let file_name = submission.file_name();
        info!("{} 开始批改 {}", ctx, file_name);

        // ========== 阶段 1: 工作目录 ==========
        let workspace = match UnitWorkspace::prepare(&self.work_dir, submission).await {
            Ok(workspace) => workspace,
            Err(e) => {
                warn!("{} ⚠️ 建立工作目录失败: {}", ctx, e);
                return GradingRecord::errored(
                    unit,
                    file_name,
                    ErrorStage::Workspace,
                    format!("建立工作目录失败: {}", e),
                );
            }
        };

        // ========== 阶段 2: 编译 ==========
        let build = self
            .compiler
            .compile(
                submission.language,
                workspace.source_path(),
                workspace.artifact_path(),
            )
            .await;
        if build.success {
            debug!("{} 编译成功 ({} ms)", ctx, build.elapsed_ms);
        } else {
            info!("{} ❌ 编译失败{}", ctx, if build.timed_out { "（超时）" } else { "" });
        }

        // ========== 阶段 3: 测试 ==========
        let cases = self.test_cases.cases_for(&unit.problem);
        let outcomes = match (&build.artifact, build.success) {
            (Some(artifact), true) if !cases.is_empty() => {
                let results_dir = workspace.results_dir();
                self.runner.run(artifact, &cases, Some(&results_dir)).await
            }
            (_, true) => {
                warn!("{} ⚠️ 找不到 {} 的测试数据", ctx, unit.problem_key());
                Vec::new()
            }
            _ => Vec::new(),
        };
        if !outcomes.is_empty() {
            let passed = outcomes.iter().filter(|o| o.verdict.is_pass()).count();
            info!("{} 🧪 测试通过 {}/{}", ctx, passed, outcomes.len());
        }

        // ========== 阶段 4: 评分 ==========
        let max_score = self.max_score_for(submission);
        let description = self.test_cases.description_for(&unit.problem);
        match self
            .scorer
            .score(
                &unit,
                workspace.source_path(),
                description.as_deref(),
                &build,
                &outcomes,
                max_score,
            )
            .await
        {
            Ok(decision) => {
                info!(
                    "{} ✓ 得分 {}/{} ({:?})",
                    ctx, decision.score, max_score, decision.source
                );
                GradingRecord::graded(
                    unit,
                    file_name,
                    build,
                    outcomes,
                    decision.score,
                    decision.source,
                    decision.rationale,
                )
            }
            Err(e) => {
                warn!("{} ⚠️ 评分失败，留待重跑: {}", ctx, e);
                GradingRecord::scoring_failed(unit, file_name, build, outcomes, e.to_string())
            }
        }
    }
}
