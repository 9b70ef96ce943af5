//! 批改记录
//!
//! `GradingRecord` 是写入进度日志的最小持久单位。追加之后不再修改，
//! 重新批改只会追加一条时间戳更新的记录，回放时后者覆盖前者。

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::submission::UnitId;

/// 编译结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    /// 编译器诊断信息（失败时为 stderr / stdout，超时时为超时说明）
    pub diagnostics: String,
    /// 可执行文件路径，只有 `success` 为 true 时有效
    pub artifact: Option<PathBuf>,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

impl BuildResult {
    pub fn succeeded(artifact: PathBuf, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            diagnostics: String::new(),
            artifact: Some(artifact),
            timed_out: false,
            elapsed_ms,
        }
    }

    pub fn failed(diagnostics: impl Into<String>, timed_out: bool, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            diagnostics: diagnostics.into(),
            artifact: None,
            timed_out,
            elapsed_ms,
        }
    }
}

/// 单个测试案例的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Timeout,
    RuntimeError,
    MemoryExceeded,
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    /// 程序本身没有正常结束（与“输出不符”区分）
    pub fn is_abnormal(&self) -> bool {
        match self {
            Verdict::Pass | Verdict::Fail => false,
            Verdict::Timeout | Verdict::RuntimeError | Verdict::MemoryExceeded => true,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Pass => "通过",
            Verdict::Fail => "输出不符",
            Verdict::Timeout => "执行超时",
            Verdict::RuntimeError => "运行错误",
            Verdict::MemoryExceeded => "内存超限",
        }
    }
}

/// 单个测试案例的执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub case_index: usize,
    pub case_name: String,
    pub verdict: Verdict,
    /// 预期输出（可读形式）
    pub expected: String,
    /// 实际 stdout（可读形式，可能被截断）
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed_ms: u64,
    /// 非正常结束时的说明
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 分数来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    AllPass,
    AllFail,
    LlmPartial,
}

/// 记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// 已给出分数
    Graded,
    /// 评分预言机重试耗尽，等待重新运行或人工处理
    ScoringFailed,
    /// 流程中出现意外错误
    Errored,
}

/// 出错阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Workspace,
    Compile,
    Runtime,
    Scoring,
    Internal,
}

impl ErrorStage {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorStage::Workspace => "工作目录",
            ErrorStage::Compile => "编译",
            ErrorStage::Runtime => "运行",
            ErrorStage::Scoring => "评分",
            ErrorStage::Internal => "内部",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub stage: ErrorStage,
    pub message: String,
}

/// 运行结束统计用的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeCategory {
    /// 全过或全错，分数确定
    FullyGraded,
    /// 由 LLM 给出部分分数，建议人工复核
    NeedsReview,
    /// 某一阶段出错
    Errored(ErrorStage),
}

/// 批改记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingRecord {
    pub unit: UnitId,
    pub file_name: String,
    pub status: RecordStatus,
    /// 编译前就失败时为空
    pub build: Option<BuildResult>,
    pub outcomes: Vec<TestOutcome>,
    pub score: Option<u32>,
    pub score_source: Option<ScoreSource>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitError>,
    pub graded_at: DateTime<Utc>,
}

impl GradingRecord {
    /// 已评分的记录
    pub fn graded(
        unit: UnitId,
        file_name: String,
        build: BuildResult,
        outcomes: Vec<TestOutcome>,
        score: u32,
        source: ScoreSource,
        rationale: String,
    ) -> Self {
        Self {
            unit,
            file_name,
            status: RecordStatus::Graded,
            build: Some(build),
            outcomes,
            score: Some(score),
            score_source: Some(source),
            rationale,
            error: None,
            graded_at: Utc::now(),
        }
    }

    /// 评分失败的记录（测试结果保留，分数为空）
    pub fn scoring_failed(
        unit: UnitId,
        file_name: String,
        build: BuildResult,
        outcomes: Vec<TestOutcome>,
        message: String,
    ) -> Self {
        Self {
            unit,
            file_name,
            status: RecordStatus::ScoringFailed,
            build: Some(build),
            outcomes,
            score: None,
            score_source: None,
            rationale: String::new(),
            error: Some(UnitError {
                stage: ErrorStage::Scoring,
                message,
            }),
            graded_at: Utc::now(),
        }
    }

    /// 流程出错的记录
    pub fn errored(
        unit: UnitId,
        file_name: String,
        stage: ErrorStage,
        message: impl Into<String>,
    ) -> Self {
        Self {
            unit,
            file_name,
            status: RecordStatus::Errored,
            build: None,
            outcomes: Vec::new(),
            score: None,
            score_source: None,
            rationale: String::new(),
            error: Some(UnitError {
                stage,
                message: message.into(),
            }),
            graded_at: Utc::now(),
        }
    }

    /// 是否为终态；只有评分失败的记录允许下次运行重试
    pub fn is_terminal(&self) -> bool {
        self.status != RecordStatus::ScoringFailed
    }

    pub fn passed_tests(&self) -> usize {
        self.outcomes.iter().filter(|o| o.verdict.is_pass()).count()
    }

    pub fn total_tests(&self) -> usize {
        self.outcomes.len()
    }

    pub fn build_succeeded(&self) -> bool {
        self.build.as_ref().map(|b| b.success).unwrap_or(false)
    }

    pub fn category(&self) -> OutcomeCategory {
        match self.status {
            RecordStatus::ScoringFailed => OutcomeCategory::Errored(ErrorStage::Scoring),
            RecordStatus::Errored => OutcomeCategory::Errored(
                self.error
                    .as_ref()
                    .map(|e| e.stage)
                    .unwrap_or(ErrorStage::Internal),
            ),
            RecordStatus::Graded => match self.score_source {
                Some(ScoreSource::LlmPartial) => OutcomeCategory::NeedsReview,
                Some(ScoreSource::AllFail) if !self.build_succeeded() => {
                    OutcomeCategory::Errored(ErrorStage::Compile)
                }
                Some(ScoreSource::AllFail)
                    if !self.outcomes.is_empty()
                        && self.outcomes.iter().all(|o| o.verdict.is_abnormal()) =>
                {
                    OutcomeCategory::Errored(ErrorStage::Runtime)
                }
                _ => OutcomeCategory::FullyGraded,
            },
        }
    }
}

/// 按分类统计的记录数量
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub fully_graded: usize,
    pub needs_review: usize,
    pub errored: BTreeMap<ErrorStage, usize>,
}

impl OutcomeTally {
    pub fn add(&mut self, record: &GradingRecord) {
        match record.category() {
            OutcomeCategory::FullyGraded => self.fully_graded += 1,
            OutcomeCategory::NeedsReview => self.needs_review += 1,
            OutcomeCategory::Errored(stage) => *self.errored.entry(stage).or_default() += 1,
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a GradingRecord>) -> Self {
        let mut tally = Self::default();
        for record in records {
            tally.add(record);
        }
        tally
    }

    pub fn errored_total(&self) -> usize {
        self.errored.values().sum()
    }

    pub fn total(&self) -> usize {
        self.fully_graded + self.needs_review + self.errored_total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(index: usize, verdict: Verdict) -> TestOutcome {
        TestOutcome {
            case_index: index,
            case_name: index.to_string(),
            verdict,
            expected: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            exit_code: Some(0),
            signal: None,
            elapsed_ms: 1,
            error: None,
        }
    }

    #[test]
    fn test_verdict_serializes_snake_case() {
        let json = serde_json::to_string(&Verdict::MemoryExceeded).unwrap();
        assert_eq!(json, "\"memory_exceeded\"");
        let json = serde_json::to_string(&ScoreSource::LlmPartial).unwrap();
        assert_eq!(json, "\"llm_partial\"");
    }

    #[test]
    fn test_scoring_failed_is_not_terminal() {
        let record = GradingRecord::scoring_failed(
            UnitId::new("A1", "1"),
            "A1_p1.c".into(),
            BuildResult::succeeded(PathBuf::from("a.out"), 10),
            vec![outcome(0, Verdict::Pass), outcome(1, Verdict::Fail)],
            "重试耗尽".into(),
        );
        assert!(!record.is_terminal());
        assert_eq!(record.category(), OutcomeCategory::Errored(ErrorStage::Scoring));
        assert_eq!(record.passed_tests(), 1);
        assert_eq!(record.total_tests(), 2);
    }

    #[test]
    fn test_categories() {
        let unit = UnitId::new("A2", "1");
        let compile_failed = GradingRecord::graded(
            unit.clone(),
            "A2_p1.c".into(),
            BuildResult::failed("error: expected ';'", false, 5),
            Vec::new(),
            0,
            ScoreSource::AllFail,
            "编译失败".into(),
        );
        assert_eq!(
            compile_failed.category(),
            OutcomeCategory::Errored(ErrorStage::Compile)
        );

        let crashed = GradingRecord::graded(
            unit.clone(),
            "A2_p1.c".into(),
            BuildResult::succeeded(PathBuf::from("a.out"), 5),
            vec![outcome(0, Verdict::RuntimeError), outcome(1, Verdict::Timeout)],
            0,
            ScoreSource::AllFail,
            String::new(),
        );
        assert_eq!(crashed.category(), OutcomeCategory::Errored(ErrorStage::Runtime));

        let wrong = GradingRecord::graded(
            unit.clone(),
            "A2_p1.c".into(),
            BuildResult::succeeded(PathBuf::from("a.out"), 5),
            vec![outcome(0, Verdict::Fail)],
            0,
            ScoreSource::AllFail,
            String::new(),
        );
        assert_eq!(wrong.category(), OutcomeCategory::FullyGraded);

        let partial = GradingRecord::graded(
            unit,
            "A2_p1.c".into(),
            BuildResult::succeeded(PathBuf::from("a.out"), 5),
            vec![outcome(0, Verdict::Pass), outcome(1, Verdict::Fail)],
            12,
            ScoreSource::LlmPartial,
            "逻辑部分正确".into(),
        );
        assert_eq!(partial.category(), OutcomeCategory::NeedsReview);

        let tally = OutcomeTally::from_records([&compile_failed, &crashed, &wrong, &partial]);
        assert_eq!(tally.fully_graded, 1);
        assert_eq!(tally.needs_review, 1);
        assert_eq!(tally.errored.get(&ErrorStage::Compile), Some(&1));
        assert_eq!(tally.errored.get(&ErrorStage::Runtime), Some(&1));
        assert_eq!(tally.total(), 4);
    }
}
