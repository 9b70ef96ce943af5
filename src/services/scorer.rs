//! 部分得分评分服务
//!
//! 全过 / 全错 / 编译失败直接给分，不调用评分预言机；
//! 只有通过与失败混合的单元才交给 `ScoringOracle`，并按 `RetryPolicy` 重试。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::ScoringError;
use crate::models::{BuildResult, ScoreSource, TestOutcome, UnitId};

/// 找不到测试数据时的说明
pub const NO_TEST_CASES: &str = "找不到对应测试数据";

/// 交给评分预言机的材料
#[derive(Debug, Clone, Copy)]
pub struct ScoringRequest<'a> {
    pub unit: &'a UnitId,
    pub source_code: &'a str,
    pub problem_description: Option<&'a str>,
    pub outcomes: &'a [TestOutcome],
    pub max_score: u32,
}

impl ScoringRequest<'_> {
    pub fn passed_tests(&self) -> usize {
        self.outcomes.iter().filter(|o| o.verdict.is_pass()).count()
    }

    pub fn total_tests(&self) -> usize {
        self.outcomes.len()
    }
}

/// 评分预言机的原始回复（未校验范围）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleScore {
    pub score: i64,
    pub rationale: String,
}

/// 外部评分预言机
///
/// `(源代码, 测试结果) -> (分数, 理由)`，可替换、可模拟。
#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn evaluate(&self, request: &ScoringRequest<'_>) -> Result<OracleScore, ScoringError>;
}

/// 最终评分
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreDecision {
    pub score: u32,
    pub source: ScoreSource,
    pub rationale: String,
}

/// 不需要预言机即可确定的分数
///
/// 返回 `None` 表示结果混合，需要交给预言机。
pub fn shortcut(build: &BuildResult, outcomes: &[TestOutcome], max_score: u32) -> Option<ScoreDecision> {
    if !build.success {
        return Some(ScoreDecision {
            score: 0,
            source: ScoreSource::AllFail,
            rationale: if build.timed_out {
                "编译超时".to_string()
            } else {
                "编译失败".to_string()
            },
        });
    }
    if outcomes.is_empty() {
        return Some(ScoreDecision {
            score: 0,
            source: ScoreSource::AllFail,
            rationale: NO_TEST_CASES.to_string(),
        });
    }

    let passed = outcomes.iter().filter(|o| o.verdict.is_pass()).count();
    if passed == outcomes.len() {
        Some(ScoreDecision {
            score: max_score,
            source: ScoreSource::AllPass,
            rationale: "全部测试通过".to_string(),
        })
    } else if passed == 0 {
        Some(ScoreDecision {
            score: 0,
            source: ScoreSource::AllFail,
            rationale: format!("全部 {} 个测试未通过", outcomes.len()),
        })
    } else {
        None
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Self::default()
        }
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            attempts: 0,
            next_backoff: self.initial_backoff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// 一次评分的重试状态
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
    next_backoff: Duration,
}

impl RetryState {
    /// 已失败的次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 记录一次失败并决定下一步
    pub fn on_failure(&mut self, error: &ScoringError) -> RetryDecision {
        self.attempts += 1;
        if !error.is_transient() || self.attempts >= self.policy.max_attempts {
            return RetryDecision::GiveUp;
        }
        let wait = self.next_backoff;
        self.next_backoff = (wait * self.policy.multiplier).min(self.policy.max_backoff);
        RetryDecision::RetryAfter(wait)
    }
}

/// 部分得分评分器
pub struct PartialCreditScorer {
    oracle: Arc<dyn ScoringOracle>,
    policy: RetryPolicy,
}

impl PartialCreditScorer {
    pub fn new(oracle: Arc<dyn ScoringOracle>, policy: RetryPolicy) -> Self {
        Self { oracle, policy }
    }

    /// 给一个单元评分
    ///
    /// 返回 `Err` 表示重试耗尽或遇到不可重试的错误，调用方应记为 `scoring_failed`。
    pub async fn score(
        &self,
        unit: &UnitId,
        source_path: &Path,
        problem_description: Option<&str>,
        build: &BuildResult,
        outcomes: &[TestOutcome],
        max_score: u32,
    ) -> Result<ScoreDecision, ScoringError> {
        if let Some(decision) = shortcut(build, outcomes, max_score) {
            debug!("[{}] 直接评分: {} 分 ({:?})", unit, decision.score, decision.source);
            return Ok(decision);
        }

        let source_code = tokio::fs::read(source_path)
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .map_err(|e| ScoringError::Permanent(format!("读取程序代码失败: {}", e)))?;

        let request = ScoringRequest {
            unit,
            source_code: &source_code,
            problem_description,
            outcomes,
            max_score,
        };
        info!(
            "[{}] 需要 LLM 评分 ({}/{})",
            unit,
            request.passed_tests(),
            request.total_tests()
        );

        let mut state = self.policy.start();
        loop {
            let error = match self.oracle.evaluate(&request).await {
                Ok(reply) => match validate_score(&reply, max_score) {
                    Ok(score) => {
                        info!("[{}] LLM 评分完成，得分 {}/{}", unit, score, max_score);
                        return Ok(ScoreDecision {
                            score,
                            source: ScoreSource::LlmPartial,
                            rationale: reply.rationale,
                        });
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            match state.on_failure(&error) {
                RetryDecision::RetryAfter(wait) => {
                    warn!(
                        "[{}] 第 {} 次评分失败: {}，{:?} 后重试",
                        unit,
                        state.attempts(),
                        error,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                }
                RetryDecision::GiveUp => {
                    warn!("[{}] 评分放弃（共 {} 次）: {}", unit, state.attempts(), error);
                    return Err(error);
                }
            }
        }
    }
}

fn validate_score(reply: &OracleScore, max_score: u32) -> Result<u32, ScoringError> {
    u32::try_from(reply.score)
        .ok()
        .filter(|score| *score <= max_score)
        .ok_or_else(|| {
            ScoringError::Transient(format!("分数 {} 超出范围 0..={}", reply.score, max_score))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Verdict;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 按脚本依次返回结果的预言机
    struct ScriptedOracle {
        replies: Mutex<VecDeque<Result<OracleScore, ScoringError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        fn new(replies: Vec<Result<OracleScore, ScoringError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ScoringOracle for ScriptedOracle {
        async fn evaluate(&self, _request: &ScoringRequest<'_>) -> Result<OracleScore, ScoringError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ScoringError::Permanent("脚本用完".into())))
        }
    }

    fn outcome(verdict: Verdict) -> TestOutcome {
        TestOutcome {
            case_index: 0,
            case_name: "1".into(),
            verdict,
            expected: "1\n".into(),
            stdout: "2\n".into(),
            stderr: String::new(),
            output_truncated: false,
            exit_code: Some(0),
            signal: None,
            elapsed_ms: 3,
            error: None,
        }
    }

    fn ok_build() -> BuildResult {
        BuildResult::succeeded(PathBuf::from("a.out"), 1)
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    fn source_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "int main() { return 0; }").unwrap();
        file
    }

    fn reply(score: i64) -> Result<OracleScore, ScoringError> {
        Ok(OracleScore {
            score,
            rationale: "逻辑部分正确".into(),
        })
    }

    #[test]
    fn test_shortcuts() {
        let failed = BuildResult::failed("error", false, 1);
        let d = shortcut(&failed, &[], 31).unwrap();
        assert_eq!((d.score, d.source), (0, ScoreSource::AllFail));

        let d = shortcut(&ok_build(), &[], 31).unwrap();
        assert_eq!(d.rationale, NO_TEST_CASES);

        let all_pass = vec![outcome(Verdict::Pass), outcome(Verdict::Pass)];
        let d = shortcut(&ok_build(), &all_pass, 31).unwrap();
        assert_eq!((d.score, d.source), (31, ScoreSource::AllPass));

        let all_fail = vec![outcome(Verdict::Fail), outcome(Verdict::Timeout)];
        let d = shortcut(&ok_build(), &all_fail, 31).unwrap();
        assert_eq!((d.score, d.source), (0, ScoreSource::AllFail));

        let mixed = vec![outcome(Verdict::Pass), outcome(Verdict::MemoryExceeded)];
        assert!(shortcut(&ok_build(), &mixed, 31).is_none());
    }

    #[test]
    fn test_retry_state_machine() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2,
            max_backoff: Duration::from_millis(300),
        };
        let transient = ScoringError::Transient("429".into());

        let mut state = policy.start();
        assert_eq!(state.on_failure(&transient), RetryDecision::RetryAfter(Duration::from_millis(100)));
        assert_eq!(state.on_failure(&transient), RetryDecision::RetryAfter(Duration::from_millis(200)));
        assert_eq!(state.on_failure(&transient), RetryDecision::RetryAfter(Duration::from_millis(300)));
        assert_eq!(state.on_failure(&transient), RetryDecision::GiveUp);
        assert_eq!(state.attempts(), 4);

        let mut state = policy.start();
        assert_eq!(
            state.on_failure(&ScoringError::Permanent("401".into())),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test]
    async fn test_all_pass_never_calls_oracle() {
        let oracle = ScriptedOracle::new(vec![]);
        let scorer = PartialCreditScorer::new(oracle.clone(), fast_policy(3));
        let unit = UnitId::new("A1", "1");

        let d = scorer
            .score(&unit, Path::new("/nonexistent"), None, &ok_build(), &[outcome(Verdict::Pass)], 31)
            .await
            .unwrap();
        assert_eq!(d.source, ScoreSource::AllPass);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mixed_retries_then_succeeds() {
        let oracle = ScriptedOracle::new(vec![
            Err(ScoringError::Transient("rate limited".into())),
            reply(99),
            reply(12),
        ]);
        let scorer = PartialCreditScorer::new(oracle.clone(), fast_policy(3));
        let source = source_file();
        let outcomes = vec![outcome(Verdict::Pass), outcome(Verdict::Fail)];

        let d = scorer
            .score(&UnitId::new("A1", "1"), source.path(), None, &ok_build(), &outcomes, 31)
            .await
            .unwrap();
        assert_eq!(d.score, 12);
        assert_eq!(d.source, ScoreSource::LlmPartial);
        assert_eq!(d.rationale, "逻辑部分正确");
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_is_error() {
        let oracle = ScriptedOracle::new(vec![
            Err(ScoringError::Transient("timeout".into())),
            Err(ScoringError::Transient("timeout".into())),
            reply(5),
        ]);
        let scorer = PartialCreditScorer::new(oracle.clone(), fast_policy(2));
        let source = source_file();
        let outcomes = vec![outcome(Verdict::Pass), outcome(Verdict::Fail)];

        let err = scorer
            .score(&UnitId::new("A1", "1"), source.path(), None, &ok_build(), &outcomes, 31)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let oracle = ScriptedOracle::new(vec![Err(ScoringError::Permanent("401".into())), reply(5)]);
        let scorer = PartialCreditScorer::new(oracle.clone(), fast_policy(5));
        let source = source_file();
        let outcomes = vec![outcome(Verdict::Pass), outcome(Verdict::Fail)];

        let err = scorer
            .score(&UnitId::new("A1", "1"), source.path(), None, &ok_build(), &outcomes, 31)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }
}
