//! 批量批改调度器 - 编排层
//!
//! ## 职责
//!
//! 把一次运行中需要批改的单元分派给有限数量的并发 worker，
//! 每个单元结束后立即把记录追加到进度日志。
//!
//! ## 核心功能
//!
//! 1. **续跑过滤**：根据启动时重放的进度日志快照跳过已有终态记录的单元
//! 2. **并发控制**：Semaphore 限制同时在跑的单元数量
//! 3. **故障隔离**：单元内的 panic 被捕获并记为 `internal` 错误，不影响其他单元
//! 4. **即时落盘**：单元达到终态后立即追加记录，不在结束时批量写
//! 5. **中断处理**：收到停止信号后不再分派新单元，等待在跑单元完成
//!
//! ## 设计特点
//!
//! - 只依赖 `UnitPipeline` 接口，不关心单元内部怎样编译、测试、评分
//! - 进度日志写入失败是致命错误：中止所有在跑任务并返回错误

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::error::JournalError;
use crate::models::{ErrorStage, GradingRecord, OutcomeTally, Submission};
use crate::services::{Journal, JournalSnapshot};
use crate::workflow::{UnitCtx, UnitPipeline};

/// 本次运行要处理哪些单元
#[derive(Debug, Clone, Default)]
pub enum Selection {
    /// 所有尚无终态记录的单元
    #[default]
    Pending,
    /// 只处理这些学生，且无论是否已完成都重新批改
    Students(HashSet<String>),
}

impl Selection {
    /// 从 `a,b,c` 形式的参数解析；空列表等同于 `Pending`
    pub fn from_students<I, S>(students: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: HashSet<String> = students
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if set.is_empty() {
            Selection::Pending
        } else {
            Selection::Students(set)
        }
    }

    /// 按选择和进度日志快照筛出要分派的单元，返回 (待处理, 跳过数)
    pub fn plan(&self, units: Vec<Submission>, snapshot: &JournalSnapshot) -> (Vec<Submission>, usize) {
        let total = units.len();
        let pending: Vec<Submission> = match self {
            Selection::Pending => units
                .into_iter()
                .filter(|unit| !snapshot.is_done(&unit.id))
                .collect(),
            Selection::Students(students) => units
                .into_iter()
                .filter(|unit| students.contains(&unit.id.student_id))
                .collect(),
        };
        let skipped = total - pending.len();
        (pending, skipped)
    }
}

/// 一次运行的统计
#[derive(Debug, Default)]
pub struct RunSummary {
    /// 实际分派的单元数
    pub dispatched: usize,
    /// 已完成并写入进度日志的单元数
    pub completed: usize,
    /// 因中断而未分派的单元数
    pub not_started: usize,
    /// 任务异常退出、没有留下记录的单元数
    pub lost: usize,
    pub interrupted: bool,
    pub tally: OutcomeTally,
}

/// 批量批改调度器
pub struct Scheduler {
    pipeline: Arc<dyn UnitPipeline>,
    journal: Arc<Journal>,
    workers: usize,
}

enum Event {
    Shutdown,
    Finished(Result<Result<GradingRecord, JournalError>, JoinError>),
    Permit(OwnedSemaphorePermit),
}

impl Scheduler {
    pub fn new(pipeline: Arc<dyn UnitPipeline>, journal: Arc<Journal>, workers: usize) -> Self {
        Self {
            pipeline,
            journal,
            workers: workers.max(1),
        }
    }

    /// 批改给定的全部单元
    ///
    /// 每个单元恰好分派一次，最多 `workers` 个同时在跑。
    /// `shutdown` 变为 `true` 后停止分派，已在跑的单元照常完成并落盘。
    pub async fn run(
        &self,
        units: Vec<Submission>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary, JournalError> {
        let total = units.len();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<Result<GradingRecord, JournalError>> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut queue = units.into_iter().enumerate();
        let mut next = queue.next();

        while next.is_some() {
            let event = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => Event::Shutdown,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => Event::Finished(joined),
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => Event::Permit(permit),
                    Err(_) => Event::Shutdown,
                },
            };

            match event {
                Event::Shutdown => {
                    warn!("⚠️ 收到中断信号，停止分派新单元，等待在跑单元完成...");
                    summary.interrupted = true;
                    break;
                }
                Event::Finished(joined) => {
                    if let Err(e) = settle(joined, &mut summary) {
                        tasks.abort_all();
                        return Err(e);
                    }
                }
                Event::Permit(permit) => {
                    if let Some((index, unit)) = next.take() {
                        let ctx = UnitCtx::new(unit.id.clone(), index + 1, total);
                        tasks.spawn(grade_unit(
                            self.pipeline.clone(),
                            self.journal.clone(),
                            unit,
                            ctx,
                            permit,
                        ));
                        summary.dispatched += 1;
                    }
                    next = queue.next();
                }
            }
        }

        summary.not_started = next.map(|_| 1).unwrap_or(0) + queue.count();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = settle(joined, &mut summary) {
                tasks.abort_all();
                return Err(e);
            }
        }

        info!(
            "调度结束: 分派 {} 个，完成 {} 个，未开始 {} 个",
            summary.dispatched, summary.completed, summary.not_started
        );
        Ok(summary)
    }
}

/// 批改一个单元并立即落盘
async fn grade_unit(
    pipeline: Arc<dyn UnitPipeline>,
    journal: Arc<Journal>,
    unit: Submission,
    ctx: UnitCtx,
    permit: OwnedSemaphorePermit,
) -> Result<GradingRecord, JournalError> {
    let _permit = permit;

    let record = match AssertUnwindSafe(pipeline.grade(&unit, &ctx))
        .catch_unwind()
        .await
    {
        Ok(record) => record,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!("{} ❌ 批改过程中发生内部错误: {}", ctx, message);
            GradingRecord::errored(
                unit.id.clone(),
                unit.file_name(),
                ErrorStage::Internal,
                format!("内部错误: {}", message),
            )
        }
    };

    journal.append(&record).await?;
    Ok(record)
}

fn settle(
    joined: Result<Result<GradingRecord, JournalError>, JoinError>,
    summary: &mut RunSummary,
) -> Result<(), JournalError> {
    match joined {
        Ok(Ok(record)) => {
            summary.completed += 1;
            summary.tally.add(&record);
            Ok(())
        }
        Ok(Err(e)) => {
            error!("❌ 进度日志写入失败，终止本次运行: {}", e);
            Err(e)
        }
        Err(e) => {
            error!("任务执行失败: {}", e);
            summary.lost += 1;
            Ok(())
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // 发送端已经关闭，不会再有中断信号
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BuildResult, Language, RecordStatus, ScoreSource, UnitId};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn unit(student: &str, problem: &str) -> Submission {
        Submission::new(
            UnitId::new(student, problem),
            Language::C,
            PathBuf::from(format!("{}/{}_p{}.c", student, student, problem)),
        )
    }

    fn graded(submission: &Submission) -> GradingRecord {
        GradingRecord::graded(
            submission.id.clone(),
            submission.file_name(),
            BuildResult::failed("error", false, 1),
            Vec::new(),
            0,
            ScoreSource::AllFail,
            String::new(),
        )
    }

    /// 记录并发峰值，可以对指定学生 panic
    #[derive(Default)]
    struct FakePipeline {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        panic_for: Option<String>,
    }

    #[async_trait]
    impl UnitPipeline for FakePipeline {
        async fn grade(&self, submission: &Submission, _ctx: &UnitCtx) -> GradingRecord {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.panic_for.as_deref() == Some(submission.id.student_id.as_str()) {
                panic!("boom");
            }
            graded(submission)
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        rx
    }

    #[tokio::test]
    async fn test_fifty_units_eight_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.jsonl");
        let journal = Arc::new(Journal::open(&path).await.unwrap());
        let pipeline = Arc::new(FakePipeline::default());
        let scheduler = Scheduler::new(pipeline.clone(), journal, 8);

        let units: Vec<_> = (0..50).map(|i| unit(&format!("S{:02}", i), "1")).collect();
        let summary = scheduler.run(units, no_shutdown()).await.unwrap();

        assert_eq!(summary.dispatched, 50);
        assert_eq!(summary.completed, 50);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 50);
        assert!(pipeline.peak.load(Ordering::SeqCst) <= 8);

        let records = Journal::load(&path).await.unwrap();
        assert_eq!(records.len(), 50);
        let distinct: HashSet<_> = records.iter().map(|r| r.unit.clone()).collect();
        assert_eq!(distinct.len(), 50);
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.jsonl");
        let journal = Arc::new(Journal::open(&path).await.unwrap());
        let pipeline = Arc::new(FakePipeline {
            panic_for: Some("B".to_string()),
            ..Default::default()
        });
        let scheduler = Scheduler::new(pipeline, journal, 2);

        let units = vec![unit("A", "1"), unit("B", "1"), unit("C", "1")];
        let summary = scheduler.run(units, no_shutdown()).await.unwrap();
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.tally.errored.get(&ErrorStage::Internal), Some(&1));

        let snapshot = Journal::snapshot(&path).await.unwrap();
        let broken = snapshot.get(&UnitId::new("B", "1")).unwrap();
        assert_eq!(broken.status, RecordStatus::Errored);
        assert!(broken.error.as_ref().unwrap().message.contains("boom"));
        assert_eq!(
            snapshot.get(&UnitId::new("A", "1")).unwrap().status,
            RecordStatus::Graded
        );
    }

    #[tokio::test]
    async fn test_shutdown_before_start_dispatches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.jsonl");
        let journal = Arc::new(Journal::open(&path).await.unwrap());
        let pipeline = Arc::new(FakePipeline::default());
        let scheduler = Scheduler::new(pipeline.clone(), journal, 2);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let units = vec![unit("A", "1"), unit("B", "1")];
        let summary = scheduler.run(units, rx).await.unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.not_started, 2);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 0);
    }

    /// 每个单元都停在闸门前，直到测试打开闸门
    struct GatedPipeline {
        started: AtomicUsize,
        gate: watch::Receiver<bool>,
    }

    #[async_trait]
    impl UnitPipeline for GatedPipeline {
        async fn grade(&self, submission: &Submission, _ctx: &UnitCtx) -> GradingRecord {
            self.started.fetch_add(1, Ordering::SeqCst);
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
            graded(submission)
        }
    }

    #[tokio::test]
    async fn test_shutdown_lets_in_flight_units_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.jsonl");
        let journal = Arc::new(Journal::open(&path).await.unwrap());
        let (gate_tx, gate_rx) = watch::channel(false);
        let pipeline = Arc::new(GatedPipeline {
            started: AtomicUsize::new(0),
            gate: gate_rx,
        });
        let scheduler = Scheduler::new(pipeline.clone(), journal, 2);

        let (stop_tx, stop_rx) = watch::channel(false);
        let units: Vec<_> = (0..5).map(|i| unit(&format!("S{}", i), "1")).collect();
        let run = tokio::spawn(async move { scheduler.run(units, stop_rx).await });

        for _ in 0..200 {
            if pipeline.started.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pipeline.started.load(Ordering::SeqCst), 2);

        // 两个单元在跑时中断，然后放行
        stop_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate_tx.send(true).unwrap();

        let summary = run.await.unwrap().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.not_started, 3);
        assert_eq!(pipeline.started.load(Ordering::SeqCst), 2);

        let journaled: HashSet<_> = Journal::load(&path)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.unit)
            .collect();
        let expected: HashSet<_> = [UnitId::new("S0", "1"), UnitId::new("S1", "1")].into();
        assert_eq!(journaled, expected);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_journal_write_failure_aborts_run() {
        // 写入 /dev/full 总是返回 ENOSPC
        let journal = Arc::new(Journal::open(Path::new("/dev/full")).await.unwrap());
        let pipeline = Arc::new(FakePipeline::default());
        let scheduler = Scheduler::new(pipeline.clone(), journal, 1);

        let units: Vec<_> = (0..5).map(|i| unit(&format!("S{}", i), "1")).collect();
        let err = scheduler.run(units, no_shutdown()).await.unwrap_err();

        assert!(matches!(err, JournalError::Write { .. }));
        assert!(pipeline.calls.load(Ordering::SeqCst) < 5);
    }

    #[test]
    fn test_plan_skips_done_units() {
        let done = unit("A", "1");
        let retry = unit("A", "2");
        let mut failed = graded(&retry);
        failed.status = RecordStatus::ScoringFailed;
        let snapshot = JournalSnapshot::from_records(vec![graded(&done), failed]);

        let units = vec![done.clone(), retry.clone(), unit("B", "1")];
        let (pending, skipped) = Selection::Pending.plan(units, &snapshot);
        assert_eq!(skipped, 1);
        let ids: Vec<_> = pending.iter().map(|u| u.id.clone()).collect();
        assert_eq!(ids, vec![retry.id, UnitId::new("B", "1")]);
    }

    #[test]
    fn test_plan_selected_students_are_regraded() {
        let done = unit("A", "1");
        let snapshot = JournalSnapshot::from_records(vec![graded(&done)]);

        let selection = Selection::from_students(["A", " "]);
        let units = vec![done.clone(), unit("B", "1")];
        let (pending, skipped) = selection.plan(units, &snapshot);
        assert_eq!(skipped, 1);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, done.id);

        assert!(matches!(
            Selection::from_students(Vec::<String>::new()),
            Selection::Pending
        ));
    }
}
