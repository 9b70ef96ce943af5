//! 报告服务
//!
//! 只读取回放后的进度日志快照，生成：
//! - `grades.csv`：每个学生一行，每个题目一对（分数, 原因）列
//! - `summary.txt`：各分类数量以及需要复核 / 出错的单元清单
//! - `detailed_logs/<学号>.txt`：每个学生的编译、测试、评分明细

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::models::{GradingRecord, OutcomeCategory, OutcomeTally, RecordStatus, Verdict};
use crate::services::journal::JournalSnapshot;
use crate::utils::logging::truncate_text;

/// 生成的报告文件
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub score_sheet: PathBuf,
    pub summary: PathBuf,
    pub details_dir: PathBuf,
}

/// 生成全部报告
pub async fn generate_reports(snapshot: &JournalSnapshot, results_dir: &Path) -> Result<ReportPaths> {
    let paths = ReportPaths {
        score_sheet: results_dir.join("grades.csv"),
        summary: results_dir.join("summary.txt"),
        details_dir: results_dir.join("detailed_logs"),
    };

    tokio::fs::create_dir_all(&paths.details_dir)
        .await
        .with_context(|| format!("无法创建报告目录: {}", paths.details_dir.display()))?;

    tokio::fs::write(&paths.score_sheet, render_score_sheet(snapshot))
        .await
        .with_context(|| format!("无法写入成绩表: {}", paths.score_sheet.display()))?;
    info!("成绩表已生成: {}", paths.score_sheet.display());

    tokio::fs::write(&paths.summary, render_summary(snapshot))
        .await
        .with_context(|| format!("无法写入摘要: {}", paths.summary.display()))?;
    info!("摘要已生成: {}", paths.summary.display());

    let by_student = group_by_student(snapshot);
    for (student, records) in &by_student {
        let path = paths.details_dir.join(format!("{}.txt", student));
        tokio::fs::write(&path, render_transcript(student, records))
            .await
            .with_context(|| format!("无法写入明细: {}", path.display()))?;
    }
    info!("已生成 {} 位学生的明细", by_student.len());

    Ok(paths)
}

fn group_by_student(snapshot: &JournalSnapshot) -> BTreeMap<&str, Vec<&GradingRecord>> {
    let mut groups: BTreeMap<&str, Vec<&GradingRecord>> = BTreeMap::new();
    for record in snapshot.records() {
        groups
            .entry(record.unit.student_id.as_str())
            .or_default()
            .push(record);
    }
    groups
}

/// 成绩表（带 BOM 的 UTF-8 CSV，方便表格软件直接打开）
pub fn render_score_sheet(snapshot: &JournalSnapshot) -> String {
    let records = snapshot.records();
    let problems: BTreeSet<String> = records.iter().map(|r| r.unit.problem_key()).collect();

    let mut out = String::from("\u{feff}");
    let mut header = vec!["学号".to_string()];
    for key in &problems {
        header.push(key.clone());
        header.push(format!("{}原因", key));
    }
    header.push("总分".to_string());
    header.push("异常".to_string());
    push_row(&mut out, &header);

    for (student, records) in group_by_student(snapshot) {
        let by_key: BTreeMap<String, &GradingRecord> =
            records.iter().map(|r| (r.unit.problem_key(), *r)).collect();

        let mut row = vec![student.to_string()];
        let mut total = 0u32;
        let mut issues = Vec::new();

        for key in &problems {
            match by_key.get(key) {
                Some(record) => {
                    row.push(record.score.map(|s| s.to_string()).unwrap_or_default());
                    row.push(record.rationale.clone());
                    total += record.score.unwrap_or(0);
                    if let Some(issue) = issue_of(record) {
                        issues.push(format!("{}: {}", key, issue));
                    }
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }

        row.push(total.to_string());
        row.push(issues.join("; "));
        push_row(&mut out, &row);
    }

    out
}

fn issue_of(record: &GradingRecord) -> Option<String> {
    match record.category() {
        OutcomeCategory::FullyGraded => None,
        OutcomeCategory::NeedsReview => Some("LLM 部分给分，建议复核".to_string()),
        OutcomeCategory::Errored(stage) => Some(match &record.error {
            Some(error) => format!("{}错误 {}", stage.label(), truncate_text(&error.message, 80)),
            None => format!("{}错误", stage.label()),
        }),
    }
}

fn push_row(out: &mut String, fields: &[String]) {
    let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
    out.push_str(&line.join(","));
    out.push_str("\r\n");
}

/// CSV 字段：清理控制字符，必要时加引号
fn csv_field(raw: &str) -> String {
    let cleaned = clean_control_chars(raw);
    if cleaned.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cleaned.replace('"', "\"\""))
    } else {
        cleaned
    }
}

/// 去掉 ANSI 颜色码和换行、制表符以外的控制字符
fn clean_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            while let Some(&next) = chars.peek() {
                chars.next();
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        if c.is_control() && !matches!(c, '\n' | '\r' | '\t') {
            continue;
        }
        out.push(c);
    }
    out
}

/// 文字摘要
pub fn render_summary(snapshot: &JournalSnapshot) -> String {
    let records = snapshot.records();
    let tally = OutcomeTally::from_records(records.iter().copied());

    let mut verdicts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for outcome in records.iter().flat_map(|r| r.outcomes.iter()) {
        *verdicts.entry(outcome.verdict.label()).or_default() += 1;
    }

    let mut out = String::new();
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out, "批改摘要");
    let _ = writeln!(out, "{}", "=".repeat(60));
    let _ = writeln!(out, "批改单元: {}", tally.total());
    let _ = writeln!(out, "完全评分: {}", tally.fully_graded);
    let _ = writeln!(out, "需要复核: {}", tally.needs_review);
    let _ = writeln!(out, "出错: {}", tally.errored_total());
    for (stage, count) in &tally.errored {
        let _ = writeln!(out, "  - {}: {}", stage.label(), count);
    }

    let _ = writeln!(out, "\n测试案例判定:");
    for verdict in [
        Verdict::Pass,
        Verdict::Fail,
        Verdict::Timeout,
        Verdict::RuntimeError,
        Verdict::MemoryExceeded,
    ] {
        let count = verdicts.get(verdict.label()).copied().unwrap_or(0);
        let _ = writeln!(out, "  {}: {}", verdict.label(), count);
    }

    let review: Vec<&&GradingRecord> = records
        .iter()
        .filter(|r| r.category() == OutcomeCategory::NeedsReview)
        .collect();
    if !review.is_empty() {
        let _ = writeln!(out, "\n需要复核:");
        for record in review {
            let _ = writeln!(
                out,
                "  {} {} 分 ({}/{})",
                record.unit,
                record.score.unwrap_or(0),
                record.passed_tests(),
                record.total_tests()
            );
        }
    }

    let errored: Vec<(&&GradingRecord, String)> = records
        .iter()
        .filter_map(|r| match r.category() {
            OutcomeCategory::Errored(_) => issue_of(r).map(|issue| (r, issue)),
            _ => None,
        })
        .collect();
    if !errored.is_empty() {
        let _ = writeln!(out, "\n出错单元:");
        for (record, issue) in errored {
            let _ = writeln!(out, "  {} {}", record.unit, issue);
        }
    }

    out
}

/// 单个学生的明细
pub fn render_transcript(student: &str, records: &[&GradingRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "学号: {}", student);
    let _ = writeln!(out, "{}", "=".repeat(60));

    for record in records {
        let _ = writeln!(out, "\n{} ({})", record.unit.problem_key(), record.file_name);
        let _ = writeln!(out, "{}", "-".repeat(60));
        let _ = writeln!(out, "批改时间: {}", record.graded_at.format("%Y-%m-%d %H:%M:%S UTC"));

        match &record.build {
            Some(build) if build.success => {
                let _ = writeln!(out, "编译: 成功 ({} ms)", build.elapsed_ms);
            }
            Some(build) => {
                let _ = writeln!(out, "编译: 失败");
                let _ = writeln!(out, "{}", build.diagnostics.trim_end());
            }
            None => {
                let _ = writeln!(out, "编译: 未执行");
            }
        }

        if !record.outcomes.is_empty() {
            let _ = writeln!(
                out,
                "测试: 通过 {}/{}",
                record.passed_tests(),
                record.total_tests()
            );
            for outcome in &record.outcomes {
                let _ = writeln!(
                    out,
                    "  [{}] {} ({} ms)",
                    outcome.case_name,
                    outcome.verdict.label(),
                    outcome.elapsed_ms
                );
                if let Some(error) = &outcome.error {
                    let _ = writeln!(out, "    {}", error);
                } else if !outcome.verdict.is_pass() {
                    let _ = writeln!(out, "    预期输出:\n{}", indent(&outcome.expected));
                    let _ = writeln!(out, "    实际输出:\n{}", indent(&outcome.stdout));
                }
                if outcome.output_truncated {
                    let _ = writeln!(out, "    （输出已截断）");
                }
            }
        }

        match record.status {
            RecordStatus::Graded => {
                let _ = writeln!(
                    out,
                    "分数: {} ({:?})",
                    record.score.unwrap_or(0),
                    record.score_source
                );
                if !record.rationale.is_empty() {
                    let _ = writeln!(out, "原因: {}", record.rationale);
                }
            }
            RecordStatus::ScoringFailed | RecordStatus::Errored => {
                if let Some(error) = &record.error {
                    let _ = writeln!(out, "{}错误: {}", error.stage.label(), error.message);
                }
            }
        }
    }

    out
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("      {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}
