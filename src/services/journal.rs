//! 进度日志服务
//!
//! 每行一条 JSON 格式的 `GradingRecord`，只追加不修改。
//! 续跑和报告都只从回放这个文件得到状态。
//!
//! - 追加：互斥锁串行化，整行一次写入后 `sync_data`
//! - 载入：没有换行结尾的最后一行视为写到一半，直接忽略
//! - 回放：每个单元保留 `graded_at` 最大的记录，相同时后写入者胜

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::JournalError;
use crate::models::{GradingRecord, UnitId};

pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    /// 打开（或创建）进度日志
    ///
    /// 上次运行中断留下的半行会先补上换行，保证新记录从新行开始。
    pub async fn open(path: &Path) -> Result<Self, JournalError> {
        let open_err = |source| JournalError::Open {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(open_err)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(open_err)?;

        let len = file.metadata().map_err(open_err)?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))
                .and_then(|_| file.read_exact(&mut last))
                .map_err(open_err)?;
            if last[0] != b'\n' {
                warn!("进度日志末尾有未完成的记录，已忽略: {}", path.display());
                file.write_all(b"\n")
                    .and_then(|_| file.sync_data())
                    .map_err(|source| JournalError::Write {
                        path: path.to_path_buf(),
                        source,
                    })?;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(File::from_std(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一条记录，返回前已落盘
    pub async fn append(&self, record: &GradingRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let write_err = |source| JournalError::Write {
            path: self.path.clone(),
            source,
        };

        let mut file = self.file.lock().await;
        file.write_all(&line).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;
        file.sync_data().await.map_err(write_err)?;

        debug!("[{}] 已写入进度日志", record.unit);
        Ok(())
    }

    /// 按写入顺序回放所有完整的记录
    pub async fn load(path: &Path) -> Result<Vec<GradingRecord>, JournalError> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(JournalError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut lines: Vec<&[u8]> = content.split(|&b| b == b'\n').collect();
        // split 之后最后一段要么是空（正常以换行结尾），要么是写到一半的行
        if let Some(partial) = lines.pop() {
            if !partial.is_empty() {
                warn!("忽略进度日志末尾未完成的记录（{} 字节）", partial.len());
            }
        }

        let mut records = Vec::with_capacity(lines.len());
        for (number, line) in lines.into_iter().enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<GradingRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("进度日志第 {} 行无法解析，已跳过: {}", number + 1, e),
            }
        }
        Ok(records)
    }

    /// 载入并回放为快照
    pub async fn snapshot(path: &Path) -> Result<JournalSnapshot, JournalError> {
        Ok(JournalSnapshot::from_records(Self::load(path).await?))
    }
}

/// 回放得到的不可变状态
#[derive(Debug, Default, Clone)]
pub struct JournalSnapshot {
    latest: HashMap<UnitId, GradingRecord>,
}

impl JournalSnapshot {
    pub fn from_records(records: impl IntoIterator<Item = GradingRecord>) -> Self {
        let mut latest: HashMap<UnitId, GradingRecord> = HashMap::new();
        for record in records {
            let newer = latest
                .get(&record.unit)
                .map_or(true, |existing| record.graded_at >= existing.graded_at);
            if newer {
                latest.insert(record.unit.clone(), record);
            }
        }
        Self { latest }
    }

    /// 单元已有终态记录
    pub fn is_done(&self, unit: &UnitId) -> bool {
        self.latest.get(unit).is_some_and(GradingRecord::is_terminal)
    }

    pub fn get(&self, unit: &UnitId) -> Option<&GradingRecord> {
        self.latest.get(unit)
    }

    /// 按 (学号, 题号) 排序的最新记录
    pub fn records(&self) -> Vec<&GradingRecord> {
        let mut records: Vec<&GradingRecord> = self.latest.values().collect();
        records.sort_by(|a, b| a.unit.cmp(&b.unit));
        records
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BuildResult, ErrorStage, ScoreSource};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    fn graded(student: &str, problem: &str, score: u32) -> GradingRecord {
        GradingRecord::graded(
            UnitId::new(student, problem),
            format!("{}_p{}.c", student, problem),
            BuildResult::failed("error", false, 1),
            Vec::new(),
            score,
            ScoreSource::AllFail,
            String::new(),
        )
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("progress.jsonl");

        let journal = Journal::open(&path).await.unwrap();
        journal.append(&graded("A1", "1", 0)).await.unwrap();
        journal.append(&graded("A2", "1", 0)).await.unwrap();

        let records = Journal::load(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].unit, UnitId::new("A2", "1"));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = Journal::load(&dir.path().join("none.jsonl")).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_partial_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.jsonl");
        {
            let journal = Journal::open(&path).await.unwrap();
            journal.append(&graded("A1", "1", 0)).await.unwrap();
        }
        // 模拟写到一半被杀
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(br#"{"unit":{"student_id":"A2","#).unwrap();
        drop(raw);

        let records = Journal::load(&path).await.unwrap();
        assert_eq!(records.len(), 1);

        // 重新打开后继续追加，半行不影响新记录
        let journal = Journal::open(&path).await.unwrap();
        journal.append(&graded("A3", "1", 0)).await.unwrap();
        let records = Journal::load(&path).await.unwrap();
        let units: Vec<&str> = records.iter().map(|r| r.unit.student_id.as_str()).collect();
        assert_eq!(units, vec!["A1", "A3"]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.jsonl");
        let journal = Arc::new(Journal::open(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..50 {
            let journal = journal.clone();
            handles.push(tokio::spawn(async move {
                let mut record = graded(&format!("S{:02}", i), "1", 0);
                record.rationale = "x".repeat(4096);
                journal.append(&record).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let snapshot = Journal::snapshot(&path).await.unwrap();
        assert_eq!(snapshot.len(), 50);
    }

    #[test]
    fn test_snapshot_keeps_latest_timestamp() {
        let mut old = graded("A1", "1", 3);
        let mut new = graded("A1", "1", 7);
        new.graded_at = Utc::now();
        old.graded_at = new.graded_at - ChronoDuration::seconds(10);

        // 写入顺序与时间戳无关
        let snapshot = JournalSnapshot::from_records(vec![new.clone(), old.clone()]);
        assert_eq!(snapshot.get(&new.unit).unwrap().score, Some(7));

        // 时间戳相同时后写入者胜
        let mut tie = graded("A1", "1", 9);
        tie.graded_at = new.graded_at;
        let snapshot = JournalSnapshot::from_records(vec![new, tie]);
        assert_eq!(snapshot.get(&UnitId::new("A1", "1")).unwrap().score, Some(9));
    }

    #[test]
    fn test_is_done_excludes_scoring_failed() {
        let unit = UnitId::new("A1", "1");
        let failed = GradingRecord::scoring_failed(
            unit.clone(),
            "A1_p1.c".into(),
            BuildResult::failed("", false, 0),
            Vec::new(),
            "重试耗尽".into(),
        );
        let errored = GradingRecord::errored(
            UnitId::new("A2", "1"),
            "A2_p1.c".into(),
            ErrorStage::Internal,
            "panic",
        );
        let snapshot = JournalSnapshot::from_records(vec![failed, errored]);
        assert!(!snapshot.is_done(&unit));
        assert!(snapshot.is_done(&UnitId::new("A2", "1")));
        assert!(!snapshot.is_done(&UnitId::new("A3", "1")));
        assert_eq!(snapshot.records()[0].unit, unit);
    }
}
