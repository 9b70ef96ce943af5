//! 单元工作目录 - 基础设施层
//!
//! 每个批改单元独占 `<work_root>/<学号>/P<题号>/`，
//! 其中放源文件副本、可执行文件和 `test_results/`。并发批改时互不干扰。

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::models::Submission;

/// 单元工作目录
#[derive(Debug, Clone)]
pub struct UnitWorkspace {
    dir: PathBuf,
    source: PathBuf,
    artifact: PathBuf,
}

impl UnitWorkspace {
    /// 计算路径但不创建
    pub fn locate(work_root: &Path, submission: &Submission) -> Self {
        let dir = work_root
            .join(&submission.id.student_id)
            .join(submission.id.problem_key());
        let file_name = submission.file_name();
        let stem = submission
            .source_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| submission.id.problem_key());

        Self {
            source: dir.join(file_name),
            artifact: dir.join(stem),
            dir,
        }
    }

    /// 清空并重建工作目录，复制源文件
    ///
    /// 返回的路径都是绝对路径：子进程会切换到单元目录执行，相对路径在那里失效。
    pub async fn prepare(work_root: &Path, submission: &Submission) -> io::Result<Self> {
        let work_root = std::path::absolute(work_root)?;
        let workspace = Self::locate(&work_root, submission);

        if fs::try_exists(&workspace.dir).await? {
            fs::remove_dir_all(&workspace.dir).await?;
        }
        fs::create_dir_all(workspace.results_dir()).await?;
        fs::copy(submission.source_path(), &workspace.source).await?;

        Ok(workspace)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 工作目录内的源文件副本
    pub fn source_path(&self) -> &Path {
        &self.source
    }

    /// 编译产物路径
    pub fn artifact_path(&self) -> &Path {
        &self.artifact
    }

    /// 每个案例的实际输出保存在这里
    pub fn results_dir(&self) -> PathBuf {
        self.dir.join("test_results")
    }
}

/// 删除整个工作目录根
pub async fn remove_work_root(work_root: &Path) -> io::Result<bool> {
    if !fs::try_exists(work_root).await? {
        return Ok(false);
    }
    fs::remove_dir_all(work_root).await?;
    Ok(true)
}
