use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs;

use crate::models::test_case::{CaseOverrides, TestCase};

/// 所有题目的测试案例（只读）
///
/// 启动时载入一次，之后以 `Arc` 在并发单元间共享。
#[derive(Debug, Default, Clone)]
pub struct TestCaseStore {
    cases: HashMap<String, Arc<[TestCase]>>,
    descriptions: HashMap<String, Arc<str>>,
}

impl TestCaseStore {
    /// 取得某题的测试案例，找不到返回空切片
    pub fn cases_for(&self, problem: &str) -> Arc<[TestCase]> {
        self.cases
            .get(problem)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// 题目描述（`P<题号>/problem.md`）
    pub fn description_for(&self, problem: &str) -> Option<Arc<str>> {
        self.descriptions.get(problem).cloned()
    }

    pub fn problem_count(&self) -> usize {
        self.cases.len()
    }

    /// 直接插入一题（测试中使用）
    pub fn insert(&mut self, problem: impl Into<String>, cases: Vec<TestCase>) {
        self.cases.insert(problem.into(), Arc::from(cases));
    }
}

/// 从测试目录载入全部测试案例
///
/// 目录结构：`<root>/P<题号>/<案例目录>/{in.txt, out.txt[, case.toml]}`
pub async fn load_test_cases(root: &Path) -> Result<TestCaseStore> {
    let mut store = TestCaseStore::default();

    if !root.exists() {
        tracing::warn!("测试案例目录不存在: {}", root.display());
        return Ok(store);
    }

    let mut problem_dirs = Vec::new();
    let mut entries = fs::read_dir(root)
        .await
        .with_context(|| format!("无法读取测试案例目录: {}", root.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() && name.starts_with('P') {
            problem_dirs.push((name[1..].to_string(), path));
        }
    }
    problem_dirs.sort();

    for (problem, dir) in problem_dirs {
        let cases = load_problem_cases(&problem, &dir).await?;
        tracing::debug!("载入测试案例: P{} 共 {} 个", problem, cases.len());

        let description_path = dir.join("problem.md");
        if description_path.is_file() {
            let text = fs::read_to_string(&description_path)
                .await
                .with_context(|| format!("无法读取题目描述: {}", description_path.display()))?;
            store.descriptions.insert(problem.clone(), Arc::from(text));
        }

        store.insert(problem, cases);
    }

    tracing::info!("测试案例载入完成，共 {} 个题目", store.problem_count());
    Ok(store)
}

/// 载入单个题目目录下的所有案例，按目录名排序
pub async fn load_problem_cases(problem: &str, dir: &Path) -> Result<Vec<TestCase>> {
    let mut folders: Vec<PathBuf> = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("无法读取题目目录: {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_dir() {
            folders.push(path);
        }
    }
    folders.sort();

    let mut cases = Vec::new();
    for folder in folders {
        let in_path = folder.join("in.txt");
        let out_path = folder.join("out.txt");
        if !in_path.is_file() || !out_path.is_file() {
            tracing::warn!("测试案例目录缺少 in.txt / out.txt: {}", folder.display());
            continue;
        }

        let input = fs::read(&in_path)
            .await
            .with_context(|| format!("无法读取输入: {}", in_path.display()))?;
        let expected_output = fs::read(&out_path)
            .await
            .with_context(|| format!("无法读取预期输出: {}", out_path.display()))?;

        let overrides = load_overrides(&folder.join("case.toml")).await?;

        cases.push(TestCase {
            problem: problem.to_string(),
            index: cases.len(),
            name: folder
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            input,
            expected_output,
            timeout: overrides.timeout_secs.map(Duration::from_secs),
        });
    }

    Ok(cases)
}

async fn load_overrides(path: &Path) -> Result<CaseOverrides> {
    if !path.is_file() {
        return Ok(CaseOverrides::default());
    }
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("无法读取案例配置: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("无法解析案例配置: {}", path.display()))
}
