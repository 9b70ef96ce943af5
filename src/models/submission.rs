use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// 批改单元标识：(学号, 题号)
///
/// 题号是完整题号，例如 `1`、`3_a`、`1_ex`、`3_a_ex`。
/// 排序按 (学号, 题号) 字典序，扫描结果和报告都依赖这个顺序。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub student_id: String,
    pub problem: String,
}

impl UnitId {
    pub fn new(student_id: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            problem: problem.into(),
        }
    }

    /// 题目 key，例如 `P1`、`P3_a`、`P1_ex`
    pub fn problem_key(&self) -> String {
        format!("P{}", self.problem)
    }

    /// 是否为额外题
    pub fn is_extra(&self) -> bool {
        self.problem.ends_with("_ex")
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} - {}", self.student_id, self.problem_key())
    }
}

/// 源文件语言，由扩展名决定使用哪个编译器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    C,
    Cpp,
}

impl Language {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "c" => Some(Language::C),
            "cpp" => Some(Language::Cpp),
            _ => None,
        }
    }
}

/// 学生提交（扫描后不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: UnitId,
    pub language: Language,
    /// 原始源文件路径
    pub source_path: PathBuf,
}

impl Submission {
    pub fn new(id: UnitId, language: Language, source_path: PathBuf) -> Self {
        Self {
            id,
            language,
            source_path,
        }
    }

    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id_helpers() {
        let id = UnitId::new("A1", "3_a_ex");
        assert_eq!(id.problem_key(), "P3_a_ex");
        assert!(id.is_extra());
        assert_eq!(id.to_string(), "#A1 - P3_a_ex");
        assert!(!UnitId::new("A1", "1").is_extra());
    }

    #[test]
    fn test_unit_id_ordering() {
        let mut ids = vec![
            UnitId::new("B1", "1"),
            UnitId::new("A1", "2"),
            UnitId::new("A1", "1_ex"),
            UnitId::new("A1", "1"),
        ];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["#A1 - P1", "#A1 - P1_ex", "#A1 - P2", "#B1 - P1"]
        );
    }

    #[test]
    fn test_language_from_extension() {
        assert_eq!(Language::from_extension("c"), Some(Language::C));
        assert_eq!(Language::from_extension("CPP"), Some(Language::Cpp));
        assert_eq!(Language::from_extension("py"), None);
    }
}
