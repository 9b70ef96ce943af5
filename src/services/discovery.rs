//! 提交扫描服务
//!
//! 扫描 `<source_dir>/<学号>/` 下的源文件，产出按 (学号, 题号) 排序、无重复的提交列表。
//! 文件名格式：`{学号}_p{题号}[_子题][_ex].{c|cpp}`，`-` 视同 `_`，`p` 不分大小写。
//! 格式不符的文件只记录警告并跳过。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult, ConfigError, DiscoveryWarning};
use crate::models::{Language, Submission, UnitId};

const FILE_NAME_PATTERN: &str = r"^(\w+)_[Pp](\d+(?:_[a-zA-Z])?(?:_ex)?)\.(?i:(c|cpp))$";

/// 一次扫描的结果
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub submissions: Vec<Submission>,
    pub warnings: Vec<DiscoveryWarning>,
}

pub struct Discovery {
    student_id: Regex,
    file_name: Regex,
}

impl Discovery {
    pub fn new(student_id_pattern: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            student_id: Regex::new(student_id_pattern)?,
            file_name: Regex::new(FILE_NAME_PATTERN)?,
        })
    }

    pub fn is_valid_student_id(&self, student_id: &str) -> bool {
        self.student_id.is_match(student_id)
    }

    /// 解析文件名；学号与目录名不一致时以目录名为准
    pub fn parse_file_name(
        &self,
        file_name: &str,
        folder_student_id: &str,
    ) -> Result<(UnitId, Language), DiscoveryWarning> {
        let normalized = file_name.replace('-', "_");
        let caps = self
            .file_name
            .captures(&normalized)
            .ok_or_else(|| DiscoveryWarning::MalformedFileName {
                file_name: file_name.to_string(),
            })?;

        let file_student_id = &caps[1];
        let problem = &caps[2];
        let language = Language::from_extension(&caps[3]).ok_or_else(|| {
            DiscoveryWarning::MalformedFileName {
                file_name: file_name.to_string(),
            }
        })?;

        if !self.is_valid_student_id(file_student_id) {
            return Err(DiscoveryWarning::InvalidStudentId {
                student_id: file_student_id.to_string(),
            });
        }

        if file_student_id != folder_student_id {
            warn!(
                "学号不一致：文件名 {} 与目录 {}，以目录为准",
                file_student_id, folder_student_id
            );
        }

        Ok((UnitId::new(folder_student_id, problem), language))
    }

    /// 扫描整个提交目录
    pub fn scan(&self, root: &Path) -> AppResult<DiscoveryReport> {
        let mut report = DiscoveryReport::default();

        if !root.is_dir() {
            error!("提交目录不存在: {}", root.display());
            return Ok(report);
        }

        let mut student_dirs = read_sorted(root)?;
        student_dirs.retain(|p| p.is_dir());

        // 按路径排序后先到先得，重复的单元忽略
        let mut units: BTreeMap<UnitId, Submission> = BTreeMap::new();

        for dir in student_dirs {
            let folder_id = dir
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !self.is_valid_student_id(&folder_id) {
                warn!("无效的学生目录: {}", folder_id);
                report.warnings.push(DiscoveryWarning::InvalidStudentId {
                    student_id: folder_id,
                });
                continue;
            }

            for path in read_sorted(&dir)? {
                if !path.is_file() || !has_source_extension(&path) {
                    continue;
                }
                let file_name = path
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string();

                let (unit, language) = match self.parse_file_name(&file_name, &folder_id) {
                    Ok(parsed) => parsed,
                    Err(warning) => {
                        warn!("{}", warning);
                        report.warnings.push(warning);
                        continue;
                    }
                };

                if let Some(kept) = units.get(&unit) {
                    let warning = DiscoveryWarning::DuplicateUnit {
                        unit: unit.to_string(),
                        ignored: format!("{}（保留 {}）", file_name, kept.file_name()),
                    };
                    warn!("{}", warning);
                    report.warnings.push(warning);
                    continue;
                }

                debug!("发现提交: {} ({})", unit, file_name);
                units.insert(unit.clone(), Submission::new(unit, language, path));
            }
        }

        report.submissions = units.into_values().collect();
        info!(
            "扫描完成：{} 个提交，{} 个警告",
            report.submissions.len(),
            report.warnings.len()
        );
        Ok(report)
    }
}

fn has_source_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(Language::from_extension)
        .is_some()
}

fn read_sorted(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let mut paths = std::fs::read_dir(dir)
        .map_err(|e| AppError::file(dir, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::file(dir, e))?;
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery() -> Discovery {
        Discovery::new(r"^[A-Za-z0-9]+$").unwrap()
    }

    fn touch(root: &Path, student: &str, file: &str) {
        let dir = root.join(student);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), "int main(){return 0;}").unwrap();
    }

    #[test]
    fn test_parse_file_name_variants() {
        let d = discovery();
        let (unit, lang) = d.parse_file_name("A1_p1.c", "A1").unwrap();
        assert_eq!(unit, UnitId::new("A1", "1"));
        assert_eq!(lang, Language::C);

        let (unit, lang) = d.parse_file_name("A1-P3_a_ex.cpp", "A1").unwrap();
        assert_eq!(unit.problem, "3_a_ex");
        assert_eq!(lang, Language::Cpp);

        // 目录名优先
        let (unit, _) = d.parse_file_name("B7_p2.c", "A1").unwrap();
        assert_eq!(unit.student_id, "A1");

        assert!(matches!(
            d.parse_file_name("A1_q1.c", "A1"),
            Err(DiscoveryWarning::MalformedFileName { .. })
        ));
        assert!(matches!(
            d.parse_file_name("A1_x_p1.c", "A1"),
            Err(DiscoveryWarning::InvalidStudentId { .. })
        ));
    }

    #[test]
    fn test_scan_is_sorted_and_deduplicated() {
        let root = tempfile::tempdir().unwrap();
        touch(root.path(), "B2", "B2_p1.c");
        touch(root.path(), "A1", "A1_p2.cpp");
        touch(root.path(), "A1", "A1_p1.c");
        touch(root.path(), "A1", "A1-p1.c");
        touch(root.path(), "A1", "A1_p1_ex.c");
        touch(root.path(), "A1", "notes.txt");
        touch(root.path(), "A1", "homework.c");
        touch(root.path(), "bad_id", "bad_id_p1.c");

        let report = discovery().scan(root.path()).unwrap();
        let units: Vec<String> = report
            .submissions
            .iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(units, vec!["#A1 - P1", "#A1 - P1_ex", "#A1 - P2", "#B2 - P1"]);

        // 路径排序下 "A1-p1.c" 在 "A1_p1.c" 之前
        assert_eq!(report.submissions[0].file_name(), "A1-p1.c");

        assert_eq!(report.warnings.len(), 3);
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, DiscoveryWarning::DuplicateUnit { .. })));
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, DiscoveryWarning::MalformedFileName { file_name } if file_name == "homework.c")));
    }

    #[test]
    fn test_scan_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let report = discovery().scan(&root.path().join("none")).unwrap();
        assert!(report.submissions.is_empty());
    }
}
