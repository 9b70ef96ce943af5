use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::services::test_runner::OutputComparison;

/// 程序配置
///
/// 先读取可选的 TOML 文件，再用环境变量覆盖。
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 学生提交根目录（每个学生一个子目录）
    pub source_dir: PathBuf,
    /// 测试数据目录（`P<题号>/<案例>/in.txt, out.txt`）
    pub test_cases_dir: PathBuf,
    /// 报告输出目录
    pub results_dir: PathBuf,
    /// 每个批改单元的工作目录根
    pub work_dir: PathBuf,
    /// 进度日志路径
    pub journal_path: PathBuf,

    // --- 编译器 ---
    pub gcc_path: String,
    pub gpp_path: String,
    pub compile_timeout_secs: u64,

    // --- 测试 ---
    pub test_timeout_secs: u64,
    pub memory_limit_mb: u64,
    /// 每个流（stdout / stderr）最多保留的字节数
    pub output_limit_bytes: usize,
    pub output_comparison: OutputComparison,

    // --- 调度 ---
    /// 同时批改的单元数量
    pub workers: usize,
    /// 学号需要满足的正则
    pub student_id_pattern: String,

    // --- 评分 ---
    pub max_score: u32,
    pub extra_max_score: u32,

    // --- LLM 配置 ---
    pub llm_api_keys: Vec<String>,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    pub llm_timeout_secs: u64,
    pub llm_max_attempts: u32,
    pub llm_initial_backoff_ms: u64,

    /// 是否显示详细日志
    pub verbose_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("source_codes"),
            test_cases_dir: PathBuf::from("test_cases"),
            results_dir: PathBuf::from("results"),
            work_dir: PathBuf::from("tmp"),
            journal_path: PathBuf::from("results/grading_progress.jsonl"),
            gcc_path: "gcc".to_string(),
            gpp_path: "g++".to_string(),
            compile_timeout_secs: 10,
            test_timeout_secs: 5,
            memory_limit_mb: 256,
            output_limit_bytes: 64 * 1024,
            output_comparison: OutputComparison::LineTrimmed,
            workers: 1,
            student_id_pattern: r"^[A-Za-z0-9]+$".to_string(),
            max_score: 31,
            extra_max_score: 5,
            llm_api_keys: Vec::new(),
            llm_api_base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            llm_model_name: "gemini-2.5-flash".to_string(),
            llm_timeout_secs: 60,
            llm_max_attempts: 3,
            llm_initial_backoff_ms: 1000,
            verbose_logging: false,
        }
    }
}

impl Config {
    /// 只从环境变量加载（其余取默认值）
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// 读取可选的 TOML 配置文件，再应用环境变量
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadFailed {
                        path: path.to_path_buf(),
                        source,
                    })?;
                toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        base.with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        override_path("SOURCE_DIR", &mut self.source_dir);
        override_path("TEST_CASES_DIR", &mut self.test_cases_dir);
        override_path("RESULTS_DIR", &mut self.results_dir);
        override_path("WORK_DIR", &mut self.work_dir);
        override_path("PROGRESS_LOG_PATH", &mut self.journal_path);
        override_string("GCC_PATH", &mut self.gcc_path);
        override_string("GPP_PATH", &mut self.gpp_path);
        override_parsed("COMPILE_TIMEOUT", &mut self.compile_timeout_secs)?;
        override_parsed("TEST_TIMEOUT", &mut self.test_timeout_secs)?;
        override_parsed("MEMORY_LIMIT_MB", &mut self.memory_limit_mb)?;
        override_parsed("OUTPUT_LIMIT_BYTES", &mut self.output_limit_bytes)?;
        override_parsed("OUTPUT_COMPARISON", &mut self.output_comparison)?;
        override_parsed("WORKERS", &mut self.workers)?;
        override_string("STUDENT_ID_PATTERN", &mut self.student_id_pattern);
        override_parsed("MAX_SCORE", &mut self.max_score)?;
        override_parsed("EXTRA_MAX_SCORE", &mut self.extra_max_score)?;
        if let Ok(keys) = std::env::var("LLM_API_KEYS") {
            self.llm_api_keys = split_keys(&keys);
        }
        override_string("LLM_API_BASE_URL", &mut self.llm_api_base_url);
        override_string("LLM_MODEL", &mut self.llm_model_name);
        override_parsed("LLM_TIMEOUT", &mut self.llm_timeout_secs)?;
        override_parsed("LLM_MAX_ATTEMPTS", &mut self.llm_max_attempts)?;
        override_parsed("LLM_BACKOFF_MS", &mut self.llm_initial_backoff_ms)?;
        override_parsed("VERBOSE_LOGGING", &mut self.verbose_logging)?;
        Ok(self)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn override_string(var_name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(var_name) {
        *target = value;
    }
}

fn override_path(var_name: &str, target: &mut PathBuf) {
    if let Ok(value) = std::env::var(var_name) {
        *target = PathBuf::from(value);
    }
}

fn override_parsed<T: FromStr>(var_name: &str, target: &mut T) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(var_name) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value: value.clone(),
                expected_type: std::any::type_name::<T>().to_string(),
            })?;
    }
    Ok(())
}
