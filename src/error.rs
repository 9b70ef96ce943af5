use std::path::PathBuf;

use thiserror::Error;

/// 应用程序错误类型
///
/// 单个批改单元内部的失败（编译、运行、评分）不会以 `AppError` 的形式向上传播，
/// 而是写入该单元的 `GradingRecord`。只有会破坏整次运行保证的错误才出现在这里。
#[derive(Debug, Error)]
pub enum AppError {
    /// 扫描提交时的非致命问题
    #[error("扫描警告: {0}")]
    Discovery(#[from] DiscoveryWarning),
    /// 编译器 / 子进程相关错误
    #[error("工具链错误: {0}")]
    Toolchain(#[from] ToolchainError),
    /// 评分预言机错误
    #[error("评分错误: {0}")]
    Scoring(#[from] ScoringError),
    /// 进度日志错误（致命）
    #[error("进度日志错误: {0}")]
    Journal(#[from] JournalError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 文件操作错误
    #[error("文件错误 ({path}): {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// 扫描提交时遇到的非致命问题，跳过对应文件即可
#[derive(Debug, Error)]
pub enum DiscoveryWarning {
    /// 文件名不符合 `{学号}_p{题号}[_ex].{c|cpp}`
    #[error("文件名格式不符: {file_name}")]
    MalformedFileName { file_name: String },
    /// 学号格式不合法
    #[error("无效的学号: {student_id}")]
    InvalidStudentId { student_id: String },
    /// 同一 (学号, 题号) 出现多个源文件
    #[error("重复提交: {unit}，忽略 {ignored}")]
    DuplicateUnit { unit: String, ignored: String },
}

/// 编译器 / 子进程相关错误
#[derive(Debug, Error)]
pub enum ToolchainError {
    /// 找不到可用的编译器
    #[error("找不到编译器: {path}")]
    CompilerNotFound { path: String },
    /// 启动子进程失败
    #[error("启动进程失败 ({program}): {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 等待子进程失败
    #[error("等待进程失败 ({program}): {source}")]
    WaitFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// 评分预言机错误
#[derive(Debug, Clone, Error)]
pub enum ScoringError {
    /// 可重试的错误（限流、网络、响应无法解析、分数越界）
    #[error("暂时性评分失败: {0}")]
    Transient(String),
    /// 不可重试的错误（认证失败、请求构造失败等）
    #[error("评分失败: {0}")]
    Permanent(String),
}

impl ScoringError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ScoringError::Transient(_))
    }
}

/// 进度日志错误
///
/// 任何一种都意味着本次运行无法保证持久性，必须立即终止。
#[derive(Debug, Error)]
pub enum JournalError {
    /// 打开进度日志失败
    #[error("无法打开进度日志 {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// 写入进度日志失败
    #[error("写入进度日志失败 {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// 读取进度日志失败
    #[error("读取进度日志失败 {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// 记录序列化失败
    #[error("记录序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件读取失败
    #[error("无法读取配置文件 {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// 配置文件解析失败
    #[error("无法解析配置文件 {path}: {source}")]
    TomlParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// 学号正则无效
    #[error("学号格式正则无效: {0}")]
    InvalidPattern(#[from] regex::Error),
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建文件操作错误
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::File {
            path: path.into(),
            source,
        }
    }
}

impl ToolchainError {
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        ToolchainError::SpawnFailed {
            program: program.into(),
            source,
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
