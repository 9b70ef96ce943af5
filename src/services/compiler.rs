//! 编译服务
//!
//! 按扩展名选择 gcc / g++，以 `<compiler> <source> -o <artifact>` 编译。
//! 不写进度日志，只返回 `BuildResult`。

use std::path::Path;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::ToolchainError;
use crate::infrastructure::process::{run_limited, CommandSpec, LimitHit, ProcessLimits};
use crate::models::{BuildResult, Language};
use crate::services::test_runner::bytes_to_readable;

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Compiler {
    gcc_path: String,
    gpp_path: String,
    timeout: Duration,
    output_limit: usize,
}

impl Compiler {
    pub fn new(gcc_path: impl Into<String>, gpp_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            gcc_path: gcc_path.into(),
            gpp_path: gpp_path.into(),
            timeout,
            output_limit: 64 * 1024,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut compiler = Self::new(&config.gcc_path, &config.gpp_path, config.compile_timeout());
        compiler.output_limit = config.output_limit_bytes;
        compiler
    }

    fn program_for(&self, language: Language) -> &str {
        match language {
            Language::C => &self.gcc_path,
            Language::Cpp => &self.gpp_path,
        }
    }

    /// 编译一个源文件
    ///
    /// 超时会终止整个编译进程组后返回。
    pub async fn compile(&self, language: Language, source: &Path, artifact: &Path) -> BuildResult {
        let program = self.program_for(language);
        let command = CommandSpec::new(program)
            .arg(source)
            .arg("-o")
            .arg(artifact);
        let limits = ProcessLimits {
            wall_timeout: self.timeout,
            memory_limit: None,
            output_limit: self.output_limit,
        };

        debug!("编译: {} {}", program, source.display());
        let outcome = match run_limited(&command, None, limits).await {
            Ok(outcome) => outcome,
            Err(e) => return BuildResult::failed(format!("编译错误: {}", e), false, 0),
        };
        let elapsed_ms = outcome.elapsed.as_millis() as u64;

        if outcome.limit_hit == Some(LimitHit::WallTime) {
            return BuildResult::failed(
                format!("编译超时（超过 {} 秒）", self.timeout.as_secs()),
                true,
                elapsed_ms,
            );
        }

        if outcome.success() && artifact.is_file() {
            return BuildResult::succeeded(artifact.to_path_buf(), elapsed_ms);
        }

        let diagnostics = if outcome.stderr.is_empty() {
            bytes_to_readable(&outcome.stdout)
        } else {
            bytes_to_readable(&outcome.stderr)
        };
        let diagnostics = if diagnostics.trim().is_empty() {
            format!("编译器退出码 {:?}，未产生可执行文件", outcome.exit_code)
        } else {
            diagnostics
        };
        BuildResult::failed(diagnostics, false, elapsed_ms)
    }

    /// 检查编译器是否可用，gcc / g++ 至少一个能执行 `--version`
    pub async fn check_availability(&self) -> Result<(), ToolchainError> {
        let mut available = false;
        for (label, program) in [("GCC", &self.gcc_path), ("G++", &self.gpp_path)] {
            let limits = ProcessLimits {
                wall_timeout: VERSION_CHECK_TIMEOUT,
                memory_limit: None,
                output_limit: 4096,
            };
            match run_limited(&CommandSpec::new(program).arg("--version"), None, limits).await {
                Ok(outcome) if outcome.success() => {
                    info!("{} 可用: {}", label, program);
                    available = true;
                }
                _ => error!("找不到 {} 编译器: {}", label, program),
            }
        }

        if available {
            Ok(())
        } else {
            Err(ToolchainError::CompilerNotFound {
                path: format!("{} / {}", self.gcc_path, self.gpp_path),
            })
        }
    }
}
