//! 测试执行服务
//!
//! 对编译好的程序逐个执行测试案例。同一单元内的案例顺序执行，
//! 每个案例都是独立的新进程；某个案例失败不会中断后续案例。

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::infrastructure::process::{run_limited, CommandSpec, LimitHit, ProcessLimits, ProcessOutcome};
use crate::models::{TestCase, TestOutcome, Verdict};

/// 预期输出与实际输出的比较策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputComparison {
    /// 逐字节完全一致
    Exact,
    /// 逐行比较，忽略行尾空白和结尾空行
    #[default]
    LineTrimmed,
    /// 按空白切分后逐词比较
    WhitespaceInsensitive,
}

impl OutputComparison {
    pub fn matches(&self, expected: &[u8], actual: &[u8]) -> bool {
        match self {
            OutputComparison::Exact => expected == actual,
            OutputComparison::LineTrimmed => trimmed_lines(expected) == trimmed_lines(actual),
            OutputComparison::WhitespaceInsensitive => {
                expected
                    .split(|b| b.is_ascii_whitespace())
                    .filter(|t| !t.is_empty())
                    .eq(actual.split(|b| b.is_ascii_whitespace()).filter(|t| !t.is_empty()))
            }
        }
    }
}

impl FromStr for OutputComparison {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(OutputComparison::Exact),
            "line_trimmed" => Ok(OutputComparison::LineTrimmed),
            "whitespace_insensitive" => Ok(OutputComparison::WhitespaceInsensitive),
            other => Err(format!("未知的比较策略: {}", other)),
        }
    }
}

impl fmt::Display for OutputComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputComparison::Exact => "exact",
            OutputComparison::LineTrimmed => "line_trimmed",
            OutputComparison::WhitespaceInsensitive => "whitespace_insensitive",
        };
        f.write_str(name)
    }
}

fn trimmed_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = data
        .split(|&b| b == b'\n')
        .map(|line| line.trim_ascii_end())
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}

/// 判定一次执行所需的全部证据
#[derive(Debug, Clone, Copy)]
pub struct RunEvidence {
    pub limit_hit: Option<LimitHit>,
    pub peak_rss: Option<u64>,
    pub exit_code: Option<i32>,
    pub output_matches: bool,
}

/// 判定优先级：内存超限 > 超时 > 非零退出 > 输出不符 > 通过
pub fn classify(evidence: &RunEvidence, memory_limit: Option<u64>) -> Verdict {
    let memory_hit = evidence.limit_hit == Some(LimitHit::Memory)
        || matches!((evidence.peak_rss, memory_limit), (Some(peak), Some(limit)) if peak >= limit);

    if memory_hit {
        Verdict::MemoryExceeded
    } else if evidence.limit_hit == Some(LimitHit::WallTime) {
        Verdict::Timeout
    } else if evidence.exit_code != Some(0) {
        Verdict::RuntimeError
    } else if !evidence.output_matches {
        Verdict::Fail
    } else {
        Verdict::Pass
    }
}

/// 把输出转换为可读字符串，非法 UTF-8 字节显示为 `\xNN`
pub fn bytes_to_readable(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for chunk in data.utf8_chunks() {
        out.push_str(chunk.valid());
        for byte in chunk.invalid() {
            out.push_str(&format!("\\x{:02x}", byte));
        }
    }
    out
}

/// 测试执行器
#[derive(Debug, Clone)]
pub struct TestRunner {
    default_timeout: Duration,
    memory_limit: Option<u64>,
    output_limit: usize,
    comparison: OutputComparison,
}

impl TestRunner {
    pub fn new(
        default_timeout: Duration,
        memory_limit: Option<u64>,
        output_limit: usize,
        comparison: OutputComparison,
    ) -> Self {
        Self {
            default_timeout,
            memory_limit,
            output_limit,
            comparison,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.test_timeout(),
            Some(config.memory_limit_bytes()),
            config.output_limit_bytes,
            config.output_comparison,
        )
    }

    /// 依次执行所有测试案例
    ///
    /// `output_dir` 存在时，把每个案例的 stdout 保存为 `<案例名>_out.txt`。
    /// 程序无法启动时，当前及后续案例全部判为 `runtime_error`。
    pub async fn run(
        &self,
        artifact: &Path,
        cases: &[TestCase],
        output_dir: Option<&Path>,
    ) -> Vec<TestOutcome> {
        let mut outcomes = Vec::with_capacity(cases.len());
        // 子进程在产物所在目录执行，程序路径必须是绝对路径
        let program = std::path::absolute(artifact).unwrap_or_else(|_| artifact.to_path_buf());
        let mut command = CommandSpec::new(&program);
        if let Some(dir) = program.parent() {
            command = command.current_dir(dir);
        }

        for (position, case) in cases.iter().enumerate() {
            let timeout = case.effective_timeout(self.default_timeout);
            let limits = ProcessLimits {
                wall_timeout: timeout,
                memory_limit: self.memory_limit,
                output_limit: self.output_limit,
            };

            let process = match run_limited(&command, Some(&case.input), limits).await {
                Ok(process) => process,
                Err(e) => {
                    warn!("无法执行 {}: {}", artifact.display(), e);
                    let message = format!("执行错误: {}", e);
                    outcomes.extend(
                        cases[position..]
                            .iter()
                            .map(|rest| unstartable_outcome(rest, &message)),
                    );
                    break;
                }
            };

            let outcome = self.judge(case, &process, timeout);
            debug!(
                "案例 {}: {} ({} ms)",
                case.name,
                outcome.verdict.label(),
                outcome.elapsed_ms
            );

            if let Some(dir) = output_dir {
                let path = dir.join(format!("{}_out.txt", case.name));
                if let Err(e) = tokio::fs::write(&path, outcome.stdout.as_bytes()).await {
                    warn!("保存输出失败 {}: {}", path.display(), e);
                }
            }

            outcomes.push(outcome);
        }

        outcomes
    }

    fn judge(&self, case: &TestCase, process: &ProcessOutcome, timeout: Duration) -> TestOutcome {
        let evidence = RunEvidence {
            limit_hit: process.limit_hit,
            peak_rss: process.peak_rss,
            exit_code: process.exit_code,
            output_matches: self.comparison.matches(&case.expected_output, &process.stdout),
        };
        let verdict = classify(&evidence, self.memory_limit);

        let error = match verdict {
            Verdict::Pass | Verdict::Fail => None,
            Verdict::Timeout => Some(format!("执行超时（超过 {} 秒）", timeout.as_secs_f64())),
            Verdict::MemoryExceeded => Some(format!(
                "内存超限（峰值 {} MB）",
                process.peak_rss.unwrap_or(0) / (1024 * 1024)
            )),
            Verdict::RuntimeError => Some(match (process.exit_code, process.signal) {
                (_, Some(signal)) => format!("程序被信号 {} 终止", signal),
                (Some(code), None) => format!("程序退出码 {}", code),
                (None, None) => "程序异常结束".to_string(),
            }),
        };

        TestOutcome {
            case_index: case.index,
            case_name: case.name.clone(),
            verdict,
            expected: bytes_to_readable(&case.expected_output),
            stdout: bytes_to_readable(&process.stdout),
            stderr: bytes_to_readable(&process.stderr),
            output_truncated: process.stdout_truncated || process.stderr_truncated,
            exit_code: process.exit_code,
            signal: process.signal,
            elapsed_ms: process.elapsed.as_millis() as u64,
            error,
        }
    }
}

fn unstartable_outcome(case: &TestCase, message: &str) -> TestOutcome {
    TestOutcome {
        case_index: case.index,
        case_name: case.name.clone(),
        verdict: Verdict::RuntimeError,
        expected: bytes_to_readable(&case.expected_output),
        stdout: String::new(),
        stderr: String::new(),
        output_truncated: false,
        exit_code: None,
        signal: None,
        elapsed_ms: 0,
        error: Some(message.to_string()),
    }
}
