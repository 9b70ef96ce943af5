//! 受限子进程 - 基础设施层
//!
//! 编译器和学生程序都通过这里启动。这里只负责“在限制内跑完一个进程”，
//! 不认识提交、测试案例或分数。
//!
//! - 每个子进程放入独立的进程组，超限时对整个进程组发送 SIGKILL
//! - 墙钟超时由 `tokio::time::sleep` 计时
//! - 内存上限按整个进程树的常驻内存执行：运行中轮询 `/proc`，退出时再用
//!   `wait4` 取回内核记录的峰值，来不及轮询的短命进程也能判定
//! - stdout / stderr 最多保留 `output_limit` 字节，超出部分读出后丢弃
//!
//! 子进程由 `wait4` 在阻塞线程中回收，管道也在阻塞线程中读取。

use std::ffi::{OsStr, OsString};
use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ToolchainError;

/// 强制终止后等待进程退出、管道关闭的最长时间
pub const KILL_GRACE: Duration = Duration::from_secs(2);

const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 遍历进程树时最多访问的进程数
#[cfg(target_os = "linux")]
const MAX_TREE_SIZE: usize = 1024;

/// `ru_maxrss` 的单位
#[cfg(target_os = "macos")]
const MAXRSS_UNIT: u64 = 1;
#[cfg(not(target_os = "macos"))]
const MAXRSS_UNIT: u64 = 1024;

/// 要执行的命令
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// 资源限制
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub wall_timeout: Duration,
    /// 常驻内存上限（字节），`None` 表示不限制
    pub memory_limit: Option<u64>,
    pub output_limit: usize,
}

/// 由限制器触发的终止
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitHit {
    WallTime,
    Memory,
}

/// 进程执行结果
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed: Duration,
    pub limit_hit: Option<LimitHit>,
    /// 常驻内存峰值（字节），取轮询值与内核记录值中较大者
    pub peak_rss: Option<u64>,
}

impl ProcessOutcome {
    /// 正常结束且退出码为 0
    pub fn success(&self) -> bool {
        self.limit_hit.is_none() && self.exit_code == Some(0)
    }
}

/// 离开作用域时终止整个进程组（包括调用方被取消的情况）
struct GroupGuard(u32);

impl Drop for GroupGuard {
    fn drop(&mut self) {
        kill_group(self.0);
    }
}

/// 在限制内执行一个进程
///
/// 返回前保证整个进程组已被终止并回收；只有进程无法启动或无法等待时才返回错误。
pub async fn run_limited(
    spec: &CommandSpec,
    stdin: Option<&[u8]>,
    limits: ProcessLimits,
) -> Result<ProcessOutcome, ToolchainError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let start = Instant::now();
    let mut child = spawn_with_retry(&mut command)
        .await
        .map_err(|e| ToolchainError::spawn_failed(spec.display_name(), e))?;
    let pid = child.id();
    let group = GroupGuard(pid);

    if let (Some(mut pipe), Some(data)) = (child.stdin.take(), stdin) {
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            // 程序提前退出时写入会得到 EPIPE，忽略即可
            let _ = pipe.write_all(&data);
        });
    }
    let output_limit = limits.output_limit;
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::task::spawn_blocking(move || read_capped(out, output_limit)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::task::spawn_blocking(move || read_capped(err, output_limit)));
    // 回收由 wait_with_usage 负责，std 的 Child 析构既不等待也不终止进程
    drop(child);

    let mut waiter = tokio::task::spawn_blocking(move || wait_with_usage(pid));
    let mut limit_hit = None;
    let mut peak_rss: Option<u64> = None;

    let finished = {
        let deadline = tokio::time::sleep(limits.wall_timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(MEMORY_POLL_INTERVAL);

        loop {
            tokio::select! {
                waited = &mut waiter => break Some(waited),
                _ = &mut deadline => {
                    limit_hit = Some(LimitHit::WallTime);
                    break None;
                }
                _ = poll.tick(), if limits.memory_limit.is_some() => {
                    if let Some(rss) = sample_tree_rss(pid) {
                        let peak = peak_rss.map_or(rss, |p| p.max(rss));
                        peak_rss = Some(peak);
                        if limits.memory_limit.is_some_and(|limit| peak > limit) {
                            limit_hit = Some(LimitHit::Memory);
                            break None;
                        }
                    }
                }
            }
        }
    };

    let waited = match finished {
        Some(waited) => waited,
        None => {
            debug!("{} 超出限制 {:?}，终止进程组", spec.display_name(), limit_hit);
            kill_group(pid);
            match tokio::time::timeout(KILL_GRACE, &mut waiter).await {
                Ok(waited) => waited,
                Err(_) => Ok(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "强制终止后进程仍未退出",
                ))),
            }
        }
    };

    // 进程已退出，清理可能残留的子孙进程
    drop(group);
    let elapsed = start.elapsed();

    let (stdout, stdout_truncated) = collect_output(stdout_task).await;
    let (stderr, stderr_truncated) = collect_output(stderr_task).await;

    let (status, max_rss) = waited
        .map_err(io::Error::other)
        .and_then(|waited| waited)
        .map_err(|source| ToolchainError::WaitFailed {
            program: spec.display_name(),
            source,
        })?;
    if max_rss > 0 {
        peak_rss = Some(peak_rss.map_or(max_rss, |p| p.max(max_rss)));
    }

    Ok(ProcessOutcome {
        exit_code: status.code(),
        signal: status.signal(),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        elapsed,
        limit_hit,
        peak_rss,
    })
}

/// 刚写完的可执行文件可能仍被并发 fork 出的进程持有写句柄（ETXTBSY），稍等重试
async fn spawn_with_retry(command: &mut Command) -> io::Result<Child> {
    let mut attempts = 0;
    loop {
        match command.spawn() {
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            result => return result,
        }
    }
}

/// 阻塞等待子进程退出，同时取回内核记录的常驻内存峰值（字节）
///
/// 峰值包含该进程已回收的后代。
fn wait_with_usage(pid: u32) -> io::Result<(ExitStatus, u64)> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage 是纯数据结构，全零是合法值
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: 只等待本模块启动的子进程，指针都指向当前栈上的变量
        let rc = unsafe { libc::wait4(pid as libc::pid_t, &mut status, 0, &mut usage) };
        if rc >= 0 {
            let max_rss = u64::try_from(usage.ru_maxrss).unwrap_or(0) * MAXRSS_UNIT;
            return Ok((ExitStatus::from_raw(status), max_rss));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// 对整个进程组发送 SIGKILL，进程组不存在时静默忽略
fn kill_group(pid: u32) {
    // SAFETY: killpg 只向进程组发送信号，不涉及内存
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("终止进程组 {} 失败: {}", pid, err);
        }
    }
}

/// 进程树当前的常驻内存（字节）
///
/// 取各进程 VmRSS 之和与根进程 VmHWM 中的较大者。根进程已退出时返回 `None`。
#[cfg(target_os = "linux")]
fn sample_tree_rss(root: u32) -> Option<u64> {
    let (root_rss, root_hwm) = read_rss(root)?;
    let mut total = root_rss;
    let mut pending = read_children(root);
    let mut visited = 1;
    while let Some(pid) = pending.pop() {
        if visited >= MAX_TREE_SIZE {
            break;
        }
        visited += 1;
        if let Some((rss, _)) = read_rss(pid) {
            total += rss;
        }
        pending.extend(read_children(pid));
    }
    Some(total.max(root_hwm))
}

#[cfg(not(target_os = "linux"))]
fn sample_tree_rss(_root: u32) -> Option<u64> {
    None
}

/// 读取 (VmRSS, VmHWM)，僵尸进程没有这两项
#[cfg(target_os = "linux")]
fn read_rss(pid: u32) -> Option<(u64, u64)> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let field = |name: &str| {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    let rss = field("VmRSS:")?;
    Some((rss, field("VmHWM:").unwrap_or(rss)))
}

#[cfg(target_os = "linux")]
fn read_children(pid: u32) -> Vec<u32> {
    std::fs::read_to_string(format!("/proc/{0}/task/{0}/children", pid))
        .map(|list| {
            list.split_whitespace()
                .filter_map(|child| child.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// 读取整个流，只保留前 `limit` 字节
fn read_capped<R: Read>(mut reader: R, limit: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let room = limit.saturating_sub(kept.len());
        if room > 0 {
            kept.extend_from_slice(&chunk[..n.min(room)]);
        }
        if n > room {
            truncated = true;
        }
    }
    Ok((kept, truncated))
}

async fn collect_output(task: Option<JoinHandle<io::Result<(Vec<u8>, bool)>>>) -> (Vec<u8>, bool) {
    let Some(mut handle) = task else {
        return (Vec::new(), false);
    };
    match tokio::time::timeout(KILL_GRACE, &mut handle).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(Ok(Err(e))) => {
            warn!("读取子进程输出失败: {}", e);
            (Vec::new(), false)
        }
        Ok(Err(e)) => {
            warn!("输出读取任务异常: {}", e);
            (Vec::new(), false)
        }
        Err(_) => {
            // 有逃出进程组的后代仍持有管道，读取线程会在管道关闭后自行结束
            (Vec::new(), true)
        }
    }
}
