use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 测试案例
///
/// 启动时一次性载入，之后在所有并发单元间只读共享。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// 所属题号（不带 `P` 前缀）
    pub problem: String,
    /// 在该题中的序号（按目录名排序后的位置）
    pub index: usize,
    /// 案例目录名（`1`、`test_basic` 等，不固定）
    pub name: String,
    /// 标准输入
    pub input: Vec<u8>,
    /// 预期输出
    pub expected_output: Vec<u8>,
    /// 单个案例的超时覆盖
    pub timeout: Option<Duration>,
}

impl TestCase {
    /// 实际使用的超时时间
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// 案例目录下可选的 `case.toml`
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct CaseOverrides {
    pub timeout_secs: Option<u64>,
}
