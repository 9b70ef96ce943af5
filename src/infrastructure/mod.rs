//! 基础设施层（Infrastructure Layer）
//!
//! 持有稀缺资源，只暴露能力，不认识批改流程：
//!
//! - `process` - 受限子进程（超时、内存上限、输出上限、进程组终止）
//! - `workspace` - 每个批改单元独占的工作目录
//! - `key_pool` - LLM API key 池

pub mod key_pool;
pub mod process;
pub mod workspace;

pub use key_pool::{KeyLease, KeyPool};
pub use process::{run_limited, CommandSpec, LimitHit, ProcessLimits, ProcessOutcome};
pub use workspace::UnitWorkspace;
