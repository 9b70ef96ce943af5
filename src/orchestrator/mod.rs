//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责一次运行的生命周期和并发调度，不做具体的批改判断。
//!
//! ## 模块划分
//!
//! ### `app` - 应用生命周期
//! - grade / build / report / clear 四个命令
//! - 环境检查、扫描、续跑过滤、报告生成
//! - 选择评分预言机（LLM 或未配置）
//!
//! ### `batch_processor` - 批量批改调度器
//! - 控制并发数量（Semaphore + JoinSet）
//! - 捕获单元内的 panic
//! - 单元结束后立即追加进度日志
//! - 响应中断信号
//!
//! ## 层次关系
//!
//! ```text
//! app (一次运行)
//!     ↓
//! batch_processor (处理 Vec<Submission>)
//!     ↓
//! workflow::GradingFlow (处理单个 Submission)
//!     ↓
//! services (能力层：compile / test / score / journal)
//!     ↓
//! infrastructure (基础设施：受限子进程、工作目录、key 池)
//! ```

pub mod app;
pub mod batch_processor;

pub use app::App;
pub use batch_processor::{RunSummary, Scheduler, Selection};
