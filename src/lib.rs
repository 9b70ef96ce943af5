//! # Lazy Grader
//!
//! 批量批改学生 C / C++ 程序作业的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有主机资源，只暴露能力
//! - `run_limited` - 受限子进程（超时、内存上限、输出上限、整组终止）
//! - `UnitWorkspace` - 每个单元独立的工作目录
//! - `KeyPool` - LLM API key 池
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个提交
//! - `Discovery` - 扫描提交
//! - `Compiler` - 编译
//! - `TestRunner` - 执行测试案例并判定
//! - `PartialCreditScorer` - 评分（捷径 + 带重试的预言机调用）
//! - `LlmService` - LLM 评分预言机
//! - `Journal` - 只追加的进度日志
//! - `report` - 成绩表、摘要、明细
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个提交"的完整批改流程
//! - `UnitCtx` - 上下文封装（单元 + 序号）
//! - `GradingFlow` - 流程编排（compile → test → score）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/app` - 运行生命周期（grade / build / report / clear）
//! - `orchestrator/batch_processor` - 并发调度、故障隔离、即时落盘
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::{GradingRecord, Submission, TestCase, UnitId, Verdict};
pub use orchestrator::{App, RunSummary, Scheduler, Selection};
pub use services::{Journal, JournalSnapshot, ScoringOracle};
pub use workflow::{GradingFlow, UnitCtx, UnitPipeline};
