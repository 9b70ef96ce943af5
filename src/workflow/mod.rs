pub mod grading_flow;
pub mod unit_ctx;

pub use grading_flow::{GradingFlow, UnitPipeline};
pub use unit_ctx::UnitCtx;
