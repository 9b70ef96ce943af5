//! 批改单元上下文
//!
//! 封装"我正在批改第几个单元、是谁的哪一题"这一信息

use std::fmt::Display;

use crate::models::UnitId;

/// 批改单元上下文
#[derive(Debug, Clone)]
pub struct UnitCtx {
    pub unit: UnitId,

    /// 本次运行中的序号（从1开始，仅用于日志显示）
    pub index: usize,

    /// 本次运行需要批改的总数
    pub total: usize,
}

impl UnitCtx {
    pub fn new(unit: UnitId, index: usize, total: usize) -> Self {
        Self { unit, index, total }
    }
}

impl Display for UnitCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{} {}]", self.index, self.total, self.unit)
    }
}
