// Engine module - 扫描编排
// 状态机 + 任务入口

pub mod state;
pub mod task;

pub use state::{ScanStateMachine, SeverityCounts};
pub use task::{AnalysisMode, ScanEngine, TaskSummary};
