//! 编排工作流：确定性事件循环 + 持久化重放

pub mod engine;
pub mod state;

pub use engine::{WorkflowEngine, WorkflowHandle};
pub use state::{
    AgentRole, AgentSnapshot, Dispatch, SessionSpec, Signal, StepReport, WorkflowNote,
    WorkflowSnapshot, WorkflowState, WorkflowStatus,
};
