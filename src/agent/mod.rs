//! Agent 状态机
//!
//! 每个 Agent 由所属工作流独占持有：追加式 Turn 历史、至多一个未决
//! PendingCall、{Idle, Acting, AwaitingExternal, Terminated, Failed} 状态。
//! 策略（policy）无状态地把补全输出解释为指令，状态推进全部可由历史重放推导。

pub mod machine;
pub mod policy;
pub mod state;

pub use machine::{Publication, StepContext, StepOutcome};
pub use policy::{AgentPolicy, Directive, DirectivePolicy};
pub use state::{AgentId, AgentState, AgentStatus, PendingCall, Turn, TurnActor};
