//! Colony - Rust 多智能体编排内核
//!
//! 在一个最小的持久化执行基座（信号日志 + 检查点）之上，
//! 编排多个独立推理的 Agent，并保证外部副作用在崩溃重放后不重复。
//!
//! 模块划分：
//! - **adapters**: 外部系统适配器（LLM 补全 / 聊天回复 / 仓库操作）与重试执行器
//! - **agent**: 单 Agent 状态机（Turn 历史、PendingCall、指令策略）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **coordination**: 跨 Agent 协调板（逻辑时钟、游标、法定人数）
//! - **dispatch**: 入站事件分发（会话键 -> 工作流实例）与查询面
//! - **observability**: 日志初始化
//! - **store**: 检查点存储（SQLite / 内存）
//! - **workflow**: 编排工作流（确定性事件循环、重放、恢复）

pub mod adapters;
pub mod agent;
pub mod config;
pub mod coordination;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod store;
pub mod workflow;

pub use dispatch::Dispatcher;
pub use error::OrchestratorError;
