//! 编排器错误类型
//!
//! Transient/Permanent 归 AdapterError（adapters 模块），存储错误归
//! StoreError（store 模块）；此处是工作流层面的终态错误，
//! 其中 Nondeterminism 表示重放与在线执行分歧，必须显式上报而非吞掉。

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// 工作流编排过程中的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 实例已进入终态，不再接受信号
    #[error("Workflow {0} has ended")]
    Ended(String),

    #[error("Workflow {0} not found")]
    NotFound(String),

    #[error("Agent {0} not found in workflow")]
    AgentNotFound(String),

    /// 重放分歧：信号序号断裂、适配器结果与挂起调用不匹配、或重放镜像与在线状态不一致
    #[error("Nondeterminism detected: {0}")]
    Nondeterminism(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// 信号被拒绝（格式、目标等边界问题）
    #[error("Signal rejected: {0}")]
    Rejected(String),

    #[error("Prompt timed out after {0:?}")]
    PromptTimeout(Duration),
}
