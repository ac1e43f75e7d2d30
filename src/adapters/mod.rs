//! 外部系统适配器
//!
//! 每个适配器把一种外部副作用（LLM 补全 / 聊天回复 / 仓库操作）包成
//! `invoke(request, dedup_key)`：失败分为 Transient（可重试）与 Permanent（立即失败）。
//! 同一 (request, dedup_key) 重复调用不得产生第二次外部副作用——持久化基座
//! 崩溃重放时会重新执行编排逻辑，适配器是幂等边界。

mod chat;
mod llm;
mod mock;
mod repo;
mod runner;

pub use chat::ChatAdapter;
pub use llm::CompletionAdapter;
pub use mock::ScriptedAdapter;
pub use repo::RepoAdapter;
pub use runner::{ActivityRunner, RetryPolicy};

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 适配器种类：决定重试预算与路由
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AdapterKind {
    Completion,
    Chat,
    Repository,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::Completion => write!(f, "completion"),
            AdapterKind::Chat => write!(f, "chat"),
            AdapterKind::Repository => write!(f, "repository"),
        }
    }
}

/// 补全采样参数（进入检查点，需可序列化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f32,
}

/// 适配器请求：按种类的具体请求体
///
/// history 为 (actor, content) 对；actor 只用于渲染 prompt，不是 API 角色。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterRequest {
    Completion {
        system: String,
        history: Vec<(String, String)>,
        params: ModelParams,
    },
    Chat {
        channel: String,
        thread_id: String,
        text: String,
    },
    Repository {
        repo: String,
        operation: String,
        payload: serde_json::Value,
    },
}

impl AdapterRequest {
    pub fn kind(&self) -> AdapterKind {
        match self {
            AdapterRequest::Completion { .. } => AdapterKind::Completion,
            AdapterRequest::Chat { .. } => AdapterKind::Chat,
            AdapterRequest::Repository { .. } => AdapterKind::Repository,
        }
    }
}

/// 适配器失败分类
///
/// Transient 由 ActivityRunner 在本地重试，永不直接上抛；
/// Permanent 立即上抛并使发起 Agent 进入 Failed。
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdapterError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),
}

/// 一次适配器调用的最终结果（重试已在 Runner 内完成），随信号进入日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdapterOutcome {
    /// 成功；attempts 含首次调用
    Success { result: String, attempts: u32 },
    /// 重试预算耗尽
    Exhausted { error: String, attempts: u32 },
    /// 永久失败，未重试
    Permanent { error: String, attempts: u32 },
}

/// 外部副作用适配器：实现方负责把 dedup_key 传递到远端或在本地去重
#[async_trait]
pub trait ActivityAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    async fn invoke(&self, request: &AdapterRequest, dedup_key: &str) -> Result<String, AdapterError>;
}

/// 按种类收集适配器，供 Runner 路由
pub type AdapterSet = BTreeMap<AdapterKind, std::sync::Arc<dyn ActivityAdapter>>;

/// HTTP 状态码分类：408/425/429/5xx 为 Transient，其余 4xx 为 Permanent
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> AdapterError {
    let code = status.as_u16();
    let msg = format!("HTTP {}: {}", code, body.chars().take(200).collect::<String>());
    if code == 408 || code == 425 || code == 429 || status.is_server_error() {
        AdapterError::Transient(msg)
    } else {
        AdapterError::Permanent(msg)
    }
}
