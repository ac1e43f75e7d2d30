//! LLM 补全适配器
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! dedup_key 作为请求的 user 字段透传，便于端侧按 key 去重/追踪；
//! 客户端错误按消息启发式分类（限流/超时/连接 -> Transient，无效请求/鉴权 -> Permanent）。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::adapters::{ActivityAdapter, AdapterError, AdapterKind, AdapterRequest};

/// OpenAI 兼容补全适配器：持有 Client，按请求携带的 ModelParams 发起补全
pub struct CompletionAdapter {
    client: Client<OpenAIConfig>,
}

impl CompletionAdapter {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
        }
    }
}

/// 按错误消息启发式分类 LLM 客户端错误；无法判断时按 Transient 处理（交给重试预算兜底）
fn classify_llm_error(msg: &str) -> AdapterError {
    let lower = msg.to_lowercase();
    if lower.contains("rate limit")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("overloaded")
    {
        AdapterError::Transient(msg.to_string())
    } else if lower.contains("invalid")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("api key")
        || lower.contains("context length")
    {
        AdapterError::Permanent(msg.to_string())
    } else {
        AdapterError::Transient(msg.to_string())
    }
}

#[async_trait]
impl ActivityAdapter for CompletionAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Completion
    }

    async fn invoke(&self, request: &AdapterRequest, dedup_key: &str) -> Result<String, AdapterError> {
        let AdapterRequest::Completion { system, history, params } = request else {
            return Err(AdapterError::Permanent(format!(
                "Completion adapter got {} request",
                request.kind()
            )));
        };

        // 历史以单条 user 消息渲染：内容来自日志化的 Turn，重放时逐字节一致
        let transcript = history
            .iter()
            .map(|(actor, content)| format!("[{}] {}", actor, content))
            .collect::<Vec<_>>()
            .join("\n");

        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.clone())
                    .build()
                    .map_err(|e| AdapterError::Permanent(e.to_string()))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(transcript)
                    .build()
                    .map_err(|e| AdapterError::Permanent(e.to_string()))?,
            ),
        ];

        let api_request = CreateChatCompletionRequestArgs::default()
            .model(&params.model)
            .temperature(params.temperature)
            .messages(messages)
            .user(dedup_key)
            .build()
            .map_err(|e| AdapterError::Permanent(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(api_request)
            .await
            .map_err(|e| classify_llm_error(&e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }
}
