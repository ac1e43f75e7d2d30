//! 聊天回复适配器
//!
//! 向消息平台的 Webhook POST 回复文本。dedup_key 随请求体发送，
//! 平台侧可按 key 去重；本地去重缓存由 ActivityRunner 统一承担。

use async_trait::async_trait;
use serde::Serialize;

use crate::adapters::{classify_status, ActivityAdapter, AdapterError, AdapterKind, AdapterRequest};

/// Webhook 聊天适配器
pub struct ChatAdapter {
    client: reqwest::Client,
    webhook_url: String,
}

#[derive(Serialize)]
struct ChatPayload<'a> {
    channel: &'a str,
    thread_id: &'a str,
    text: &'a str,
    dedup_key: &'a str,
}

impl ChatAdapter {
    pub fn new(webhook_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url: webhook_url.to_string(),
        }
    }
}

#[async_trait]
impl ActivityAdapter for ChatAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Chat
    }

    async fn invoke(&self, request: &AdapterRequest, dedup_key: &str) -> Result<String, AdapterError> {
        let AdapterRequest::Chat { channel, thread_id, text } = request else {
            return Err(AdapterError::Permanent(format!(
                "Chat adapter got {} request",
                request.kind()
            )));
        };

        let payload = ChatPayload {
            channel,
            thread_id,
            text,
            dedup_key,
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(format!("Chat webhook send failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status, &body))
        }
    }
}
