//! 仓库操作适配器
//!
//! 面向代码托管平台的 REST 接口（GitHub 风格 contents / issues 端点）。
//! 写操作带 Idempotency-Key 头（= dedup_key），服务端可据此去重；
//! 支持的 operation：read_file / write_file / create_issue / comment_issue。

use async_trait::async_trait;

use crate::adapters::{classify_status, ActivityAdapter, AdapterError, AdapterKind, AdapterRequest};

/// REST 仓库适配器
pub struct RepoAdapter {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl RepoAdapter {
    pub fn new(api_base: &str, token: Option<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .user_agent("colony-agent")
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, url: String, dedup_key: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("Idempotency-Key", dedup_key);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl ActivityAdapter for RepoAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Repository
    }

    async fn invoke(&self, request: &AdapterRequest, dedup_key: &str) -> Result<String, AdapterError> {
        let AdapterRequest::Repository { repo, operation, payload } = request else {
            return Err(AdapterError::Permanent(format!(
                "Repository adapter got {} request",
                request.kind()
            )));
        };

        let builder = match operation.as_str() {
            "read_file" => {
                let path = payload
                    .get("path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AdapterError::Permanent("read_file requires payload.path".into()))?;
                let url = format!("{}/repos/{}/contents/{}", self.api_base, repo, path);
                self.request(reqwest::Method::GET, url, dedup_key)
            }
            "write_file" => {
                let path = payload
                    .get("path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AdapterError::Permanent("write_file requires payload.path".into()))?;
                let url = format!("{}/repos/{}/contents/{}", self.api_base, repo, path);
                self.request(reqwest::Method::PUT, url, dedup_key).json(payload)
            }
            "create_issue" => {
                let url = format!("{}/repos/{}/issues", self.api_base, repo);
                self.request(reqwest::Method::POST, url, dedup_key).json(payload)
            }
            "comment_issue" => {
                let number = payload
                    .get("number")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| AdapterError::Permanent("comment_issue requires payload.number".into()))?;
                let url = format!("{}/repos/{}/issues/{}/comments", self.api_base, repo, number);
                self.request(reqwest::Method::POST, url, dedup_key).json(payload)
            }
            other => {
                return Err(AdapterError::Permanent(format!(
                    "Unknown repository operation: {}",
                    other
                )))
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|e| AdapterError::Transient(format!("Repo request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status, &body))
        }
    }
}
