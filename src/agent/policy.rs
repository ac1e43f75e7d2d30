//! 指令策略：把补全输出解释为下一步行动
//!
//! 默认策略要求 LLM 输出单行 JSON 指令：
//! `{"action":"chat",...}` / `{"action":"repo",...}` / `{"action":"note",...}` /
//! `{"action":"done","summary":...}`。提取支持 ```json
//! 围栏或取首 `{` 至末 `}`；纯文本视为最终答案（等价 done）。
//! 策略必须无状态：重放时对同一补全内容给出同一指令。

use serde::Deserialize;
use serde_json::Value;

/// 策略解释出的指令
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// 发送聊天回复
    Chat {
        channel: String,
        thread_id: String,
        text: String,
    },
    /// 执行仓库操作
    Repo {
        repo: String,
        operation: String,
        payload: Value,
    },
    /// 向协调板发布备注（其他 Agent 下一步可见）
    Note { topic: String, body: String },
    /// 目标达成，摘要入板（法定人数统计）
    Done { summary: String },
    /// 形似 JSON 但无法解析/动作未知：触发一次纠正性重试
    Malformed { error: String },
}

/// 补全解释策略；实现必须无状态且确定
pub trait AgentPolicy: Send + Sync {
    fn interpret(&self, completion: &str) -> Directive;
}

/// 原始指令 JSON 形状
#[derive(Debug, Deserialize)]
struct RawDirective {
    action: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

/// 默认策略
#[derive(Debug, Default)]
pub struct DirectivePolicy;

impl DirectivePolicy {
    /// 从文本中提取 JSON 片段；无 JSON 迹象时返回 None
    fn extract_json(output: &str) -> Option<&str> {
        let trimmed = output.trim();
        if let Some(start) = trimmed.find("```json") {
            let rest = &trimmed[start + 7..];
            return Some(
                rest.find("```")
                    .map(|end| rest[..end].trim())
                    .unwrap_or_else(|| rest.trim()),
            );
        }
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        if end > start {
            Some(&trimmed[start..=end])
        } else {
            None
        }
    }
}

impl AgentPolicy for DirectivePolicy {
    fn interpret(&self, completion: &str) -> Directive {
        let trimmed = completion.trim();

        let Some(json_str) = Self::extract_json(trimmed) else {
            // 含 { 但提取不出完整片段（如未闭合的 JSON）：按 Malformed 走纠正性重试
            if trimmed.contains('{') {
                return Directive::Malformed {
                    error: format!(
                        "Unclosed JSON fragment: {}",
                        trimmed.chars().take(120).collect::<String>()
                    ),
                };
            }
            // 纯文本即最终答案
            return Directive::Done {
                summary: trimmed.to_string(),
            };
        };

        let raw: RawDirective = match serde_json::from_str(json_str) {
            Ok(raw) => raw,
            Err(e) => {
                return Directive::Malformed {
                    error: format!("{}: {}", e, json_str.chars().take(120).collect::<String>()),
                }
            }
        };

        match raw.action.as_str() {
            "chat" => match (raw.channel, raw.text) {
                (Some(channel), Some(text)) => Directive::Chat {
                    channel,
                    thread_id: raw.thread_id.unwrap_or_default(),
                    text,
                },
                _ => Directive::Malformed {
                    error: "chat directive requires channel and text".to_string(),
                },
            },
            "repo" => match (raw.repo, raw.operation) {
                (Some(repo), Some(operation)) => Directive::Repo {
                    repo,
                    operation,
                    payload: raw.payload.unwrap_or(Value::Null),
                },
                _ => Directive::Malformed {
                    error: "repo directive requires repo and operation".to_string(),
                },
            },
            "note" => Directive::Note {
                topic: raw.topic.unwrap_or_else(|| "note".to_string()),
                body: raw.body.unwrap_or_default(),
            },
            "done" => Directive::Done {
                summary: raw.summary.unwrap_or_default(),
            },
            other => Directive::Malformed {
                error: format!("Unknown action: {}", other),
            },
        }
    }
}
