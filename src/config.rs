//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COLONY__*` 覆盖
//! （双下划线表示嵌套，如 `COLONY__LLM__MODEL=gpt-4o-mini`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub chat: ChatSection,
    #[serde(default)]
    pub repo: RepoSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub retry: RetrySections,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            chat: ChatSection::default(),
            repo: RepoSection::default(),
            workflow: WorkflowSection::default(),
            retry: RetrySections::default(),
        }
    }
}

/// [app] 段：应用名与持久化路径
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 检查点数据库路径；未设置时用内存存储（重启不保留）
    pub db_path: Option<PathBuf>,
}

/// [llm] 段：补全后端（OpenAI 兼容端点）
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_llm_timeout_secs() -> u64 {
    60
}

/// [chat] 段：消息平台回复 Webhook
#[derive(Debug, Clone, Deserialize)]
pub struct ChatSection {
    pub webhook_url: Option<String>,
    #[serde(default = "default_io_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_io_timeout_secs(),
        }
    }
}

/// [repo] 段：代码托管平台 REST 端点；Token 从 REPO_TOKEN 环境变量读取
#[derive(Debug, Clone, Deserialize)]
pub struct RepoSection {
    #[serde(default = "default_repo_api_base")]
    pub api_base: String,
    #[serde(default = "default_io_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RepoSection {
    fn default() -> Self {
        Self {
            api_base: default_repo_api_base(),
            timeout_secs: default_io_timeout_secs(),
        }
    }
}

fn default_repo_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_io_timeout_secs() -> u64 {
    30
}

/// [workflow] 段：单会话的 Agent 编成与终止策略
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    /// 每个会话启动的 Agent 角色列表（注册顺序即此顺序）
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentRoleSection>,
    /// 法定人数：需要多少个 Agent 发布 "done" 才算完成；未设置时为全体
    pub quorum: Option<usize>,
    /// 单 Agent 补全步数上限，防止死循环
    #[serde(default = "default_max_agent_steps")]
    pub max_agent_steps: u32,
    /// 整个实例的截止时间（毫秒）；未设置时不限
    pub deadline_ms: Option<u64>,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            agents: default_agents(),
            quorum: None,
            max_agent_steps: default_max_agent_steps(),
            deadline_ms: None,
        }
    }
}

/// [[workflow.agents]] 条目：Agent 标识与角色描述
#[derive(Debug, Clone, Deserialize)]
pub struct AgentRoleSection {
    pub id: String,
    pub role: String,
}

fn default_agents() -> Vec<AgentRoleSection> {
    vec![AgentRoleSection {
        id: "assistant".to_string(),
        role: "General-purpose assistant".to_string(),
    }]
}

fn default_max_agent_steps() -> u32 {
    20
}

/// [retry.*] 段：按适配器种类的重试预算
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySections {
    #[serde(default = "default_completion_retry")]
    pub completion: RetrySection,
    #[serde(default = "default_chat_retry")]
    pub chat: RetrySection,
    #[serde(default = "default_repository_retry")]
    pub repository: RetrySection,
}

impl Default for RetrySections {
    fn default() -> Self {
        Self {
            completion: default_completion_retry(),
            chat: default_chat_retry(),
            repository: default_repository_retry(),
        }
    }
}

/// 单类适配器的重试预算：次数上限与指数退避参数
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

fn default_completion_retry() -> RetrySection {
    RetrySection {
        max_attempts: 4,
        backoff_base_ms: 500,
        backoff_cap_ms: 8_000,
    }
}

fn default_chat_retry() -> RetrySection {
    RetrySection {
        max_attempts: 3,
        backoff_base_ms: 1_000,
        backoff_cap_ms: 10_000,
    }
}

fn default_repository_retry() -> RetrySection {
    RetrySection {
        max_attempts: 3,
        backoff_base_ms: 1_000,
        backoff_cap_ms: 10_000,
    }
}

/// 从 config 目录加载配置，环境变量 COLONY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COLONY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COLONY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
