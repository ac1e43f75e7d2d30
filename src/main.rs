//! Colony - 可恢复的多 Agent 编排服务
//!
//! 入口：初始化日志与配置，装配存储、适配器与分发器，恢复
//! 未完成的工作流，然后从命令行启动一个会话并跟踪到终局。

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use colony::adapters::{
    ActivityRunner, AdapterKind, AdapterSet, ChatAdapter, CompletionAdapter, RepoAdapter,
    ScriptedAdapter,
};
use colony::agent::DirectivePolicy;
use colony::config::load_config;
use colony::dispatch::{Dispatcher, InboundEvent};
use colony::store::{memory::MemoryStore, sqlite::SqliteStore, CheckpointStore};
use colony::workflow::WorkflowNote;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    colony::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;

    // 存储：配置了 db_path 则走 SQLite，否则退化为进程内存储
    let store: Arc<dyn CheckpointStore> = match &cfg.app.db_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Using SQLite checkpoint store");
            Arc::new(SqliteStore::new(path).context("Failed to open checkpoint database")?)
        }
        None => {
            tracing::warn!("No db_path configured, using in-memory store (no crash recovery)");
            Arc::new(MemoryStore::new())
        }
    };

    let mut adapters: AdapterSet = BTreeMap::new();

    // 凭证缺失时换成脚本化适配器，便于离线试跑
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) => {
            adapters.insert(
                AdapterKind::Completion,
                Arc::new(CompletionAdapter::new(cfg.llm.base_url.as_deref(), Some(&key))),
            );
        }
        Err(_) => {
            tracing::warn!("OPENAI_API_KEY not set, using scripted completion adapter");
            adapters.insert(
                AdapterKind::Completion,
                Arc::new(ScriptedAdapter::new(AdapterKind::Completion)),
            );
        }
    }

    match &cfg.chat.webhook_url {
        Some(url) => {
            adapters.insert(
                AdapterKind::Chat,
                Arc::new(ChatAdapter::new(url, cfg.chat.timeout_secs)),
            );
        }
        None => {
            adapters.insert(AdapterKind::Chat, Arc::new(ScriptedAdapter::new(AdapterKind::Chat)));
        }
    }

    match std::env::var("REPO_TOKEN") {
        Ok(token) => {
            adapters.insert(
                AdapterKind::Repository,
                Arc::new(RepoAdapter::new(&cfg.repo.api_base, Some(token), cfg.repo.timeout_secs)),
            );
        }
        Err(_) => {
            adapters.insert(
                AdapterKind::Repository,
                Arc::new(ScriptedAdapter::new(AdapterKind::Repository)),
            );
        }
    }

    let runner = Arc::new(ActivityRunner::from_config(adapters, &cfg));
    let dispatcher = Arc::new(Dispatcher::new(cfg, store, runner, Arc::new(DirectivePolicy)));

    // 先恢复上次中断的实例
    dispatcher
        .resume_all()
        .await
        .context("Failed to resume unfinished workflows")?;

    let objective = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Summarize your objective and finish".to_string());

    let workflow_id = dispatcher
        .dispatch(InboundEvent {
            event_type: "cli".to_string(),
            source_id: "cli-session".to_string(),
            payload: objective,
            received_at: chrono::Utc::now().timestamp_millis(),
            event_id: None,
            target_agent: None,
        })
        .await
        .context("Failed to start workflow")?;
    println!("workflow {} started", workflow_id);

    let handle = dispatcher
        .handle(&workflow_id)
        .await
        .context("Workflow handle missing")?;
    let mut notes = handle.subscribe();

    // 跟踪到终局；Ctrl-C 优雅关停（实例保持可恢复）
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                dispatcher.shutdown();
                println!("shut down, workflow {} remains resumable", workflow_id);
                return Ok(());
            }
            note = notes.recv() => match note {
                Ok(WorkflowNote::AgentTerminated { agent_id, reason }) => {
                    println!("agent {} terminated: {}", agent_id, reason);
                }
                Ok(WorkflowNote::AgentFailed { agent_id, error }) => {
                    println!("agent {} failed: {}", agent_id, error);
                }
                Ok(WorkflowNote::QuorumReached { done }) => {
                    println!("quorum reached with {} done", done);
                }
                Ok(WorkflowNote::Nondeterminism { message }) => {
                    eprintln!("nondeterminism: {}", message);
                }
                Ok(WorkflowNote::Ended { status }) => {
                    println!("workflow {} ended: {}", workflow_id, status.as_str());
                    break;
                }
                Err(_) => break,
            },
        }
    }

    let snapshot = dispatcher.query(&workflow_id).await?;
    for agent in &snapshot.agents {
        println!(
            "  {}: {:?}, {} turns{}",
            agent.id,
            agent.status,
            agent.turn_count,
            agent
                .last_error
                .as_deref()
                .map(|e| format!(" (last error: {})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}
