//! 重放等价性与崩溃恢复测试

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use colony::adapters::{
    ActivityAdapter, ActivityRunner, AdapterError, AdapterKind, AdapterSet, ScriptedAdapter,
};
use colony::agent::{AgentStatus, DirectivePolicy};
use colony::config::{AgentRoleSection, AppConfig};
use colony::dispatch::{Dispatcher, InboundEvent};
use colony::store::memory::MemoryStore;
use colony::store::sqlite::SqliteStore;
use colony::store::CheckpointStore;
use colony::workflow::{WorkflowEngine, WorkflowHandle, WorkflowState, WorkflowStatus};
use colony::OrchestratorError;

const CHAT_DIRECTIVE: &str = r#"{"action":"chat","channel":"dev","thread_id":"t1","text":"hello"}"#;
const DONE_DIRECTIVE: &str = r#"{"action":"done","summary":"wrapped up"}"#;

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.workflow.agents = vec![AgentRoleSection {
        id: "assistant".to_string(),
        role: "helper".to_string(),
    }];
    for retry in [
        &mut cfg.retry.completion,
        &mut cfg.retry.chat,
        &mut cfg.retry.repository,
    ] {
        retry.backoff_base_ms = 1;
        retry.backoff_cap_ms = 2;
    }
    cfg
}

fn dispatcher_on(
    store: Arc<dyn CheckpointStore>,
    completion_script: Vec<Result<String, AdapterError>>,
) -> Arc<Dispatcher> {
    let completion = Arc::new(ScriptedAdapter::with_script(AdapterKind::Completion, completion_script));
    let chat = Arc::new(ScriptedAdapter::new(AdapterKind::Chat));
    let mut set: AdapterSet = BTreeMap::new();
    set.insert(AdapterKind::Completion, completion as Arc<dyn ActivityAdapter>);
    set.insert(AdapterKind::Chat, chat as Arc<dyn ActivityAdapter>);
    let cfg = test_config();
    let runner = Arc::new(ActivityRunner::from_config(set, &cfg));
    Arc::new(Dispatcher::new(cfg, store, runner, Arc::new(DirectivePolicy)))
}

fn event(source: &str, payload: &str) -> InboundEvent {
    InboundEvent {
        event_type: "test".to_string(),
        source_id: source.to_string(),
        payload: payload.to_string(),
        received_at: chrono::Utc::now().timestamp_millis(),
        event_id: None,
        target_agent: None,
    }
}

async fn wait_terminal(handle: &WorkflowHandle) {
    let mut rx = handle.watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if rx.borrow_and_update().status.is_terminal() {
                break;
            }
            rx.changed().await.expect("engine dropped");
        }
    })
    .await
    .expect("workflow did not reach a terminal state");
}

#[tokio::test]
async fn live_run_matches_replay_from_origin() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher_on(
        store.clone(),
        vec![Ok(CHAT_DIRECTIVE.to_string()), Ok(DONE_DIRECTIVE.to_string())],
    );

    let wf = dispatcher.dispatch(event("chan-1", "greet and finish")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();
    wait_terminal(&handle).await;

    // 从空状态折叠完整日志，与在线执行的检查点逐字节一致
    let replayed = WorkflowEngine::replay_from_origin(store.as_ref(), &wf, &DirectivePolicy).unwrap();
    let checkpoint = store.load_checkpoint(&wf).unwrap().unwrap();
    assert_eq!(replayed.canonical_json().unwrap(), checkpoint.state_json);
    assert_eq!(replayed.status, WorkflowStatus::Completed);

    WorkflowEngine::verify_replay(store.as_ref(), &wf, &DirectivePolicy).unwrap();
}

#[tokio::test]
async fn verify_replay_over_reopened_database() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("colony.db");

    let store: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::new(&db_path).unwrap());
    let dispatcher = dispatcher_on(store, vec![Ok(DONE_DIRECTIVE.to_string())]);

    let wf = dispatcher.dispatch(event("chan-2", "finish up")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();
    wait_terminal(&handle).await;
    dispatcher.shutdown();

    // 全新进程视角：重新打开数据库校验
    let reopened = SqliteStore::new(&db_path).unwrap();
    WorkflowEngine::verify_replay(&reopened, &wf, &DirectivePolicy).unwrap();
}

#[tokio::test]
async fn tampered_checkpoint_is_reported_as_nondeterminism() {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher_on(store.clone(), vec![Ok(DONE_DIRECTIVE.to_string())]);

    let wf = dispatcher.dispatch(event("chan-3", "finish up")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();
    wait_terminal(&handle).await;

    let mut checkpoint = store.load_checkpoint(&wf).unwrap().unwrap();
    let mut state = WorkflowState::from_json(&checkpoint.state_json).unwrap();
    state.objective = "something else".to_string();
    checkpoint.state_json = state.canonical_json().unwrap();
    store.save_checkpoint(&checkpoint).unwrap();

    let err = WorkflowEngine::verify_replay(store.as_ref(), &wf, &DirectivePolicy).unwrap_err();
    assert!(matches!(err, OrchestratorError::Nondeterminism(_)));
}

/// 崩溃恢复：引擎在聊天调用挂起时停机，重启后沿用同一 dedup_key 重发
#[tokio::test]
async fn resume_redispatches_unresolved_call_with_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("colony.db");

    // 第一段生命周期：聊天适配器永远挂起，模拟停机时的在途调用
    struct StuckChat;
    #[async_trait::async_trait]
    impl ActivityAdapter for StuckChat {
        fn kind(&self) -> AdapterKind {
            AdapterKind::Chat
        }
        async fn invoke(&self, _r: &colony::adapters::AdapterRequest, _k: &str) -> Result<String, AdapterError> {
            std::future::pending().await
        }
    }

    let completion = Arc::new(ScriptedAdapter::with_script(
        AdapterKind::Completion,
        vec![Ok(CHAT_DIRECTIVE.to_string())],
    ));
    let mut set: AdapterSet = BTreeMap::new();
    set.insert(AdapterKind::Completion, completion as Arc<dyn ActivityAdapter>);
    set.insert(AdapterKind::Chat, Arc::new(StuckChat) as Arc<dyn ActivityAdapter>);
    let cfg = test_config();
    let store: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::new(&db_path).unwrap());
    let runner = Arc::new(ActivityRunner::from_config(set, &cfg));
    let dispatcher = Arc::new(Dispatcher::new(cfg, store.clone(), runner, Arc::new(DirectivePolicy)));

    let wf = dispatcher.dispatch(event("chan-4", "greet and finish")).await.unwrap();

    // 等检查点落到「聊天调用挂起」再停机
    let pending_key = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(checkpoint) = store.load_checkpoint(&wf).unwrap() {
                let state = WorkflowState::from_json(&checkpoint.state_json).unwrap();
                if let Some(agent) = state.agent("assistant") {
                    if agent.status == AgentStatus::AwaitingExternal {
                        if let Some(pending) = &agent.pending {
                            if pending.kind == AdapterKind::Chat {
                                break pending.dedup_key.clone();
                            }
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("chat call never checkpointed");
    dispatcher.shutdown();

    // 第二段生命周期：新进程、新适配器，从同一数据库恢复
    let store2: Arc<dyn CheckpointStore> = Arc::new(SqliteStore::new(&db_path).unwrap());
    let chat2 = Arc::new(ScriptedAdapter::new(AdapterKind::Chat));
    let completion2 = Arc::new(ScriptedAdapter::with_script(
        AdapterKind::Completion,
        vec![Ok(DONE_DIRECTIVE.to_string())],
    ));
    let mut set2: AdapterSet = BTreeMap::new();
    set2.insert(AdapterKind::Completion, completion2 as Arc<dyn ActivityAdapter>);
    set2.insert(AdapterKind::Chat, chat2.clone() as Arc<dyn ActivityAdapter>);
    let cfg2 = test_config();
    let runner2 = Arc::new(ActivityRunner::from_config(set2, &cfg2));
    let dispatcher2 = Arc::new(Dispatcher::new(cfg2, store2.clone(), runner2, Arc::new(DirectivePolicy)));

    let resumed = dispatcher2.resume_all().await.unwrap();
    assert_eq!(resumed, 1);

    let handle = dispatcher2.handle(&wf).await.expect("resumed handle missing");
    wait_terminal(&handle).await;
    let snapshot = handle.query();
    assert_eq!(snapshot.status, WorkflowStatus::Completed);

    // 重发沿用停机前的 dedup_key，远端按键去重不产生第二次副作用
    let calls = chat2.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, pending_key);

    WorkflowEngine::verify_replay(store2.as_ref(), &wf, &DirectivePolicy).unwrap();
}
