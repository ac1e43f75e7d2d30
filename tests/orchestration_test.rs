//! 编排端到端测试：分发器 + 引擎 + 脚本化适配器

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use colony::adapters::{
    ActivityAdapter, ActivityRunner, AdapterError, AdapterKind, AdapterRequest, AdapterSet,
    ScriptedAdapter,
};
use colony::agent::{AgentStatus, DirectivePolicy, TurnActor};
use colony::config::{AgentRoleSection, AppConfig};
use colony::dispatch::{Dispatcher, InboundEvent};
use colony::store::memory::MemoryStore;
use colony::store::CheckpointStore;
use colony::workflow::{WorkflowHandle, WorkflowSnapshot, WorkflowStatus};
use colony::OrchestratorError;

const CHAT_DIRECTIVE: &str = r#"{"action":"chat","channel":"dev","thread_id":"t1","text":"hello"}"#;
const DONE_DIRECTIVE: &str = r#"{"action":"done","summary":"wrapped up"}"#;

fn test_config(agents: &[(&str, &str)], quorum: Option<usize>) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.workflow.agents = agents
        .iter()
        .map(|(id, role)| AgentRoleSection {
            id: id.to_string(),
            role: role.to_string(),
        })
        .collect();
    cfg.workflow.quorum = quorum;
    // 退避压到毫秒级，测试不等真实退避
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

fn scripted_set() -> (AdapterSet, Arc<ScriptedAdapter>, Arc<ScriptedAdapter>, Arc<ScriptedAdapter>) {
    let completion = Arc::new(ScriptedAdapter::new(AdapterKind::Completion));
    let chat = Arc::new(ScriptedAdapter::new(AdapterKind::Chat));
    let repo = Arc::new(ScriptedAdapter::new(AdapterKind::Repository));
    let mut set: AdapterSet = BTreeMap::new();
    set.insert(AdapterKind::Completion, completion.clone() as Arc<dyn ActivityAdapter>);
    set.insert(AdapterKind::Chat, chat.clone() as Arc<dyn ActivityAdapter>);
    set.insert(AdapterKind::Repository, repo.clone() as Arc<dyn ActivityAdapter>);
    (set, completion, chat, repo)
}

fn dispatcher_with(cfg: AppConfig, set: AdapterSet) -> Arc<Dispatcher> {
    let store: Arc<dyn CheckpointStore> = Arc::new(MemoryStore::new());
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

async fn wait_terminal(handle: &WorkflowHandle) -> WorkflowSnapshot {
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
    handle.query()
}

/// 聊天适配器：挂起直到测试放行，用于制造稳定的等待窗口
struct GatedChat {
    release: tokio::sync::Notify,
    keys: Mutex<Vec<String>>,
}

impl GatedChat {
    fn new() -> Self {
        Self {
            release: tokio::sync::Notify::new(),
            keys: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl ActivityAdapter for GatedChat {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Chat
    }

    async fn invoke(&self, _request: &AdapterRequest, dedup_key: &str) -> Result<String, AdapterError> {
        self.keys.lock().unwrap().push(dedup_key.to_string());
        self.release.notified().await;
        Ok("posted".to_string())
    }
}

fn gated_dispatcher(completion_script: Vec<Result<String, AdapterError>>) -> (Arc<Dispatcher>, Arc<GatedChat>) {
    let completion = Arc::new(ScriptedAdapter::with_script(AdapterKind::Completion, completion_script));
    let chat = Arc::new(GatedChat::new());
    let mut set: AdapterSet = BTreeMap::new();
    set.insert(AdapterKind::Completion, completion as Arc<dyn ActivityAdapter>);
    set.insert(AdapterKind::Chat, chat.clone() as Arc<dyn ActivityAdapter>);
    let cfg = test_config(&[("assistant", "helper")], None);
    (dispatcher_with(cfg, set), chat)
}

#[tokio::test]
async fn scripted_single_agent_runs_to_completion() {
    let (set, completion, _, _) = scripted_set();
    let dispatcher = dispatcher_with(test_config(&[("assistant", "helper")], None), set);

    let wf = dispatcher.dispatch(event("chan-1", "finish up")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();
    let snapshot = wait_terminal(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.done_count, 1);
    assert_eq!(snapshot.agents[0].status, AgentStatus::Terminated);
    // 脚本为空时默认应答即 done：恰好一次补全调用
    assert_eq!(completion.call_count(), 1);
}

#[tokio::test]
async fn two_agents_complete_with_full_quorum() {
    let (set, _, _, _) = scripted_set();
    let cfg = test_config(&[("analyst", "analyzes"), ("reviewer", "reviews")], None);
    let dispatcher = dispatcher_with(cfg, set);

    let wf = dispatcher.dispatch(event("chan-2", "agree on a verdict")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();
    let snapshot = wait_terminal(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(snapshot.done_count, 2);
    assert!(snapshot.agents.iter().all(|a| a.status == AgentStatus::Terminated));
}

#[tokio::test]
async fn transient_failures_retry_inside_runner_then_complete() {
    let (set, completion, _, _) = scripted_set();
    completion.push(Err(AdapterError::Transient("rate limited".into())));
    completion.push(Err(AdapterError::Transient("timeout".into())));
    completion.push(Ok(DONE_DIRECTIVE.to_string()));
    let dispatcher = dispatcher_with(test_config(&[("assistant", "helper")], None), set);

    let wf = dispatcher.dispatch(event("chan-3", "be persistent")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();
    let snapshot = wait_terminal(&handle).await;

    // 重试封装在执行器内：工作流只见最终成功，日志里没有中间失败
    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    assert_eq!(completion.call_count(), 3);
    assert_eq!(snapshot.applied_seq, 2);
}

#[tokio::test]
async fn chat_directive_round_trips_through_adapter() {
    let (set, completion, chat, _) = scripted_set();
    completion.push(Ok(CHAT_DIRECTIVE.to_string()));
    completion.push(Ok(DONE_DIRECTIVE.to_string()));
    let dispatcher = dispatcher_with(test_config(&[("assistant", "helper")], None), set);

    let wf = dispatcher.dispatch(event("chan-4", "greet the channel")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();
    let snapshot = wait_terminal(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Completed);
    let calls = chat.calls();
    assert_eq!(calls.len(), 1);
    // dedup_key 派生自 (工作流, Agent, Turn 序号)
    assert_eq!(calls[0].1, format!("{}:assistant:2", wf));

    let turns = dispatcher.turns_since(&wf, "assistant", 0).unwrap();
    assert_eq!(turns[0].actor, TurnActor::External);
    assert_eq!(turns[0].content, "greet the channel");
    assert!(turns.iter().any(|t| t.actor == TurnActor::Observation && t.content == "ok"));
}

#[tokio::test]
async fn permanent_completion_failure_fails_the_workflow() {
    let (set, completion, _, _) = scripted_set();
    completion.push(Err(AdapterError::Permanent("invalid api key".into())));
    let dispatcher = dispatcher_with(test_config(&[("assistant", "helper")], None), set);

    let wf = dispatcher.dispatch(event("chan-5", "doomed")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();
    let snapshot = wait_terminal(&handle).await;

    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.agents[0].status, AgentStatus::Failed);
    assert!(snapshot.agents[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("invalid api key"));
    // 永久失败不重试
    assert_eq!(completion.call_count(), 1);
}

#[tokio::test]
async fn duplicate_event_id_does_not_enter_journal_twice() {
    let (set, _, _, _) = scripted_set();
    let dispatcher = dispatcher_with(test_config(&[("assistant", "helper")], None), set);

    let mut first = event("chan-6", "finish up");
    first.event_id = Some("evt-1".to_string());
    let wf = dispatcher.dispatch(first.clone()).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();
    let snapshot = wait_terminal(&handle).await;
    assert_eq!(snapshot.applied_seq, 2);

    // 平台重投同一事件：返回同一工作流，不追加信号
    let again = dispatcher.dispatch(first).await.unwrap();
    assert_eq!(again, wf);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.query(&wf).await.unwrap().applied_seq, 2);
}

#[tokio::test]
async fn terminal_session_starts_a_fresh_workflow() {
    let (set, _, _, _) = scripted_set();
    let dispatcher = dispatcher_with(test_config(&[("assistant", "helper")], None), set);

    let wf1 = dispatcher.dispatch(event("chan-7", "first")).await.unwrap();
    let handle = dispatcher.handle(&wf1).await.unwrap();
    wait_terminal(&handle).await;

    let wf2 = dispatcher.dispatch(event("chan-7", "second")).await.unwrap();
    assert_ne!(wf1, wf2);
    let handle2 = dispatcher.handle(&wf2).await.unwrap();
    assert_eq!(wait_terminal(&handle2).await.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn prompt_returns_the_agents_next_output() {
    let (dispatcher, chat) = gated_dispatcher(vec![
        Ok(CHAT_DIRECTIVE.to_string()),
        Ok(DONE_DIRECTIVE.to_string()),
    ]);

    let wf = dispatcher.dispatch(event("chan-8", "work on it")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();

    // 等 Agent 挂在聊天调用上（补全输出已落为第 2 条 Turn）
    let mut rx = handle.watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let snap = rx.borrow_and_update();
                if snap.agents.first().map(|a| a.turn_count) == Some(2) {
                    break;
                }
            }
            rx.changed().await.expect("engine dropped");
        }
    })
    .await
    .expect("agent never reached the chat call");

    let prompt = {
        let dispatcher = dispatcher.clone();
        let wf = wf.clone();
        tokio::spawn(async move {
            dispatcher
                .prompt(&wf, "assistant", "status?", Duration::from_secs(5))
                .await
        })
    };

    // 等提问入日志后放行聊天调用
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let turns = dispatcher.turns_since(&wf, "assistant", 0).unwrap();
            if turns.iter().any(|t| t.content == "status?") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("prompt never journaled");
    chat.release.notify_one();

    let answer = prompt.await.unwrap().unwrap();
    assert_eq!(answer, DONE_DIRECTIVE);
    assert_eq!(wait_terminal(&handle).await.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn prompt_times_out_when_agent_stays_busy() {
    let (dispatcher, chat) = gated_dispatcher(vec![Ok(CHAT_DIRECTIVE.to_string())]);

    let wf = dispatcher.dispatch(event("chan-9", "work on it")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while chat.keys.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("chat call never issued");

    let err = dispatcher
        .prompt(&wf, "assistant", "status?", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PromptTimeout(_)));
}

#[tokio::test]
async fn cancel_terminates_agents_and_discards_late_results() {
    let (dispatcher, chat) = gated_dispatcher(vec![Ok(CHAT_DIRECTIVE.to_string())]);

    let wf = dispatcher.dispatch(event("chan-10", "work on it")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();

    // 等聊天调用真正挂起再取消
    tokio::time::timeout(Duration::from_secs(5), async {
        while chat.keys.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("chat call never issued");

    dispatcher.cancel(&wf, "operator stop").await.unwrap();
    let snapshot = wait_terminal(&handle).await;
    assert_eq!(snapshot.status, WorkflowStatus::Cancelled);
    let applied = snapshot.applied_seq;

    let turns = dispatcher.turns_since(&wf, "assistant", 0).unwrap();
    assert!(turns
        .iter()
        .any(|t| t.actor == TurnActor::Control && t.content == "operator stop"));

    // 取消后放行：迟到结果不得改动已终局的状态
    chat.release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = dispatcher.query(&wf).await.unwrap();
    assert_eq!(after.status, WorkflowStatus::Cancelled);
    assert_eq!(after.applied_seq, applied);
}

#[tokio::test]
async fn concurrent_first_events_share_one_session() {
    /// 永不应答的补全适配器：实例保持 Running，暴露会话建立窗口
    struct StuckCompletion;

    #[async_trait::async_trait]
    impl ActivityAdapter for StuckCompletion {
        fn kind(&self) -> AdapterKind {
            AdapterKind::Completion
        }

        async fn invoke(&self, _request: &AdapterRequest, _key: &str) -> Result<String, AdapterError> {
            std::future::pending().await
        }
    }

    let mut set: AdapterSet = BTreeMap::new();
    set.insert(AdapterKind::Completion, Arc::new(StuckCompletion) as Arc<dyn ActivityAdapter>);
    let dispatcher = dispatcher_with(test_config(&[("assistant", "helper")], None), set);

    // 同一会话键的两条首事件并发到达：必须落到同一个工作流实例
    let (first, second) = tokio::join!(
        dispatcher.dispatch(event("chan-12", "first")),
        dispatcher.dispatch(event("chan-12", "second")),
    );
    assert_eq!(first.unwrap(), second.unwrap());
}

#[tokio::test]
async fn unknown_workflow_and_agent_are_reported() {
    let (set, _, _, _) = scripted_set();
    let dispatcher = dispatcher_with(test_config(&[("assistant", "helper")], None), set);

    let err = dispatcher.query("no-such-wf").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));

    let wf = dispatcher.dispatch(event("chan-11", "finish up")).await.unwrap();
    let handle = dispatcher.handle(&wf).await.unwrap();
    wait_terminal(&handle).await;
    let err = dispatcher.turns_since(&wf, "stranger", 0).unwrap_err();
    assert!(matches!(err, OrchestratorError::AgentNotFound(_)));
}
