//! 入站事件分发与查询面
//!
//! 外部事件按稳定会话键（source_id）路由到既有或新建的工作流实例；
//! 边界上按 event_id 去重（消息平台重试时不重复入列），事件一律翻译成
//! 对具体实例的 signal() 调用，绝不直接改 Agent 状态。
//! 同时承载运维面：查询快照、增量 Turn 拉取、同步问答、启动恢复与关停。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::adapters::ActivityRunner;
use crate::agent::{AgentId, AgentPolicy, Turn, TurnActor};
use crate::config::AppConfig;
use crate::error::OrchestratorError;
use crate::store::CheckpointStore;
use crate::workflow::{
    SessionSpec, Signal, WorkflowEngine, WorkflowHandle, WorkflowSnapshot, WorkflowState,
};

/// 边界去重缓存容量
const SEEN_EVENTS_CAP: usize = 10_000;

/// 入站外部事件（聊天提及、定时触发等）
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub event_type: String,
    /// 稳定会话/线程标识，路由键
    pub source_id: String,
    pub payload: String,
    pub received_at: i64,
    /// 平台事件 id，用于边界去重
    pub event_id: Option<String>,
    /// 指定目标 Agent；None 路由到首个注册的 Agent
    pub target_agent: Option<AgentId>,
}

/// 已见事件 id 的有界集合
struct SeenEvents {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenEvents {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// 首见返回 true
    fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > SEEN_EVENTS_CAP {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

/// 分发器：进程内所有工作流实例的入口与注册表
///
/// 注册表按实例隔离——实例间不共享任何可变状态，存储的每一行也只由
/// 其所属实例写入。
pub struct Dispatcher {
    cfg: AppConfig,
    store: Arc<dyn CheckpointStore>,
    runner: Arc<ActivityRunner>,
    policy: Arc<dyn AgentPolicy>,
    /// source_id -> workflow_id
    sessions: RwLock<HashMap<String, String>>,
    handles: RwLock<HashMap<String, WorkflowHandle>>,
    seen_events: Mutex<SeenEvents>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        cfg: AppConfig,
        store: Arc<dyn CheckpointStore>,
        runner: Arc<ActivityRunner>,
        policy: Arc<dyn AgentPolicy>,
    ) -> Self {
        Self {
            cfg,
            store,
            runner,
            policy,
            sessions: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            seen_events: Mutex::new(SeenEvents::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// 路由一个入站事件；返回承接它的工作流 id
    ///
    /// 新会话：事件载荷即初始目标，Start 信号携带完整会话规格入日志。
    pub async fn dispatch(&self, event: InboundEvent) -> Result<String, OrchestratorError> {
        if let Some(event_id) = &event.event_id {
            if !self.seen_events.lock().unwrap().insert(event_id) {
                tracing::debug!(%event_id, "Duplicate inbound event ignored");
                let sessions = self.sessions.read().await;
                return sessions
                    .get(&event.source_id)
                    .cloned()
                    .ok_or_else(|| OrchestratorError::Rejected(format!("duplicate event {}", event_id)));
            }
        }

        // 会话表写锁贯穿「查找或新建」：同 source_id 的并发首事件只落到一个实例
        let mut sessions = self.sessions.write().await;

        // 既有会话且实例仍在运行：转为 Inbound 信号
        if let Some(workflow_id) = sessions.get(&event.source_id).cloned() {
            let handle = self.handles.read().await.get(&workflow_id).cloned();
            if let Some(handle) = handle {
                if !handle.query().status.is_terminal() {
                    handle.signal(Signal::Inbound {
                        event_type: event.event_type,
                        source_id: event.source_id,
                        payload: event.payload,
                        target: event.target_agent,
                    })?;
                    return Ok(workflow_id);
                }
            }
        }

        // 新会话
        let workflow_id = uuid::Uuid::new_v4().to_string();
        let mut spec = SessionSpec::from_config(&self.cfg);
        spec.session_key = Some(event.source_id.clone());

        let handle = WorkflowEngine::spawn(
            &workflow_id,
            self.store.clone(),
            self.runner.clone(),
            self.policy.clone(),
            self.shutdown.child_token(),
        )?;
        handle.signal(Signal::Start {
            objective: event.payload,
            spec,
        })?;

        tracing::info!(workflow = %workflow_id, source = %event.source_id, "Started workflow session");
        sessions.insert(event.source_id, workflow_id.clone());
        self.handles
            .write()
            .await
            .insert(workflow_id.clone(), handle);
        Ok(workflow_id)
    }

    /// 实例句柄（测试与上层组合用）
    pub async fn handle(&self, workflow_id: &str) -> Option<WorkflowHandle> {
        self.handles.read().await.get(workflow_id).cloned()
    }

    /// 只读查询：活实例走内存快照，否则读落盘检查点
    pub async fn query(&self, workflow_id: &str) -> Result<WorkflowSnapshot, OrchestratorError> {
        if let Some(handle) = self.handles.read().await.get(workflow_id) {
            return Ok(handle.query());
        }
        let state = self.load_state(workflow_id)?;
        Ok(state.snapshot())
    }

    /// 增量 Turn 拉取：返回 seq > watermark 的 Turn（读已落盘检查点）
    pub fn turns_since(
        &self,
        workflow_id: &str,
        agent_id: &str,
        watermark: u64,
    ) -> Result<Vec<Turn>, OrchestratorError> {
        let state = self.load_state(workflow_id)?;
        let agent = state
            .agent(agent_id)
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;
        Ok(agent
            .turns
            .iter()
            .filter(|t| t.seq > watermark)
            .cloned()
            .collect())
    }

    /// 同步问答：向指定 Agent 注入一条输入，等它的下一条补全输出
    pub async fn prompt(
        &self,
        workflow_id: &str,
        agent_id: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<String, OrchestratorError> {
        let handle = self
            .handles
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(workflow_id.to_string()))?;

        let snapshot = handle.query();
        let watermark = snapshot
            .agents
            .iter()
            .find(|a| a.id == agent_id)
            .map(|a| a.last_seq)
            .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;

        handle.signal(Signal::Inbound {
            event_type: "prompt".to_string(),
            source_id: workflow_id.to_string(),
            payload: text.to_string(),
            target: Some(agent_id.to_string()),
        })?;

        let mut watch = handle.watch();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let turns = self.turns_since(workflow_id, agent_id, watermark)?;
            if let Some(turn) = turns.iter().find(|t| t.actor == TurnActor::Agent) {
                return Ok(turn.content.clone());
            }
            if watch.borrow().status.is_terminal() {
                return Err(OrchestratorError::Ended(workflow_id.to_string()));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(OrchestratorError::PromptTimeout(timeout));
            }
            if tokio::time::timeout(remaining, watch.changed()).await.is_err() {
                return Err(OrchestratorError::PromptTimeout(timeout));
            }
        }
    }

    /// 取消一个实例（任意挂起点生效）
    pub async fn cancel(&self, workflow_id: &str, reason: &str) -> Result<(), OrchestratorError> {
        let handle = self
            .handles
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(workflow_id.to_string()))?;
        handle.signal(Signal::Cancel {
            reason: reason.to_string(),
        })
    }

    /// 启动恢复：把存储里所有未到终态的实例重新拉起
    pub async fn resume_all(&self) -> Result<usize, OrchestratorError> {
        let ids = self.store.list_unfinished()?;
        let mut resumed = 0;
        for workflow_id in ids {
            if self.handles.read().await.contains_key(&workflow_id) {
                continue;
            }
            match WorkflowEngine::resume(
                &workflow_id,
                self.store.clone(),
                self.runner.clone(),
                self.policy.clone(),
                self.shutdown.child_token(),
            ) {
                Ok(handle) => {
                    // 会话键从检查点里的规格恢复，入站路由继续生效
                    if let Ok(state) = self.load_state(&workflow_id) {
                        if let Some(key) = state.spec.session_key.clone() {
                            self.sessions.write().await.insert(key, workflow_id.clone());
                        }
                    }
                    self.handles.write().await.insert(workflow_id, handle);
                    resumed += 1;
                }
                Err(e) => {
                    tracing::error!(workflow = %workflow_id, error = %e, "Resume failed");
                }
            }
        }
        if resumed > 0 {
            tracing::info!(resumed, "Resumed unfinished workflows");
        }
        Ok(resumed)
    }

    /// 关停：停止所有引擎的消费；实例不被取消，保持可恢复
    pub fn shutdown(&self) {
        tracing::info!("Dispatcher shutting down");
        self.shutdown.cancel();
    }

    fn load_state(&self, workflow_id: &str) -> Result<WorkflowState, OrchestratorError> {
        let checkpoint = self
            .store
            .load_checkpoint(workflow_id)?
            .ok_or_else(|| OrchestratorError::NotFound(workflow_id.to_string()))?;
        WorkflowState::from_json(&checkpoint.state_json)
            .map_err(|e| OrchestratorError::Nondeterminism(format!("Corrupt checkpoint: {}", e)))
    }
}
