//! 工作流状态与纯转移函数
//!
//! `WorkflowState::apply` 是确定性核心：输入 (当前状态, 日志行, 无状态策略)，
//! 输出新状态与待派发的适配器调用。不读墙钟、不取随机数、容器全部有序——
//! 同一信号序列重放必达同一状态（canonical_json 逐字节一致）。

use serde::{Deserialize, Serialize};

use crate::adapters::{AdapterOutcome, ModelParams};
use crate::agent::{machine, AgentId, AgentPolicy, AgentState, AgentStatus, PendingCall, StepContext};
use crate::coordination::Board;
use crate::error::OrchestratorError;
use crate::store::SignalEnvelope;

/// 工作流实例状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => WorkflowStatus::Running,
            "completed" => WorkflowStatus::Completed,
            "cancelled" => WorkflowStatus::Cancelled,
            _ => WorkflowStatus::Failed,
        }
    }
}

/// 会话规格：Agent 编成与终止策略；随 Start 信号进入日志，重放时无需外部输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub roles: Vec<AgentRole>,
    /// 完成所需的 done 发布数；None 为全体
    pub quorum: Option<usize>,
    pub max_agent_steps: u32,
    /// 实例截止时间（毫秒）
    pub deadline_ms: Option<u64>,
    pub params: ModelParams,
    /// 入站路由用的稳定会话键（恢复时重建 source_id 映射）
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRole {
    pub id: AgentId,
    pub role: String,
}

impl SessionSpec {
    pub fn from_config(cfg: &crate::config::AppConfig) -> Self {
        Self {
            roles: cfg
                .workflow
                .agents
                .iter()
                .map(|a| AgentRole {
                    id: a.id.clone(),
                    role: a.role.clone(),
                })
                .collect(),
            quorum: cfg.workflow.quorum,
            max_agent_steps: cfg.workflow.max_agent_steps,
            deadline_ms: cfg.workflow.deadline_ms,
            params: ModelParams {
                model: cfg.llm.model.clone(),
                temperature: cfg.llm.temperature,
            },
            session_key: None,
        }
    }
}

impl Default for SessionSpec {
    fn default() -> Self {
        Self {
            roles: Vec::new(),
            quorum: None,
            max_agent_steps: 20,
            deadline_ms: None,
            params: ModelParams {
                model: String::new(),
                temperature: 0.0,
            },
            session_key: None,
        }
    }
}

/// 外部事件进入工作流的统一信号形态（日志行的载荷）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// 启动：目标 + 会话规格
    Start { objective: String, spec: SessionSpec },
    /// 入站外部事件（聊天消息、外部触发）
    Inbound {
        event_type: String,
        source_id: String,
        payload: String,
        target: Option<AgentId>,
    },
    /// 适配器最终结果（重试已在 Runner 内完成）
    AdapterResult {
        agent_id: AgentId,
        dedup_key: String,
        outcome: AdapterOutcome,
    },
    TimerFired { timer_id: String },
    Cancel { reason: String },
}

/// 待派发的适配器调用
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub agent_id: AgentId,
    pub call: PendingCall,
}

/// 工作流通知（引擎广播给订阅者）
#[derive(Debug, Clone)]
pub enum WorkflowNote {
    AgentFailed { agent_id: AgentId, error: String },
    AgentTerminated { agent_id: AgentId, reason: String },
    QuorumReached { done: usize },
    Ended { status: WorkflowStatus },
    /// 重放分歧：区别于一切用户可见失败，指示核心或环境缺陷
    Nondeterminism { message: String },
}

/// 一次 apply 的产出
#[derive(Debug, Default)]
pub struct StepReport {
    pub dispatches: Vec<Dispatch>,
    pub notes: Vec<WorkflowNote>,
}

/// 查询面快照（只读，仅反映已落盘状态）
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub applied_seq: u64,
    pub agents: Vec<AgentSnapshot>,
    pub board_len: usize,
    pub done_count: usize,
    pub last_activity_at: i64,
}

#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub status: AgentStatus,
    pub turn_count: usize,
    pub last_seq: u64,
    pub last_error: Option<String>,
}

/// 工作流全量状态：检查点中 state 字段的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub objective: String,
    pub spec: SessionSpec,
    /// 注册顺序即同步推进顺序（同步发布的平局裁决）
    pub agents: Vec<AgentState>,
    pub board: Board,
    pub applied_seq: u64,
    pub last_activity_at: i64,
}

impl WorkflowState {
    /// 空状态：Start 信号到达前没有 Agent
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Running,
            objective: String::new(),
            spec: SessionSpec::default(),
            agents: Vec::new(),
            board: Board::default(),
            applied_seq: 0,
            last_activity_at: 0,
        }
    }

    pub fn agent(&self, id: &str) -> Option<&AgentState> {
        self.agents.iter().find(|a| a.id == id)
    }

    fn agent_index(&self, id: &str) -> Option<usize> {
        self.agents.iter().position(|a| a.id == id)
    }

    /// 纯转移函数：严格按序号逐条应用日志行
    pub fn apply(
        &mut self,
        env: &SignalEnvelope,
        policy: &dyn AgentPolicy,
    ) -> Result<StepReport, OrchestratorError> {
        if env.seq != self.applied_seq + 1 {
            return Err(OrchestratorError::Nondeterminism(format!(
                "Signal seq {} applied after {} in workflow {}",
                env.seq, self.applied_seq, self.workflow_id
            )));
        }
        if self.status.is_terminal() {
            return Err(OrchestratorError::Nondeterminism(format!(
                "Signal {} applied to terminal workflow {}",
                env.seq, self.workflow_id
            )));
        }

        let mut report = StepReport::default();

        match &env.signal {
            Signal::Start { objective, spec } => {
                if !self.agents.is_empty() {
                    tracing::warn!(workflow = %self.workflow_id, "Duplicate start signal ignored");
                } else if spec.roles.is_empty() {
                    // 无 Agent 编成的实例无法取得进展，立即以 Failed 收场
                    tracing::warn!(workflow = %self.workflow_id, "Start signal carries no agent roles, failing instance");
                    self.status = WorkflowStatus::Failed;
                    report.notes.push(WorkflowNote::Ended {
                        status: WorkflowStatus::Failed,
                    });
                } else {
                    self.objective = objective.clone();
                    self.spec = spec.clone();
                    for role in &spec.roles {
                        self.agents.push(AgentState::new(&role.id, &role.role, objective));
                    }
                    // 注册顺序推进：同一步内的板发布由此获得可重放的全序
                    let objective = objective.clone();
                    for i in 0..self.agents.len() {
                        self.advance_with_input(i, &objective, env, &mut report);
                    }
                }
            }
            Signal::Inbound { payload, target, .. } => {
                let idx = match target {
                    Some(t) => self.agent_index(t),
                    None => (!self.agents.is_empty()).then_some(0),
                };
                match idx {
                    Some(i) => {
                        let payload = payload.clone();
                        self.advance_with_input(i, &payload, env, &mut report);
                    }
                    None => {
                        tracing::warn!(workflow = %self.workflow_id, ?target, "Inbound event has no routable agent");
                    }
                }
            }
            Signal::AdapterResult { agent_id, dedup_key, outcome } => {
                let Some(i) = self.agent_index(agent_id) else {
                    return Err(OrchestratorError::Nondeterminism(format!(
                        "Adapter result for unknown agent {}",
                        agent_id
                    )));
                };
                self.advance_with_outcome(i, dedup_key, outcome, policy, env, &mut report)?;
            }
            Signal::TimerFired { timer_id } => {
                if timer_id == "deadline" {
                    self.cancel_all("deadline exceeded", env, &mut report);
                } else {
                    tracing::debug!(workflow = %self.workflow_id, %timer_id, "Unknown timer ignored");
                }
            }
            Signal::Cancel { reason } => {
                self.cancel_all(reason, env, &mut report);
            }
        }

        self.check_completion(env, &mut report);

        self.applied_seq = env.seq;
        self.last_activity_at = env.received_at;
        Ok(report)
    }

    /// 推进单个 Agent 一步（外部输入）
    fn advance_with_input(&mut self, i: usize, text: &str, env: &SignalEnvelope, report: &mut StepReport) {
        let agent_id = self.agents[i].id.clone();
        let observations = self.board.peek(&agent_id);
        let ctx = StepContext {
            workflow_id: &self.workflow_id,
            params: &self.spec.params,
            max_agent_steps: self.spec.max_agent_steps,
            observations,
        };
        let prev = self.agents[i].status;
        let step = machine::handle_input(&mut self.agents[i], text, env.received_at, &ctx);
        self.absorb(i, prev, step, env, report);
    }

    /// 推进单个 Agent 一步（适配器结果）
    fn advance_with_outcome(
        &mut self,
        i: usize,
        dedup_key: &str,
        outcome: &AdapterOutcome,
        policy: &dyn AgentPolicy,
        env: &SignalEnvelope,
        report: &mut StepReport,
    ) -> Result<(), OrchestratorError> {
        let agent_id = self.agents[i].id.clone();
        let observations = self.board.peek(&agent_id);
        let ctx = StepContext {
            workflow_id: &self.workflow_id,
            params: &self.spec.params,
            max_agent_steps: self.spec.max_agent_steps,
            observations,
        };
        let prev = self.agents[i].status;
        let step = machine::handle_outcome(&mut self.agents[i], dedup_key, outcome, policy, env.received_at, &ctx)?;
        self.absorb(i, prev, step, env, report);
        Ok(())
    }

    /// 吸收一步的产出：发布入板、调用入派发队列、状态变化入通知
    fn absorb(
        &mut self,
        i: usize,
        prev: AgentStatus,
        step: crate::agent::StepOutcome,
        env: &SignalEnvelope,
        report: &mut StepReport,
    ) {
        let agent_id = self.agents[i].id.clone();
        for p in step.publications {
            self.board.publish(&agent_id, None, &p.topic, &p.body, env.seq);
        }
        // 只有事件确实折入了发出的补全请求才推进游标；否则留到下一次补全
        if step.observed {
            self.board.ack(&agent_id);
        }
        if let Some(call) = step.dispatch {
            report.dispatches.push(Dispatch {
                agent_id: agent_id.clone(),
                call,
            });
        }

        let agent = &self.agents[i];
        if prev != agent.status {
            match agent.status {
                AgentStatus::Failed => report.notes.push(WorkflowNote::AgentFailed {
                    agent_id,
                    error: agent.last_error.clone().unwrap_or_default(),
                }),
                AgentStatus::Terminated => report.notes.push(WorkflowNote::AgentTerminated {
                    agent_id,
                    reason: agent
                        .terminal_reason
                        .clone()
                        .unwrap_or_else(|| "objective satisfied".to_string()),
                }),
                _ => {}
            }
        }
    }

    fn cancel_all(&mut self, reason: &str, env: &SignalEnvelope, report: &mut StepReport) {
        for agent in &mut self.agents {
            if !agent.status.is_terminal() {
                machine::cancel(agent, reason, env.received_at);
                report.notes.push(WorkflowNote::AgentTerminated {
                    agent_id: agent.id.clone(),
                    reason: reason.to_string(),
                });
            }
        }
        self.status = WorkflowStatus::Cancelled;
        report.notes.push(WorkflowNote::Ended {
            status: WorkflowStatus::Cancelled,
        });
    }

    /// 法定人数与终局判定
    ///
    /// 完成恰好触发一次（板上闩锁）；法定人数未达而全体 Agent 已终态时
    /// 实例以 Failed 收场（兄弟 Agent 的失败不传染，但会使法定人数不可达）。
    fn check_completion(&mut self, env: &SignalEnvelope, report: &mut StepReport) {
        if self.status != WorkflowStatus::Running || self.agents.is_empty() {
            return;
        }
        let required = self.spec.quorum.unwrap_or(self.agents.len()).max(1);

        if self.board.quorum_met(required) {
            if self.board.latch_completion() {
                report.notes.push(WorkflowNote::QuorumReached {
                    done: self.board.done_count(),
                });
                for agent in &mut self.agents {
                    if !agent.status.is_terminal() {
                        machine::cancel(agent, "quorum reached", env.received_at);
                        report.notes.push(WorkflowNote::AgentTerminated {
                            agent_id: agent.id.clone(),
                            reason: "quorum reached".to_string(),
                        });
                    }
                }
                self.status = WorkflowStatus::Completed;
                report.notes.push(WorkflowNote::Ended {
                    status: WorkflowStatus::Completed,
                });
            }
        } else if self.agents.iter().all(|a| a.status.is_terminal()) {
            self.status = WorkflowStatus::Failed;
            report.notes.push(WorkflowNote::Ended {
                status: WorkflowStatus::Failed,
            });
        }
    }

    /// 恢复时需要重新派发的未决调用（注册顺序）
    pub fn unresolved_calls(&self) -> Vec<Dispatch> {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::AwaitingExternal)
            .filter_map(|a| {
                a.pending.as_ref().map(|call| Dispatch {
                    agent_id: a.id.clone(),
                    call: call.clone(),
                })
            })
            .collect()
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            applied_seq: self.applied_seq,
            agents: self
                .agents
                .iter()
                .map(|a| AgentSnapshot {
                    id: a.id.clone(),
                    status: a.status,
                    turn_count: a.turns.len(),
                    last_seq: a.last_seq(),
                    last_error: a.last_error.clone(),
                })
                .collect(),
            board_len: self.board.len(),
            done_count: self.board.done_count(),
            last_activity_at: self.last_activity_at,
        }
    }

    /// 规范化序列化镜像：重放等价性按此逐字节比较
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
