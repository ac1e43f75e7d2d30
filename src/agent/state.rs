//! Agent 持久状态：Turn 历史、PendingCall、状态枚举
//!
//! 全部可序列化——它们随 WorkflowCheckpoint 落盘，是重启后的唯一事实来源。

use serde::{Deserialize, Serialize};

use crate::adapters::{AdapterKind, AdapterRequest};

pub type AgentId = String;

/// Agent 生命周期状态；Terminated / Failed 为终态，不再接受 Turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Idle,
    Acting,
    AwaitingExternal,
    Terminated,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Terminated | AgentStatus::Failed)
    }
}

/// Turn 的行动者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnActor {
    /// 外部输入（入站事件、初始目标）
    External,
    /// Agent 自身的补全输出
    Agent,
    /// 适配器观察结果（聊天/仓库调用的返回）
    Observation,
    /// 控制信息（取消原因等）
    Control,
}

/// 原子进度单元：一条输入或一次行动，写入后不可变
///
/// 不变量：同一 Agent 内 seq 严格递增且无间隙，由所属工作流赋值；
/// recorded_at 来自日志化信号的接收时间，核心内部不读墙钟。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub seq: u64,
    pub actor: TurnActor,
    pub content: String,
    pub recorded_at: i64,
    pub parent_seq: Option<u64>,
}

/// 在途适配器调用记录
///
/// 不变量：每个 Agent 至多一个未决 PendingCall；请求体保留原样，
/// 崩溃恢复时用同一 dedup_key 重新派发，不产生重复副作用。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCall {
    pub kind: AdapterKind,
    pub dedup_key: String,
    pub issued_seq: u64,
    pub request: AdapterRequest,
}

/// 单 Agent 的全部持久状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    /// 角色描述，生命周期内不变
    pub role: String,
    /// 目标，生命周期内不变
    pub objective: String,
    pub status: AgentStatus,
    pub turns: Vec<Turn>,
    pub pending: Option<PendingCall>,
    /// 下一个 Turn 的序号
    pub next_seq: u64,
    /// 已发起的补全次数（步数预算）
    pub completions_issued: u32,
    /// 连续无法解析为指令的补全次数（纠正性重试用）
    pub consecutive_malformed: u32,
    /// 终态摘要（Terminated 且目标达成时）
    pub summary: Option<String>,
    /// 终态原因（取消 / 预算耗尽 / 法定人数已达）
    pub terminal_reason: Option<String>,
    /// 最后一次错误（Failed 时）
    pub last_error: Option<String>,
}

impl AgentState {
    pub fn new(id: impl Into<AgentId>, role: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            objective: objective.into(),
            status: AgentStatus::Idle,
            turns: Vec::new(),
            pending: None,
            next_seq: 1,
            completions_issued: 0,
            consecutive_malformed: 0,
            summary: None,
            terminal_reason: None,
            last_error: None,
        }
    }

    /// 追加一条 Turn，返回其序号；终态下调用是编程错误，由调用方先行检查
    pub fn append_turn(&mut self, actor: TurnActor, content: impl Into<String>, recorded_at: i64) -> u64 {
        let seq = self.next_seq;
        let parent_seq = self.turns.last().map(|t| t.seq);
        self.turns.push(Turn {
            seq,
            actor,
            content: content.into(),
            recorded_at,
            parent_seq,
        });
        self.next_seq += 1;
        seq
    }

    pub fn last_seq(&self) -> u64 {
        self.turns.last().map(|t| t.seq).unwrap_or(0)
    }
}
