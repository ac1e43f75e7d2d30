//! Agent 状态转移
//!
//! 每次转移处理一条路由到本 Agent 的信号：至多追加一条 Turn、至多发出一个
//! PendingCall（1:1 约束——重放时可从 Turn 历史重推导，不重复发副作用）。
//! 协调板发布属于内部状态，不计入该约束。

use crate::adapters::{AdapterKind, AdapterOutcome, AdapterRequest, ModelParams};
use crate::agent::policy::{AgentPolicy, Directive};
use crate::agent::state::{AgentState, AgentStatus, PendingCall, TurnActor};
use crate::coordination::CoordinationEvent;
use crate::error::OrchestratorError;

/// 指令格式说明，拼入每次补全请求的 system
const DIRECTIVE_GUIDE: &str = "Respond with exactly one single-line JSON directive:\n\
{\"action\":\"chat\",\"channel\":\"...\",\"thread_id\":\"...\",\"text\":\"...\"} to post a chat reply;\n\
{\"action\":\"repo\",\"repo\":\"owner/name\",\"operation\":\"...\",\"payload\":{...}} to operate on the repository;\n\
{\"action\":\"note\",\"topic\":\"...\",\"body\":\"...\"} to share a note with the other agents;\n\
{\"action\":\"done\",\"summary\":\"...\"} when your objective is satisfied.";

/// 一次转移的环境：来自工作流状态，只读
pub struct StepContext<'a> {
    pub workflow_id: &'a str,
    pub params: &'a ModelParams,
    pub max_agent_steps: u32,
    /// 本步开始时该 Agent 未读的协调事件；只有折入补全请求后
    /// （StepOutcome::observed）板游标才推进
    pub observations: Vec<CoordinationEvent>,
}

/// 广播到协调板的发布请求（序号由板分配）
#[derive(Debug, Clone)]
pub struct Publication {
    pub topic: String,
    pub body: String,
}

/// 一次转移的产出
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub publications: Vec<Publication>,
    pub dispatch: Option<PendingCall>,
    /// ctx.observations 是否已折入本步发出的补全请求；false 时事件保持未读
    pub observed: bool,
}

/// 外部输入（初始目标、入站消息）路由到 Agent
///
/// Idle 时追加输入并发起补全；AwaitingExternal 时仅入历史（未决调用
/// 至多一个）；终态下丢弃。
pub fn handle_input(
    agent: &mut AgentState,
    text: &str,
    recorded_at: i64,
    ctx: &StepContext<'_>,
) -> StepOutcome {
    if agent.status.is_terminal() {
        tracing::debug!(agent = %agent.id, "Input dropped: agent is terminal");
        return StepOutcome::default();
    }

    agent.append_turn(TurnActor::External, text, recorded_at);

    let mut outcome = StepOutcome::default();
    // 首条 Turn 即入场：向板公告，兄弟 Agent 下一步可见
    if agent.turns.len() == 1 {
        outcome.publications.push(Publication {
            topic: "joined".to_string(),
            body: agent.role.clone(),
        });
    }
    if agent.status == AgentStatus::Idle {
        issue_completion(agent, ctx, false, &mut outcome);
    }
    outcome
}

/// 适配器结果路由到 Agent
///
/// dedup_key 必须与未决调用匹配，否则是重放分歧（取消后的迟到结果
/// 已在日志边界被丢弃，不会走到这里）。
pub fn handle_outcome(
    agent: &mut AgentState,
    dedup_key: &str,
    outcome: &AdapterOutcome,
    policy: &dyn AgentPolicy,
    recorded_at: i64,
    ctx: &StepContext<'_>,
) -> Result<StepOutcome, OrchestratorError> {
    let Some(pending) = agent.pending.take() else {
        return Err(OrchestratorError::Nondeterminism(format!(
            "Adapter result for agent {} without pending call (key {})",
            agent.id, dedup_key
        )));
    };
    if pending.dedup_key != dedup_key {
        return Err(OrchestratorError::Nondeterminism(format!(
            "Adapter result key mismatch for agent {}: expected {}, got {}",
            agent.id, pending.dedup_key, dedup_key
        )));
    }

    agent.status = AgentStatus::Acting;

    match outcome {
        AdapterOutcome::Success { result, .. } => match pending.kind {
            AdapterKind::Completion => Ok(apply_completion(agent, result, policy, recorded_at, ctx)),
            AdapterKind::Chat | AdapterKind::Repository => {
                // 副作用已落地：记录观察，继续下一步推理
                agent.append_turn(TurnActor::Observation, result.clone(), recorded_at);
                let mut step = StepOutcome::default();
                issue_completion(agent, ctx, false, &mut step);
                Ok(step)
            }
        },
        AdapterOutcome::Exhausted { error, attempts } => {
            fail(agent, format!(
                "{} call exhausted retry budget after {} attempts: {}",
                pending.kind, attempts, error
            ), recorded_at);
            Ok(StepOutcome::default())
        }
        AdapterOutcome::Permanent { error, .. } => {
            fail(agent, format!("{} call failed permanently: {}", pending.kind, error), recorded_at);
            Ok(StepOutcome::default())
        }
    }
}

/// 取消：非终态 Agent 记录原因并进入 Terminated；未决调用作废
pub fn cancel(agent: &mut AgentState, reason: &str, recorded_at: i64) {
    if agent.status.is_terminal() {
        return;
    }
    agent.append_turn(TurnActor::Control, reason, recorded_at);
    agent.pending = None;
    agent.status = AgentStatus::Terminated;
    agent.terminal_reason = Some(reason.to_string());
}

/// 补全输出落为 Agent Turn，并按指令决定下一步
fn apply_completion(
    agent: &mut AgentState,
    result: &str,
    policy: &dyn AgentPolicy,
    recorded_at: i64,
    ctx: &StepContext<'_>,
) -> StepOutcome {
    agent.append_turn(TurnActor::Agent, result.clone(), recorded_at);

    let mut step = StepOutcome::default();
    match policy.interpret(result) {
        Directive::Chat { channel, thread_id, text } => {
            agent.consecutive_malformed = 0;
            step.dispatch = emit_call(
                agent,
                ctx,
                AdapterRequest::Chat { channel, thread_id, text },
            );
        }
        Directive::Repo { repo, operation, payload } => {
            agent.consecutive_malformed = 0;
            step.dispatch = emit_call(
                agent,
                ctx,
                AdapterRequest::Repository { repo, operation, payload },
            );
        }
        Directive::Note { topic, body } => {
            agent.consecutive_malformed = 0;
            step.publications.push(Publication { topic, body });
            issue_completion(agent, ctx, false, &mut step);
        }
        Directive::Done { summary } => {
            agent.consecutive_malformed = 0;
            finish(agent, summary, &mut step);
        }
        Directive::Malformed { error } => {
            agent.consecutive_malformed += 1;
            if agent.consecutive_malformed <= 1 {
                // 一次纠正机会：重新请求补全并附格式提醒
                tracing::debug!(agent = %agent.id, %error, "Malformed directive, issuing corrective completion");
                issue_completion(agent, ctx, true, &mut step);
            } else {
                // 连续两次失败：按最终答案收尾
                finish(agent, result.trim().to_string(), &mut step);
            }
        }
    }
    step
}

fn finish(agent: &mut AgentState, summary: String, step: &mut StepOutcome) {
    step.publications.push(Publication {
        topic: "done".to_string(),
        body: summary.clone(),
    });
    agent.summary = Some(summary);
    agent.status = AgentStatus::Terminated;
}

fn fail(agent: &mut AgentState, error: String, recorded_at: i64) {
    agent.append_turn(TurnActor::Control, error.clone(), recorded_at);
    agent.status = AgentStatus::Failed;
    agent.last_error = Some(error);
}

/// 发起一次补全调用；步数预算耗尽时直接终止（不发布 done）
///
/// 请求确实发出时，ctx.observations 折入 history 并标记 step.observed；
/// 预算终止路径不消费事件。
fn issue_completion(
    agent: &mut AgentState,
    ctx: &StepContext<'_>,
    corrective: bool,
    step: &mut StepOutcome,
) {
    if agent.completions_issued >= ctx.max_agent_steps {
        tracing::warn!(agent = %agent.id, budget = ctx.max_agent_steps, "Step budget exhausted, terminating agent");
        agent.status = AgentStatus::Terminated;
        agent.terminal_reason = Some("step budget exhausted".to_string());
        return;
    }
    agent.completions_issued += 1;

    let mut system = format!(
        "You are agent '{}' ({}).\nObjective: {}\n{}",
        agent.id, agent.role, agent.objective, DIRECTIVE_GUIDE
    );
    if corrective {
        system.push_str("\nYour previous output was not a valid directive. Reply with exactly one JSON directive.");
    }

    let mut history: Vec<(String, String)> = agent
        .turns
        .iter()
        .map(|t| (actor_label(t.actor).to_string(), t.content.clone()))
        .collect();
    for ev in &ctx.observations {
        history.push((
            "coordination".to_string(),
            format!("from={} topic={}: {}", ev.from, ev.topic, ev.body),
        ));
    }

    step.observed = true;
    step.dispatch = emit_call(
        agent,
        ctx,
        AdapterRequest::Completion {
            system,
            history,
            params: ctx.params.clone(),
        },
    );
}

/// 挂起一个适配器调用并进入 AwaitingExternal
///
/// dedup_key 确定性地派生自 (工作流, Agent, 当前末 Turn 序号)——每次转移
/// 先追加 Turn 再发调用，key 在实例内唯一且重放时逐字节一致。
fn emit_call(
    agent: &mut AgentState,
    ctx: &StepContext<'_>,
    request: AdapterRequest,
) -> Option<PendingCall> {
    let issued_seq = agent.last_seq();
    let call = PendingCall {
        kind: request.kind(),
        dedup_key: format!("{}:{}:{}", ctx.workflow_id, agent.id, issued_seq),
        issued_seq,
        request,
    };
    agent.pending = Some(call.clone());
    agent.status = AgentStatus::AwaitingExternal;
    Some(call)
}

fn actor_label(actor: TurnActor) -> &'static str {
    match actor {
        TurnActor::External => "external",
        TurnActor::Agent => "agent",
        TurnActor::Observation => "observation",
        TurnActor::Control => "control",
    }
}
