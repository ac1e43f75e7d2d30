//! 编排工作流引擎
//!
//! 每实例一条逻辑控制线：专属 tokio 任务串行消费信号队列，逐条
//! 日志化 -> apply -> 落检查点 -> 发快照 -> 派发副作用。快照严格在
//! 检查点写入之后更新，查询永远只见已落盘状态。
//! 三通道布局：mpsc 信号入、watch 快照出、broadcast 通知出。

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::adapters::ActivityRunner;
use crate::agent::AgentPolicy;
use crate::error::OrchestratorError;
use crate::store::{CheckpointStore, SignalEnvelope, WorkflowCheckpoint};
use crate::workflow::state::{
    Dispatch, Signal, WorkflowNote, WorkflowSnapshot, WorkflowState, WorkflowStatus,
};

/// 通知通道容量（落后的订阅者丢最旧）
const NOTE_CHANNEL_CAP: usize = 64;

/// 运行中实例的句柄；可克隆，随处查询/发信号
#[derive(Clone)]
pub struct WorkflowHandle {
    pub id: String,
    signal_tx: mpsc::UnboundedSender<Signal>,
    snapshot_rx: watch::Receiver<WorkflowSnapshot>,
    notes: broadcast::Sender<WorkflowNote>,
}

impl WorkflowHandle {
    /// 排队一个外部事件；实例已结束时报错
    pub fn signal(&self, signal: Signal) -> Result<(), OrchestratorError> {
        self.signal_tx
            .send(signal)
            .map_err(|_| OrchestratorError::Ended(self.id.clone()))
    }

    /// 只读查询：最近一次已落盘的快照
    pub fn query(&self) -> WorkflowSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// 快照变更流（prompt 等待、测试同步用）
    pub fn watch(&self) -> watch::Receiver<WorkflowSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowNote> {
        self.notes.subscribe()
    }
}

/// 工作流引擎：实例的创建、恢复与重放验证
pub struct WorkflowEngine;

impl WorkflowEngine {
    /// 新实例：空检查点落盘后启动事件循环；调用方随后发 Start 信号
    pub fn spawn(
        workflow_id: &str,
        store: Arc<dyn CheckpointStore>,
        runner: Arc<ActivityRunner>,
        policy: Arc<dyn AgentPolicy>,
        shutdown: CancellationToken,
    ) -> Result<WorkflowHandle, OrchestratorError> {
        let state = WorkflowState::new(workflow_id);
        persist(&*store, &state)?;
        Ok(start_loop(state, store, runner, policy, shutdown))
    }

    /// 恢复实例：检查点 + 日志尾部补算，再重新派发未决调用
    ///
    /// 未决调用沿用原 dedup_key——适配器端去重保证不产生重复副作用。
    pub fn resume(
        workflow_id: &str,
        store: Arc<dyn CheckpointStore>,
        runner: Arc<ActivityRunner>,
        policy: Arc<dyn AgentPolicy>,
        shutdown: CancellationToken,
    ) -> Result<WorkflowHandle, OrchestratorError> {
        let checkpoint = store
            .load_checkpoint(workflow_id)?
            .ok_or_else(|| OrchestratorError::NotFound(workflow_id.to_string()))?;
        let mut state = WorkflowState::from_json(&checkpoint.state_json)
            .map_err(|e| OrchestratorError::Nondeterminism(format!("Corrupt checkpoint: {}", e)))?;

        let tail = store.load_journal(workflow_id, checkpoint.applied_seq)?;
        for envelope in &tail {
            state.apply(envelope, policy.as_ref())?;
        }
        if !tail.is_empty() {
            persist(&*store, &state)?;
        }

        tracing::info!(workflow = %workflow_id, applied_seq = state.applied_seq, "Workflow resumed");
        Ok(start_loop(state, store, runner, policy, shutdown))
    }

    /// 从空检查点折叠全部日志（重放等价性的基准镜像）
    pub fn replay_from_origin(
        store: &dyn CheckpointStore,
        workflow_id: &str,
        policy: &dyn AgentPolicy,
    ) -> Result<WorkflowState, OrchestratorError> {
        let mut state = WorkflowState::new(workflow_id);
        for envelope in store.load_journal(workflow_id, 0)? {
            state.apply(&envelope, policy)?;
        }
        Ok(state)
    }

    /// 重放镜像与落盘检查点逐字节比对；分歧即 Nondeterminism
    pub fn verify_replay(
        store: &dyn CheckpointStore,
        workflow_id: &str,
        policy: &dyn AgentPolicy,
    ) -> Result<(), OrchestratorError> {
        let checkpoint = store
            .load_checkpoint(workflow_id)?
            .ok_or_else(|| OrchestratorError::NotFound(workflow_id.to_string()))?;
        let replayed = Self::replay_from_origin(store, workflow_id, policy)?;

        if replayed.applied_seq != checkpoint.applied_seq {
            return Err(OrchestratorError::Nondeterminism(format!(
                "Replay applied {} signals, checkpoint has {}",
                replayed.applied_seq, checkpoint.applied_seq
            )));
        }
        let replayed_json = replayed
            .canonical_json()
            .map_err(|e| OrchestratorError::Nondeterminism(e.to_string()))?;
        if replayed_json != checkpoint.state_json {
            return Err(OrchestratorError::Nondeterminism(format!(
                "Replay image diverges from checkpoint for workflow {}",
                workflow_id
            )));
        }
        Ok(())
    }
}

fn persist(store: &dyn CheckpointStore, state: &WorkflowState) -> Result<(), OrchestratorError> {
    let checkpoint = WorkflowCheckpoint {
        workflow_id: state.workflow_id.clone(),
        status: state.status,
        applied_seq: state.applied_seq,
        state_json: state
            .canonical_json()
            .map_err(|e| OrchestratorError::Nondeterminism(e.to_string()))?,
        updated_at: state.last_activity_at,
    };
    store.save_checkpoint(&checkpoint)?;
    Ok(())
}

/// 日志边界上的适配器结果过滤
enum ResultGate {
    Accept,
    /// 取消/终止后迟到的完成：丢弃，不入日志、不入状态
    Discard(String),
    /// 与挂起调用不匹配：重放分歧
    Fatal(String),
}

fn gate_signal(state: &WorkflowState, signal: &Signal) -> ResultGate {
    let Signal::AdapterResult { agent_id, dedup_key, .. } = signal else {
        return ResultGate::Accept;
    };
    match state.agent(agent_id) {
        None => ResultGate::Fatal(format!("Adapter result for unknown agent {}", agent_id)),
        Some(agent) if agent.status.is_terminal() => {
            ResultGate::Discard(format!("agent {} already terminal", agent_id))
        }
        Some(agent) => match &agent.pending {
            None => ResultGate::Discard(format!("agent {} has no pending call", agent_id)),
            Some(p) if p.dedup_key == *dedup_key => ResultGate::Accept,
            Some(p) => ResultGate::Fatal(format!(
                "Adapter result key mismatch for agent {}: expected {}, got {}",
                agent_id, p.dedup_key, dedup_key
            )),
        },
    }
}

fn start_loop(
    state: WorkflowState,
    store: Arc<dyn CheckpointStore>,
    runner: Arc<ActivityRunner>,
    policy: Arc<dyn AgentPolicy>,
    shutdown: CancellationToken,
) -> WorkflowHandle {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel::<Signal>();
    let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
    let (notes_tx, _) = broadcast::channel(NOTE_CHANNEL_CAP);

    let handle = WorkflowHandle {
        id: state.workflow_id.clone(),
        signal_tx: signal_tx.clone(),
        snapshot_rx,
        notes: notes_tx.clone(),
    };

    tokio::spawn(run_loop(
        state, store, runner, policy, signal_rx, signal_tx, snapshot_tx, notes_tx, shutdown,
    ));

    handle
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut state: WorkflowState,
    store: Arc<dyn CheckpointStore>,
    runner: Arc<ActivityRunner>,
    policy: Arc<dyn AgentPolicy>,
    mut signal_rx: mpsc::UnboundedReceiver<Signal>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    snapshot_tx: watch::Sender<WorkflowSnapshot>,
    notes_tx: broadcast::Sender<WorkflowNote>,
    shutdown: CancellationToken,
) {
    let workflow_id = state.workflow_id.clone();
    // 本实例在途调用与定时器的取消根；终局时整体取消
    let calls_token = CancellationToken::new();
    let mut deadline_armed = false;

    // 恢复场景：未决调用重新派发（同 key，适配器去重兜底）
    for dispatch in state.unresolved_calls() {
        tracing::info!(workflow = %workflow_id, agent = %dispatch.agent_id, key = %dispatch.call.dedup_key, "Re-dispatching unresolved call");
        spawn_call(&runner, &signal_tx, dispatch, calls_token.child_token());
    }

    loop {
        if !deadline_armed {
            if let Some(deadline_ms) = state.spec.deadline_ms {
                arm_deadline(deadline_ms, &signal_tx, calls_token.child_token());
                deadline_armed = true;
            }
        }

        let signal = tokio::select! {
            // 关停只是停止消费：实例保持可恢复，不写终态
            _ = shutdown.cancelled() => {
                tracing::info!(workflow = %workflow_id, "Engine shut down, instance remains resumable");
                break;
            }
            msg = signal_rx.recv() => match msg {
                Some(signal) => signal,
                None => break,
            },
        };

        match gate_signal(&state, &signal) {
            ResultGate::Accept => {}
            ResultGate::Discard(why) => {
                tracing::debug!(workflow = %workflow_id, %why, "Late adapter result discarded at journal boundary");
                continue;
            }
            ResultGate::Fatal(message) => {
                abort_instance(&mut state, &*store, &snapshot_tx, &notes_tx, message);
                break;
            }
        }

        // 墙钟恰好读一次：在日志化时刻；此后核心只见信封里的值
        let envelope = SignalEnvelope {
            seq: state.applied_seq + 1,
            received_at: chrono::Utc::now().timestamp_millis(),
            signal,
        };
        if let Err(e) = store.append_signal(&workflow_id, &envelope) {
            tracing::error!(workflow = %workflow_id, error = %e, "Journal append failed, stopping instance");
            break;
        }

        let report = match state.apply(&envelope, policy.as_ref()) {
            Ok(report) => report,
            Err(OrchestratorError::Nondeterminism(message)) => {
                abort_instance(&mut state, &*store, &snapshot_tx, &notes_tx, message);
                break;
            }
            Err(e) => {
                tracing::error!(workflow = %workflow_id, error = %e, "Apply failed");
                break;
            }
        };

        if let Err(e) = persist(&*store, &state) {
            tracing::error!(workflow = %workflow_id, error = %e, "Checkpoint write failed, stopping instance");
            break;
        }
        // 检查点已落盘，现在才对外可见
        let _ = snapshot_tx.send(state.snapshot());
        for note in report.notes {
            let _ = notes_tx.send(note);
        }

        if state.status.is_terminal() {
            calls_token.cancel();
            tracing::info!(workflow = %workflow_id, status = %state.status.as_str(), "Workflow ended");
            break;
        }

        for dispatch in report.dispatches {
            spawn_call(&runner, &signal_tx, dispatch, calls_token.child_token());
        }
    }
}

/// 重放分歧：整实例中止，区别于一切用户可见失败单独上报
fn abort_instance(
    state: &mut WorkflowState,
    store: &dyn CheckpointStore,
    snapshot_tx: &watch::Sender<WorkflowSnapshot>,
    notes_tx: &broadcast::Sender<WorkflowNote>,
    message: String,
) {
    tracing::error!(workflow = %state.workflow_id, %message, "Nondeterminism detected, aborting instance");
    state.status = WorkflowStatus::Failed;
    if let Err(e) = persist(store, state) {
        tracing::error!(workflow = %state.workflow_id, error = %e, "Failed to persist aborted state");
    }
    let _ = snapshot_tx.send(state.snapshot());
    let _ = notes_tx.send(WorkflowNote::Nondeterminism { message });
    let _ = notes_tx.send(WorkflowNote::Ended {
        status: WorkflowStatus::Failed,
    });
}

/// 后台执行一个适配器调用；取消点被触发时结果直接丢弃
fn spawn_call(
    runner: &Arc<ActivityRunner>,
    signal_tx: &mpsc::UnboundedSender<Signal>,
    dispatch: Dispatch,
    cancel: CancellationToken,
) {
    let runner = runner.clone();
    let signal_tx = signal_tx.clone();
    tokio::spawn(async move {
        let Dispatch { agent_id, call } = dispatch;
        if let Some(outcome) = runner.run(&call.request, &call.dedup_key, cancel).await {
            let _ = signal_tx.send(Signal::AdapterResult {
                agent_id,
                dedup_key: call.dedup_key,
                outcome,
            });
        }
    });
}

/// 实例截止定时器：触发以日志化信号进入，重放时无需真实计时
fn arm_deadline(
    deadline_ms: u64,
    signal_tx: &mpsc::UnboundedSender<Signal>,
    cancel: CancellationToken,
) {
    let signal_tx = signal_tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(std::time::Duration::from_millis(deadline_ms)) => {
                let _ = signal_tx.send(Signal::TimerFired { timer_id: "deadline".to_string() });
            }
        }
    });
}
