//! 检查点存储：持久化基座的落盘面
//!
//! 两类记录：信号日志（追加式 SignalEnvelope）与工作流检查点（每次
//! 状态转移后整体重写）。检查点是重启后的唯一事实来源；日志尾部用于
//! 恢复时补算检查点之后已确认的信号。内存/SQLite 双实现同接口。

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::{Signal, WorkflowStatus};

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Checkpoint missing for workflow {0}")]
    Missing(String),

    /// 日志序号与已存在记录冲突（同一实例被并发写入）
    #[error("Journal conflict for workflow {0} at seq {1}")]
    Conflict(String, u64),
}

/// 日志行：信号 + 接收时赋予的序号与时间戳
///
/// seq 与 received_at 在信号被接受时赋值一次，重放时原样复用——
/// 这是核心不读墙钟仍能携带时间的机制。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub seq: u64,
    pub received_at: i64,
    pub signal: Signal,
}

/// 工作流检查点：全部 Agent 状态 + 协调板的序列化镜像
///
/// state_json 为规范化 JSON（有序容器），同一信号序列下重放镜像逐字节一致。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub applied_seq: u64,
    pub state_json: String,
    pub updated_at: i64,
}

/// 检查点存储接口
///
/// 每行都以 workflow_id 为键，仅由其所属实例写入；跨实例不共享可变状态，
/// 实现只需保证单行内的原子性。
pub trait CheckpointStore: Send + Sync {
    /// 追加一条日志行；同 (workflow, seq) 重复追加返回 Conflict
    fn append_signal(&self, workflow_id: &str, envelope: &SignalEnvelope) -> Result<(), StoreError>;

    /// 读取 seq > after_seq 的日志行，按序号升序
    fn load_journal(&self, workflow_id: &str, after_seq: u64) -> Result<Vec<SignalEnvelope>, StoreError>;

    /// 整体重写检查点
    fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError>;

    fn load_checkpoint(&self, workflow_id: &str) -> Result<Option<WorkflowCheckpoint>, StoreError>;

    /// 所有未到终态的工作流 id（启动恢复用）
    fn list_unfinished(&self) -> Result<Vec<String>, StoreError>;
}
