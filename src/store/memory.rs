//! 内存存储（测试与无持久化演示用）

use std::collections::HashMap;
use std::sync::Mutex;

use crate::store::{CheckpointStore, SignalEnvelope, StoreError, WorkflowCheckpoint};

#[derive(Default)]
struct Row {
    journal: Vec<SignalEnvelope>,
    checkpoint: Option<WorkflowCheckpoint>,
}

/// 内存实现：行为与 SqliteStore 等价，进程退出即丢失
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, Row>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryStore {
    fn append_signal(&self, workflow_id: &str, envelope: &SignalEnvelope) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.entry(workflow_id.to_string()).or_default();
        if row.journal.iter().any(|e| e.seq == envelope.seq) {
            return Err(StoreError::Conflict(workflow_id.to_string(), envelope.seq));
        }
        row.journal.push(envelope.clone());
        Ok(())
    }

    fn load_journal(&self, workflow_id: &str, after_seq: u64) -> Result<Vec<SignalEnvelope>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut journal: Vec<SignalEnvelope> = rows
            .get(workflow_id)
            .map(|r| r.journal.iter().filter(|e| e.seq > after_seq).cloned().collect())
            .unwrap_or_default();
        journal.sort_by_key(|e| e.seq);
        Ok(journal)
    }

    fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        rows.entry(checkpoint.workflow_id.clone())
            .or_default()
            .checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    fn load_checkpoint(&self, workflow_id: &str) -> Result<Option<WorkflowCheckpoint>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(workflow_id).and_then(|r| r.checkpoint.clone()))
    }

    fn list_unfinished(&self) -> Result<Vec<String>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let mut ids: Vec<String> = rows
            .iter()
            .filter(|(_, r)| {
                r.checkpoint
                    .as_ref()
                    .map(|c| !c.status.is_terminal())
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
