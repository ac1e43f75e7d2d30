//! SQLite 检查点存储
//!
//! 两张表：signals（追加式日志，(workflow_id, seq) 主键天然防重复追加）
//! 与 checkpoints（每工作流一行，整体重写）。WAL 模式。
//! 连接用 Mutex 包裹：写入都是单行短事务，多实例共享一个连接足够。

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{CheckpointStore, SignalEnvelope, StoreError, WorkflowCheckpoint};
use crate::workflow::WorkflowStatus;

/// SQLite 实现
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// 内存数据库（测试用）
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                workflow_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                received_at INTEGER NOT NULL,
                payload TEXT NOT NULL,

                PRIMARY KEY (workflow_id, seq)
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                workflow_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                applied_seq INTEGER NOT NULL,
                state TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(status);
            "#,
        )?;
        Ok(())
    }
}

impl CheckpointStore for SqliteStore {
    fn append_signal(&self, workflow_id: &str, envelope: &SignalEnvelope) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&envelope.signal)?;
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO signals (workflow_id, seq, received_at, payload) VALUES (?1, ?2, ?3, ?4)",
            params![workflow_id, envelope.seq, envelope.received_at, payload],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(workflow_id.to_string(), envelope.seq));
        }
        Ok(())
    }

    fn load_journal(&self, workflow_id: &str, after_seq: u64) -> Result<Vec<SignalEnvelope>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, received_at, payload FROM signals WHERE workflow_id = ?1 AND seq > ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![workflow_id, after_seq], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut journal = Vec::new();
        for row in rows {
            let (seq, received_at, payload) = row?;
            journal.push(SignalEnvelope {
                seq,
                received_at,
                signal: serde_json::from_str(&payload)?,
            });
        }
        Ok(journal)
    }

    fn save_checkpoint(&self, checkpoint: &WorkflowCheckpoint) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO checkpoints (workflow_id, status, applied_seq, state, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(workflow_id) DO UPDATE SET
                status = excluded.status,
                applied_seq = excluded.applied_seq,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
            params![
                checkpoint.workflow_id,
                checkpoint.status.as_str(),
                checkpoint.applied_seq,
                checkpoint.state_json,
                checkpoint.updated_at
            ],
        )?;
        Ok(())
    }

    fn load_checkpoint(&self, workflow_id: &str) -> Result<Option<WorkflowCheckpoint>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT status, applied_seq, state, updated_at FROM checkpoints WHERE workflow_id = ?1",
                params![workflow_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(status, applied_seq, state_json, updated_at)| WorkflowCheckpoint {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::parse(&status),
            applied_seq,
            state_json,
            updated_at,
        }))
    }

    fn list_unfinished(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT workflow_id FROM checkpoints WHERE status = 'running' ORDER BY workflow_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}
