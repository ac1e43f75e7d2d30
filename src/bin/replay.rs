//! colony-replay - 重放校验工具
//!
//! 从空状态折叠指定工作流的完整信号日志，与落盘检查点逐字节比对。
//! 用法：colony-replay <db_path> <workflow_id>...

use anyhow::{bail, Context};
use colony::agent::DirectivePolicy;
use colony::store::sqlite::SqliteStore;
use colony::workflow::WorkflowEngine;

fn main() -> anyhow::Result<()> {
    colony::observability::init();

    let mut args = std::env::args().skip(1);
    let Some(db_path) = args.next() else {
        bail!("usage: colony-replay <db_path> <workflow_id>...");
    };
    let ids: Vec<String> = args.collect();
    if ids.is_empty() {
        bail!("usage: colony-replay <db_path> <workflow_id>...");
    }

    let store = SqliteStore::new(&db_path).context("Failed to open checkpoint database")?;
    let policy = DirectivePolicy;

    let mut diverged = 0;
    for workflow_id in &ids {
        match WorkflowEngine::verify_replay(&store, workflow_id, &policy) {
            Ok(()) => println!("{}: replay matches checkpoint", workflow_id),
            Err(e) => {
                diverged += 1;
                eprintln!("{}: {}", workflow_id, e);
            }
        }
    }

    if diverged > 0 {
        bail!("{} of {} workflows diverged on replay", diverged, ids.len());
    }
    Ok(())
}
