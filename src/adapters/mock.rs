//! 脚本化适配器（用于测试与无 Key 演示）
//!
//! 按预置脚本逐次返回结果或失败；记录每次调用的请求与 dedup_key，
//! 便于测试断言「同 key 不产生第二次副作用」。脚本耗尽后返回默认应答。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::adapters::{ActivityAdapter, AdapterError, AdapterKind, AdapterRequest};

/// 脚本化适配器：线程安全，可跨任务共享
pub struct ScriptedAdapter {
    kind: AdapterKind,
    script: Mutex<VecDeque<Result<String, AdapterError>>>,
    calls: Mutex<Vec<(AdapterRequest, String)>>,
}

impl ScriptedAdapter {
    pub fn new(kind: AdapterKind) -> Self {
        Self {
            kind,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条脚本应答（按调用顺序消费）
    pub fn push(&self, step: Result<String, AdapterError>) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn with_script(kind: AdapterKind, steps: Vec<Result<String, AdapterError>>) -> Self {
        let adapter = Self::new(kind);
        for step in steps {
            adapter.push(step);
        }
        adapter
    }

    /// 实际到达适配器的调用次数（去重缓存命中不计入）
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// 到达适配器的 (request, dedup_key) 记录
    pub fn calls(&self) -> Vec<(AdapterRequest, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn default_reply(&self) -> String {
        match self.kind {
            AdapterKind::Completion => {
                r#"{"action":"done","summary":"scripted run complete"}"#.to_string()
            }
            _ => "ok".to_string(),
        }
    }
}

#[async_trait]
impl ActivityAdapter for ScriptedAdapter {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    async fn invoke(&self, request: &AdapterRequest, dedup_key: &str) -> Result<String, AdapterError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.clone(), dedup_key.to_string()));

        match self.script.lock().unwrap().pop_front() {
            Some(step) => step,
            None => Ok(self.default_reply()),
        }
    }
}
