//! 适配器执行器：重试、超时、去重、取消
//!
//! 所有适配器调用从这里经过：先查去重缓存（同 key 直接返回已记录结果），
//! 再在每类适配器各自的重试预算内执行指数退避重试；最终结果以
//! AdapterOutcome 形式返回给工作流（Success / Exhausted / Permanent），
//! 由工作流日志化——重试永不直接暴露给调用方。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::adapters::{AdapterError, AdapterKind, AdapterOutcome, AdapterRequest, AdapterSet};

/// 去重缓存容量：超出后按插入顺序淘汰
const DEDUP_CACHE_CAP: usize = 4096;

/// 单类适配器的重试预算
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl RetryPolicy {
    /// 第 attempt 次失败后的退避时长（attempt 从 1 计）
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        Duration::from_millis(exp.min(self.backoff_cap_ms))
    }
}

impl From<&crate::config::RetrySection> for RetryPolicy {
    fn from(s: &crate::config::RetrySection) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            backoff_base_ms: s.backoff_base_ms,
            backoff_cap_ms: s.backoff_cap_ms,
        }
    }
}

/// 进程内去重缓存：dedup_key -> 已观测结果
struct DedupCache {
    map: HashMap<String, String>,
    order: VecDeque<String>,
}

impl DedupCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    fn insert(&mut self, key: String, result: String) {
        if self.map.insert(key.clone(), result).is_none() {
            self.order.push_back(key);
            while self.order.len() > DEDUP_CACHE_CAP {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                }
            }
        }
    }
}

/// 适配器执行器：持有适配器集合与按种类的重试/超时策略
pub struct ActivityRunner {
    adapters: AdapterSet,
    policies: HashMap<AdapterKind, RetryPolicy>,
    timeouts: HashMap<AdapterKind, Duration>,
    dedup: Mutex<DedupCache>,
}

impl ActivityRunner {
    pub fn new(adapters: AdapterSet) -> Self {
        Self {
            adapters,
            policies: HashMap::new(),
            timeouts: HashMap::new(),
            dedup: Mutex::new(DedupCache::new()),
        }
    }

    pub fn with_policy(mut self, kind: AdapterKind, policy: RetryPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    pub fn with_timeout(mut self, kind: AdapterKind, timeout: Duration) -> Self {
        self.timeouts.insert(kind, timeout);
        self
    }

    /// 从配置构建：三类适配器的预算取自 [retry.*]，超时取自各自的 timeout_secs
    pub fn from_config(adapters: AdapterSet, cfg: &crate::config::AppConfig) -> Self {
        Self::new(adapters)
            .with_policy(AdapterKind::Completion, (&cfg.retry.completion).into())
            .with_policy(AdapterKind::Chat, (&cfg.retry.chat).into())
            .with_policy(AdapterKind::Repository, (&cfg.retry.repository).into())
            .with_timeout(AdapterKind::Completion, Duration::from_secs(cfg.llm.timeout_secs))
            .with_timeout(AdapterKind::Chat, Duration::from_secs(cfg.chat.timeout_secs))
            .with_timeout(AdapterKind::Repository, Duration::from_secs(cfg.repo.timeout_secs))
    }

    fn policy(&self, kind: AdapterKind) -> RetryPolicy {
        self.policies.get(&kind).cloned().unwrap_or(RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 10_000,
        })
    }

    /// 执行一次适配器调用，重试在内部完成
    ///
    /// 返回 None 表示调用在取消点被放弃（结果一律丢弃，不得进入状态）。
    pub async fn run(
        self: &Arc<Self>,
        request: &AdapterRequest,
        dedup_key: &str,
        cancel: CancellationToken,
    ) -> Option<AdapterOutcome> {
        let kind = request.kind();

        // 同 key 已有结果：直接返回，不触达外部系统
        if let Some(cached) = self.dedup.lock().unwrap().get(dedup_key) {
            tracing::debug!(%dedup_key, %kind, "Dedup cache hit, skipping external call");
            return Some(AdapterOutcome::Success {
                result: cached,
                attempts: 0,
            });
        }

        let Some(adapter) = self.adapters.get(&kind) else {
            return Some(AdapterOutcome::Permanent {
                error: format!("No adapter registered for kind {}", kind),
                attempts: 0,
            });
        };

        let policy = self.policy(kind);
        let call_timeout = self.timeouts.get(&kind).copied();
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return None;
            }
            attempts += 1;

            let invocation = adapter.invoke(request, dedup_key);
            let result = match call_timeout {
                Some(t) => match tokio::time::timeout(t, invocation).await {
                    Ok(r) => r,
                    Err(_) => Err(AdapterError::Transient(format!(
                        "{} call timed out after {:?}",
                        kind, t
                    ))),
                },
                None => invocation.await,
            };

            match result {
                Ok(result) => {
                    self.dedup
                        .lock()
                        .unwrap()
                        .insert(dedup_key.to_string(), result.clone());
                    return Some(AdapterOutcome::Success { result, attempts });
                }
                Err(AdapterError::Permanent(error)) => {
                    tracing::warn!(%dedup_key, %kind, %error, "Permanent adapter failure");
                    return Some(AdapterOutcome::Permanent { error, attempts });
                }
                Err(AdapterError::Transient(error)) => {
                    if attempts >= policy.max_attempts {
                        tracing::warn!(%dedup_key, %kind, %error, attempts, "Retry budget exhausted");
                        return Some(AdapterOutcome::Exhausted { error, attempts });
                    }
                    let delay = policy.backoff(attempts);
                    tracing::debug!(%dedup_key, %kind, attempts, ?delay, "Transient failure, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
