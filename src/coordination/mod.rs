//! 协调层：同一工作流实例内 Agent 间的事件板
//!
//! publish 赋予单调递增的逻辑时钟值；peek 按每 Agent 游标返回其未读
//! 事件（广播或指向它的，不含自己发的），ack 在事件确实折入补全请求后
//! 才推进游标——未消费的事件在后续步重新可见。板与游标随检查点落盘，
//! 观察可从上次确认的偏移重启——重放安全。
//! 同一工作流步内的发布顺序 = Agent 注册顺序 + 步内发出顺序，由引擎按
//! 注册顺序推进 Agent 来保证，重放时逐事件一致。

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;

/// 跨 Agent 协调事件；发布后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationEvent {
    /// 板的逻辑时钟值（实例内全序）
    pub seq: u64,
    pub from: AgentId,
    /// None 为广播
    pub target: Option<AgentId>,
    pub topic: String,
    pub body: String,
    /// 发布时的工作流步号（= 信号序号）
    pub published_step: u64,
}

/// 事件板：逻辑时钟、游标、法定人数闩锁
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Board {
    events: Vec<CoordinationEvent>,
    clock: u64,
    /// agent -> 已观察到的事件数（events 下标）
    cursors: std::collections::BTreeMap<AgentId, usize>,
    /// 已发布 "done" 的 Agent，按首次发布顺序
    done: Vec<AgentId>,
    /// 完成只触发一次
    completed: bool,
}

impl Board {
    /// 发布事件，返回其逻辑时钟值
    pub fn publish(
        &mut self,
        from: &AgentId,
        target: Option<AgentId>,
        topic: &str,
        body: &str,
        published_step: u64,
    ) -> u64 {
        self.clock += 1;
        let seq = self.clock;
        if topic == "done" && !self.done.contains(from) {
            self.done.push(from.clone());
        }
        self.events.push(CoordinationEvent {
            seq,
            from: from.clone(),
            target,
            topic: topic.to_string(),
            body: body.to_string(),
            published_step,
        });
        seq
    }

    /// 自上次确认以来、对该 Agent 可见的事件（有序、有限）；不动游标
    pub fn peek(&self, agent_id: &AgentId) -> Vec<CoordinationEvent> {
        let cursor = self.cursors.get(agent_id).copied().unwrap_or(0);
        self.events[cursor..]
            .iter()
            .filter(|ev| {
                ev.from != *agent_id
                    && ev.target.as_ref().map(|t| t == agent_id).unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// 确认该 Agent 已消费至当前板尾，游标推进
    pub fn ack(&mut self, agent_id: &AgentId) {
        self.cursors.insert(agent_id.clone(), self.events.len());
    }

    /// 已报告 done 的 Agent 数是否达到法定人数
    pub fn quorum_met(&self, required: usize) -> bool {
        self.done.len() >= required
    }

    /// 闩锁完成：首次达到法定人数时返回 true，此后恒 false
    pub fn latch_completion(&mut self) -> bool {
        if self.completed {
            false
        } else {
            self.completed = true;
            true
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn done_count(&self) -> usize {
        self.done.len()
    }

    pub fn events(&self) -> &[CoordinationEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_assigns_strictly_increasing_seqs() {
        let mut board = Board::default();
        let a = "a".to_string();
        let b = "b".to_string();
        // 同一步内两个 Agent 发布：按注册顺序调用，序号严格递增
        let s1 = board.publish(&a, None, "note", "first", 7);
        let s2 = board.publish(&b, None, "note", "second", 7);
        assert_eq!((s1, s2), (1, 2));
        assert_eq!(board.events()[0].published_step, 7);
    }

    #[test]
    fn peek_is_cursor_based_and_excludes_own_events() {
        let mut board = Board::default();
        let a = "a".to_string();
        let b = "b".to_string();
        board.publish(&a, None, "note", "from a", 1);
        board.publish(&b, None, "note", "from b", 1);

        let seen = board.peek(&a);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].from, "b");

        // 未确认：事件保持可见
        assert_eq!(board.peek(&a).len(), 1);

        board.ack(&a);
        assert!(board.peek(&a).is_empty());

        board.publish(&b, None, "note", "again", 2);
        let seen = board.peek(&a);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].body, "again");
    }

    #[test]
    fn targeted_events_only_visible_to_target() {
        let mut board = Board::default();
        let a = "a".to_string();
        let b = "b".to_string();
        let c = "c".to_string();
        board.publish(&a, Some(b.clone()), "note", "for b only", 1);

        assert_eq!(board.peek(&b).len(), 1);
        assert!(board.peek(&c).is_empty());
    }

    #[test]
    fn quorum_counts_distinct_agents_and_latches_once() {
        let mut board = Board::default();
        let a = "a".to_string();
        let b = "b".to_string();
        board.publish(&a, None, "done", "ok", 1);
        board.publish(&a, None, "done", "ok again", 2);
        assert!(!board.quorum_met(2));

        board.publish(&b, None, "done", "ok", 3);
        assert!(board.quorum_met(2));

        assert!(board.latch_completion());
        assert!(!board.latch_completion());
    }
}
