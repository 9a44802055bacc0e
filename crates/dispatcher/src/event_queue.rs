//! 事件队列与运行集合
//!
//! 纯同步数据结构，由 [`crate::EventManager`] 在同一把锁下修改，
//! 保证“检查去重 + 入队”和“出队 + 占位运行”都是原子的。

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use orchestrator_domain::{Event, ItemId};

#[derive(Debug, Clone)]
struct QueuedEvent {
    seq: u64,
    event: Event,
}

impl QueuedEvent {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.event.run_at, self.seq)
    }
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// 正在运行（或已出队等待提交）的任务
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub service_key: Option<String>,
    pub event: Option<Event>,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    heap: BinaryHeap<Reverse<QueuedEvent>>,
    queued: HashSet<ItemId>,
    running: HashMap<ItemId, RunningJob>,
    next_seq: u64,
}

impl EventQueue {
    /// 任一ID已在队列或运行集合中
    pub fn is_busy(&self, ids: &[ItemId]) -> bool {
        ids.iter()
            .any(|id| self.queued.contains(id) || self.running.contains_key(id))
    }

    pub fn push(&mut self, event: Event) {
        self.queued.insert(event.item_id);
        self.heap.push(Reverse(QueuedEvent {
            seq: self.next_seq,
            event,
        }));
        self.next_seq += 1;
    }

    /// 队首事件到期时出队
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<Event> {
        let due = self
            .heap
            .peek()
            .is_some_and(|Reverse(head)| head.event.is_due(now));
        if !due {
            return None;
        }
        let Reverse(head) = self.heap.pop()?;
        self.queued.remove(&head.event.item_id);
        Some(head.event)
    }

    /// 出队并立即在运行集合中占位，中间不会出现条目既不在队列也不在运行集合的窗口
    pub fn pop_due_reserved(&mut self, now: DateTime<Utc>) -> Option<(Event, CancellationToken)> {
        let event = self.pop_due(now)?;
        let cancel = self.reserve(event.item_id, None, Some(event.clone()));
        Some((event, cancel))
    }

    /// 在运行集合中占位；已经占位时沿用原来的取消令牌
    pub fn reserve(
        &mut self,
        item_id: ItemId,
        service_key: Option<&str>,
        event: Option<Event>,
    ) -> CancellationToken {
        let job = self.running.entry(item_id).or_insert_with(|| RunningJob {
            service_key: None,
            event: None,
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
        });
        if let Some(key) = service_key {
            job.service_key = Some(key.to_string());
        }
        if event.is_some() {
            job.event = event;
        }
        job.cancel.clone()
    }

    pub fn release(&mut self, item_id: ItemId) -> Option<RunningJob> {
        self.running.remove(&item_id)
    }

    /// 删除给定ID的排队事件，返回删除数量
    pub fn remove_queued(&mut self, ids: &[ItemId]) -> usize {
        let before = self.heap.len();
        self.heap
            .retain(|Reverse(queued)| !ids.contains(&queued.event.item_id));
        for id in ids {
            self.queued.remove(id);
        }
        before - self.heap.len()
    }

    /// 对给定ID的运行任务发出取消请求；条目要等完成回调后才离开运行集合
    pub fn cancel_running(&self, ids: &[ItemId]) -> usize {
        ids.iter()
            .filter_map(|id| self.running.get(id))
            .filter(|job| !job.cancel.is_cancelled())
            .map(|job| job.cancel.cancel())
            .count()
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse(head)| head.event.run_at)
    }

    pub fn queued_len(&self) -> usize {
        self.heap.len()
    }

    pub fn running(&self) -> &HashMap<ItemId, RunningJob> {
        &self.running
    }
}
