//! 有界优先级下载队列
//!
//! 出队顺序：优先级高者优先，同优先级按入队顺序（FIFO）。
//! 顺序只在出队时保证，不会抢占已在执行的任务。

use crate::error::{DownloadError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// 任务优先级
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::str::FromStr for Priority {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(DownloadError::Validation(format!("未知的优先级: {}", other))),
        }
    }
}

/// 队列项，入队后不再修改
#[derive(Debug, Clone)]
pub struct PriorityDownloadItem {
    pub id: String,
    pub url: String,
    pub local_path: PathBuf,
    pub priority: Priority,
    pub enqueue_time: DateTime<Utc>,
    /// 入队序号，由队列分配
    sequence: u64,
}

impl PriorityDownloadItem {
    pub fn new(id: String, url: String, local_path: PathBuf, priority: Priority) -> Self {
        Self {
            id,
            url,
            local_path,
            priority,
            enqueue_time: Utc::now(),
            sequence: 0,
        }
    }
}

impl PartialEq for PriorityDownloadItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for PriorityDownloadItem {}

impl PartialOrd for PriorityDownloadItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityDownloadItem {
    // BinaryHeap 是大顶堆：优先级高者大，序号小者大
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// 线程安全的有界优先级队列
#[derive(Debug)]
pub struct PriorityDownloadQueue {
    heap: Mutex<BinaryHeap<PriorityDownloadItem>>,
    capacity: usize,
    sequence: AtomicU64,
    not_empty: Notify,
    not_full: Notify,
}

impl PriorityDownloadQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            heap: Mutex::new(BinaryHeap::with_capacity(capacity.min(1024))),
            capacity,
            sequence: AtomicU64::new(0),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// 有空位时压入，否则原样返回
    fn push_if_room(
        &self,
        mut item: PriorityDownloadItem,
    ) -> std::result::Result<(), PriorityDownloadItem> {
        {
            let mut heap = self.heap.lock();
            if heap.len() >= self.capacity {
                return Err(item);
            }
            item.sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            debug!(
                "入队: id={}, priority={:?}, seq={}",
                item.id, item.priority, item.sequence
            );
            heap.push(item);
        }
        self.not_empty.notify_waiters();
        Ok(())
    }

    fn pop_now(&self) -> Option<PriorityDownloadItem> {
        let item = self.heap.lock().pop();
        if item.is_some() {
            self.not_full.notify_waiters();
        }
        item
    }

    /// 入队，队列满时等待空位
    pub async fn enqueue(&self, mut item: PriorityDownloadItem) {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // 先登记再检查，避免错过唤醒
            notified.as_mut().enable();

            match self.push_if_room(item) {
                Ok(()) => return,
                Err(returned) => item = returned,
            }

            notified.await;
        }
    }

    /// 非阻塞入队，队列满时返回 [`DownloadError::QueueFull`]
    pub fn offer(&self, item: PriorityDownloadItem) -> Result<()> {
        self.push_if_room(item)
            .map_err(|_| DownloadError::QueueFull {
                capacity: self.capacity,
            })
    }

    /// 限时入队，超时返回 false 且队列不变
    pub async fn try_enqueue(&self, item: PriorityDownloadItem, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.enqueue(item))
            .await
            .is_ok()
    }

    /// 出队，队列为空时等待
    pub async fn dequeue(&self) -> PriorityDownloadItem {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.pop_now() {
                return item;
            }

            notified.await;
        }
    }

    /// 非阻塞出队
    pub fn poll(&self) -> Option<PriorityDownloadItem> {
        self.pop_now()
    }

    /// 限时出队
    pub async fn try_dequeue(&self, timeout: Duration) -> Option<PriorityDownloadItem> {
        tokio::time::timeout(timeout, self.dequeue()).await.ok()
    }

    /// 移除指定任务的队列项
    pub fn remove_by_id(&self, id: &str) -> bool {
        let removed = {
            let mut heap = self.heap.lock();
            let before = heap.len();
            heap.retain(|item| item.id != id);
            heap.len() != before
        };
        if removed {
            self.not_full.notify_waiters();
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.heap.lock().iter().any(|item| item.id == id)
    }

    pub fn size(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.lock().len() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn item(id: &str, priority: Priority) -> PriorityDownloadItem {
        PriorityDownloadItem::new(
            id.to_string(),
            format!("http://example.com/{}", id),
            PathBuf::from(format!("/tmp/{}", id)),
            priority,
        )
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = PriorityDownloadQueue::new(10);
        queue.enqueue(item("low", Priority::Low)).await;
        queue.enqueue(item("urgent", Priority::Urgent)).await;
        queue.enqueue(item("high", Priority::High)).await;

        assert_eq!(queue.dequeue().await.id, "urgent");
        assert_eq!(queue.dequeue().await.id, "high");
        assert_eq!(queue.dequeue().await.id, "low");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = PriorityDownloadQueue::new(10);
        for id in ["a", "b", "c"] {
            queue.enqueue(item(id, Priority::Normal)).await;
        }
        queue.enqueue(item("x", Priority::High)).await;

        let order: Vec<String> = (0..4).filter_map(|_| queue.poll()).map(|i| i.id).collect();
        assert_eq!(order, vec!["x", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_capacity_timeout() {
        let queue = PriorityDownloadQueue::new(1);
        queue.enqueue(item("first", Priority::Normal)).await;
        assert!(queue.is_full());

        let accepted = queue
            .try_enqueue(item("second", Priority::Urgent), Duration::from_millis(100))
            .await;
        assert!(!accepted);
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.poll().unwrap().id, "first");
    }

    #[tokio::test]
    async fn test_offer_when_full() {
        let queue = PriorityDownloadQueue::new(1);
        queue.offer(item("a", Priority::Low)).unwrap();
        let err = queue.offer(item("b", Priority::Low)).unwrap_err();
        assert!(matches!(err, DownloadError::QueueFull { capacity: 1 }));
    }

    #[tokio::test]
    async fn test_blocked_enqueue_resumes_after_dequeue() {
        let queue = Arc::new(PriorityDownloadQueue::new(1));
        queue.enqueue(item("a", Priority::Normal)).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(item("b", Priority::Normal)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.dequeue().await.id, "a");
        producer.await.unwrap();
        assert_eq!(queue.dequeue().await.id, "b");
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_item() {
        let queue = Arc::new(PriorityDownloadQueue::new(4));
        assert!(queue.try_dequeue(Duration::from_millis(20)).await.is_none());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(item("late", Priority::Low)).await;
        assert_eq!(consumer.await.unwrap().id, "late");
    }

    #[tokio::test]
    async fn test_remove_by_id() {
        let queue = PriorityDownloadQueue::new(4);
        queue.enqueue(item("a", Priority::Normal)).await;
        queue.enqueue(item("b", Priority::High)).await;

        assert!(queue.contains("a"));
        assert!(queue.remove_by_id("a"));
        assert!(!queue.remove_by_id("a"));
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.poll().unwrap().id, "b");
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("URGENT".parse::<Priority>().unwrap(), Priority::Urgent);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert!("asap".parse::<Priority>().is_err());
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Urgent),
        ]
    }

    proptest! {
        #[test]
        fn prop_dequeue_order_is_priority_then_fifo(
            priorities in proptest::collection::vec(priority_strategy(), 1..64)
        ) {
            let queue = PriorityDownloadQueue::new(priorities.len());
            for (i, p) in priorities.iter().enumerate() {
                queue.offer(item(&i.to_string(), *p)).unwrap();
            }

            let mut expected: Vec<(Priority, usize)> =
                priorities.iter().copied().enumerate().map(|(i, p)| (p, i)).collect();
            // 稳定排序：同优先级保持入队顺序
            expected.sort_by(|a, b| b.0.cmp(&a.0));

            for (priority, index) in expected {
                let got = queue.poll().unwrap();
                prop_assert_eq!(got.priority, priority);
                prop_assert_eq!(got.id, index.to_string());
            }
            prop_assert!(queue.is_empty());
        }
    }
}
