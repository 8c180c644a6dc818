//! 进度跟踪
//!
//! 计数器全部为原子变量，写入方不会被读取方阻塞；
//! 速度窗口使用每任务一把短锁。

use super::task::TaskStatus;
use crate::error::{DownloadError, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 默认速度统计窗口
const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);

/// 滑动窗口速度计算器
#[derive(Debug)]
pub struct SpeedCalculator {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }

    /// 记录一次传输
    pub fn add_sample(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.prune(now);
    }

    /// 丢弃窗口外的样本
    pub fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// 当前速度（字节/秒）
    pub fn speed(&self) -> u64 {
        let Some((oldest, _)) = self.samples.front() else {
            return 0;
        };
        let total: u64 = self.samples.iter().map(|(_, b)| *b).sum();
        // 不足 1 秒按 1 秒计
        let elapsed = oldest.elapsed().as_secs_f64().max(1.0);
        (total as f64 / elapsed) as u64
    }
}

/// 单个任务的进度计数
#[derive(Debug)]
pub struct TaskProgress {
    task_id: String,
    downloaded: AtomicU64,
    total: AtomicU64,
    status: RwLock<TaskStatus>,
    speed: Mutex<SpeedCalculator>,
}

impl TaskProgress {
    pub fn new(task_id: String, total: u64) -> Self {
        Self {
            task_id,
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(total),
            status: RwLock::new(TaskStatus::Pending),
            speed: Mutex::new(SpeedCalculator::with_default_window()),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        *self.status.write() = status;
        if status != TaskStatus::Running {
            self.speed.lock().clear();
        }
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Release);
    }

    /// 增加已下载字节，总量已知时截断到总量，返回新值
    pub(crate) fn add(&self, delta: u64) -> u64 {
        let total = self.total();
        let previous = self
            .downloaded
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.saturating_add(delta);
                Some(if total > 0 { next.min(total) } else { next })
            })
            .unwrap_or_else(|current| current);
        let added = if total > 0 {
            previous.saturating_add(delta).min(total) - previous
        } else {
            delta
        };
        if added > 0 {
            self.speed.lock().add_sample(added);
        }
        previous + added
    }

    /// 回滚已下载字节，返回新值
    pub(crate) fn sub(&self, delta: u64) -> u64 {
        let previous = self
            .downloaded
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(delta))
            })
            .unwrap_or_else(|current| current);
        previous.saturating_sub(delta)
    }

    /// 设置基线（从持久化记录恢复），不计入速度
    pub(crate) fn reset_to(&self, bytes: u64) {
        let total = self.total();
        let bytes = if total > 0 { bytes.min(total) } else { bytes };
        self.downloaded.store(bytes, Ordering::Release);
        self.speed.lock().clear();
    }

    pub fn speed(&self) -> u64 {
        self.speed.lock().speed()
    }

    fn prune_speed(&self, now: Instant) {
        self.speed.lock().prune(now);
    }

    pub fn snapshot(&self) -> DownloadProgress {
        let bytes_downloaded = self.downloaded();
        let total_bytes = self.total();
        let speed = self.speed();
        DownloadProgress {
            task_id: self.task_id.clone(),
            bytes_downloaded,
            total_bytes,
            speed_bytes_per_sec: speed,
            eta_seconds: eta(total_bytes.saturating_sub(bytes_downloaded), speed),
            status: self.status(),
        }
    }
}

fn eta(remaining: u64, speed: u64) -> Option<u64> {
    if speed == 0 {
        return None;
    }
    Some(remaining / speed)
}

/// 单任务进度快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub task_id: String,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub eta_seconds: Option<u64>,
    pub status: TaskStatus,
}

impl DownloadProgress {
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_downloaded as f64 / self.total_bytes as f64) * 100.0
    }
}

/// 全局进度快照（只统计未结束的任务）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalProgress {
    pub active_tasks: usize,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
    pub eta_seconds: Option<u64>,
}

/// 进度跟踪器，进度计数的唯一写入方
#[derive(Debug, Default)]
pub struct ProgressTracker {
    tasks: DashMap<String, Arc<TaskProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册任务并返回只读句柄
    pub fn register(&self, task_id: &str, total: u64) -> Arc<TaskProgress> {
        self.tasks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(TaskProgress::new(task_id.to_string(), total)))
            .clone()
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskProgress>> {
        self.tasks.get(task_id).map(|p| p.clone())
    }

    fn entry(&self, task_id: &str) -> Result<Arc<TaskProgress>> {
        self.get(task_id)
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))
    }

    /// 上报新写入的字节，返回累计值
    pub fn report_bytes(&self, task_id: &str, delta: u64) -> Result<u64> {
        Ok(self.entry(task_id)?.add(delta))
    }

    /// 回滚某个分片本次尝试已上报的字节
    pub fn rollback_bytes(&self, task_id: &str, delta: u64) -> Result<u64> {
        Ok(self.entry(task_id)?.sub(delta))
    }

    /// 设置已恢复的字节数
    pub fn restore(&self, task_id: &str, bytes: u64) -> Result<()> {
        self.entry(task_id)?.reset_to(bytes);
        Ok(())
    }

    pub fn set_total(&self, task_id: &str, total: u64) -> Result<()> {
        self.entry(task_id)?.set_total(total);
        Ok(())
    }

    pub fn snapshot(&self, task_id: &str) -> Option<DownloadProgress> {
        self.tasks.get(task_id).map(|p| p.snapshot())
    }

    pub fn global_snapshot(&self) -> GlobalProgress {
        let mut global = GlobalProgress::default();
        for entry in self.tasks.iter() {
            let progress = entry.value();
            if progress.status().is_terminal() {
                continue;
            }
            global.active_tasks += 1;
            global.bytes_downloaded += progress.downloaded();
            global.total_bytes += progress.total();
            global.speed_bytes_per_sec += progress.speed();
        }
        global.eta_seconds = eta(
            global.total_bytes.saturating_sub(global.bytes_downloaded),
            global.speed_bytes_per_sec,
        );
        global
    }

    /// 清理过期速度样本，空闲任务的速度归零
    pub fn prune_idle(&self) {
        let now = Instant::now();
        for entry in self.tasks.iter() {
            entry.value().prune_speed(now);
        }
    }

    pub fn forget(&self, task_id: &str) {
        self.tasks.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_and_rollback() {
        let tracker = ProgressTracker::new();
        tracker.register("t1", 1000);

        assert_eq!(tracker.report_bytes("t1", 300).unwrap(), 300);
        assert_eq!(tracker.report_bytes("t1", 200).unwrap(), 500);
        assert_eq!(tracker.rollback_bytes("t1", 200).unwrap(), 300);
        assert_eq!(tracker.rollback_bytes("t1", 5000).unwrap(), 0);

        assert!(matches!(
            tracker.report_bytes("missing", 1),
            Err(DownloadError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_progress_never_exceeds_total() {
        let tracker = ProgressTracker::new();
        tracker.register("t1", 100);
        tracker.report_bytes("t1", 80).unwrap();
        assert_eq!(tracker.report_bytes("t1", 80).unwrap(), 100);

        let snapshot = tracker.snapshot("t1").unwrap();
        assert_eq!(snapshot.bytes_downloaded, 100);
        assert_eq!(snapshot.percentage(), 100.0);
    }

    #[test]
    fn test_eta_none_without_speed() {
        let tracker = ProgressTracker::new();
        let handle = tracker.register("t1", 1000);
        tracker.restore("t1", 400).unwrap();

        let snapshot = tracker.snapshot("t1").unwrap();
        assert_eq!(snapshot.bytes_downloaded, 400);
        assert_eq!(snapshot.speed_bytes_per_sec, 0);
        assert_eq!(snapshot.eta_seconds, None);

        handle.set_status(TaskStatus::Running);
        tracker.report_bytes("t1", 100).unwrap();
        let snapshot = tracker.snapshot("t1").unwrap();
        assert!(snapshot.speed_bytes_per_sec > 0);
        assert!(snapshot.eta_seconds.is_some());
    }

    #[test]
    fn test_speed_calculator_window() {
        let mut calc = SpeedCalculator::new(Duration::from_millis(10));
        assert_eq!(calc.speed(), 0);
        calc.add_sample(1000);
        assert_eq!(calc.speed(), 1000);

        std::thread::sleep(Duration::from_millis(20));
        calc.prune(Instant::now());
        assert_eq!(calc.speed(), 0);
    }

    #[test]
    fn test_global_snapshot_skips_terminal() {
        let tracker = ProgressTracker::new();
        let a = tracker.register("a", 1000);
        let b = tracker.register("b", 500);
        tracker.report_bytes("a", 100).unwrap();
        tracker.report_bytes("b", 500).unwrap();

        a.set_status(TaskStatus::Running);
        b.set_status(TaskStatus::Completed);

        let global = tracker.global_snapshot();
        assert_eq!(global.active_tasks, 1);
        assert_eq!(global.bytes_downloaded, 100);
        assert_eq!(global.total_bytes, 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_monotonic_progress_under_concurrency() {
        let tracker = Arc::new(ProgressTracker::new());
        let total = 8 * 1000 * 16;
        tracker.register("t1", total);

        let mut writers = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            writers.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    tracker.report_bytes("t1", 16).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        let reader = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let mut last = 0;
                loop {
                    let snapshot = tracker.snapshot("t1").unwrap();
                    assert!(snapshot.bytes_downloaded >= last);
                    assert!(snapshot.bytes_downloaded <= snapshot.total_bytes);
                    last = snapshot.bytes_downloaded;
                    if last == total {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        reader.await.unwrap();
        assert_eq!(tracker.snapshot("t1").unwrap().bytes_downloaded, total);
    }
}
