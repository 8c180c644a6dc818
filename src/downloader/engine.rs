//! 下载引擎
//!
//! 负责任务调度与执行：
//! - 固定数量的工作协程从优先级队列取任务，准入信号量限制同时执行的任务数
//! - 每个任务探测文件大小后切分为分片，分片并发数受任务级信号量限制
//! - 分片按偏移量直接写入预分配的目标文件，无需合并
//! - 暂停、取消、强制关闭均通过 `CancellationToken` 协作完成

use crate::config::TransferConfig;
use crate::downloader::chunk::{ByteRangeChunk, ChunkManager};
use crate::downloader::progress::{DownloadProgress, GlobalProgress, ProgressTracker};
use crate::downloader::queue::{Priority, PriorityDownloadItem, PriorityDownloadQueue};
use crate::downloader::retry::RetryPolicy;
use crate::downloader::task::{DownloadTask, TaskStatus};
use crate::downloader::throttle::BandwidthLimiter;
use crate::downloader::transport::{HttpFetcher, RangeFetcher, RemoteResource};
use crate::error::{DownloadError, Result};
use crate::persistence::{delete_wal_file, WalHeader, WalReader, WalRecord, WalWriter};
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 等待任务结束时的轮询间隔
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// 任务失败报告
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub task_id: String,
    pub error: String,
    /// 已完整写入磁盘的字节数（已完成分片）
    pub salvaged_bytes: u64,
}

/// 任务表中的条目
struct TaskEntry {
    task: Mutex<DownloadTask>,
    /// 同一任务同一时刻只允许一个工作协程执行
    exec: tokio::sync::Mutex<()>,
    /// 本次执行的取消令牌，恢复时替换
    token: Mutex<CancellationToken>,
}

/// 任务执行结果
enum RunOutcome {
    Completed,
    Interrupted,
}

/// 一次分片尝试的失败
struct AttemptFailure {
    error: DownloadError,
    /// 本次尝试已上报的字节数，需要回滚
    written: u64,
}

/// 单个任务执行期间共享给各分片的上下文
struct ChunkJob {
    entry: Arc<TaskEntry>,
    task_id: String,
    url: String,
    supports_range: bool,
    file: Arc<File>,
    wal: Option<Mutex<WalWriter>>,
    token: CancellationToken,
    failure: Mutex<Option<DownloadError>>,
}

impl ChunkJob {
    fn record_failure(&self, error: DownloadError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn has_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    fn take_failure(&self) -> Option<DownloadError> {
        self.failure.lock().take()
    }

    fn with_chunks<T>(&self, f: impl FnOnce(&mut ChunkManager) -> T) -> Option<T> {
        self.entry.task.lock().chunks.as_mut().map(f)
    }
}

/// 入队完成前调用方放弃等待时撤销登记，避免留下没有队列项的任务
struct RegistrationGuard<'a> {
    inner: &'a EngineInner,
    task_id: Option<String>,
}

impl RegistrationGuard<'_> {
    fn disarm(mut self) {
        self.task_id = None;
    }
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        if let Some(task_id) = self.task_id.take() {
            self.inner.tasks.remove(&task_id);
            self.inner.tracker.forget(&task_id);
            debug!("入队被放弃，撤销任务登记: {}", task_id);
        }
    }
}

/// 引擎内部状态，由工作协程共享
struct EngineInner {
    config: TransferConfig,
    retry: RetryPolicy,
    fetcher: Arc<dyn RangeFetcher>,
    queue: PriorityDownloadQueue,
    tracker: ProgressTracker,
    limiter: Option<BandwidthLimiter>,
    tasks: DashMap<String, Arc<TaskEntry>>,
    /// 目标路径检查与任务注册之间的互斥
    register_lock: Mutex<()>,
    admission: Arc<Semaphore>,
    shutdown: CancellationToken,
    accepting: AtomicBool,
}

/// 并发、可恢复的多分片下载引擎
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DownloadEngine {
    /// 使用 HTTP 传输创建引擎
    pub fn new(config: TransferConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config)?;
        Self::with_fetcher(config, Arc::new(fetcher))
    }

    /// 使用自定义传输创建引擎
    pub fn with_fetcher(config: TransferConfig, fetcher: Arc<dyn RangeFetcher>) -> Result<Self> {
        config.validate()?;

        info!(
            "创建下载引擎: 工作线程={}, 最大并发任务={}, 单任务分片并发={}, 分片大小={} bytes, 限速={} B/s",
            config.thread_pool_size,
            config.max_concurrent_downloads,
            config.max_concurrent_chunks_per_task,
            config.chunk_size_bytes,
            config.bandwidth_limit_bytes_per_sec
        );

        let inner = EngineInner {
            retry: RetryPolicy::from(&config),
            queue: PriorityDownloadQueue::new(config.queue_capacity),
            tracker: ProgressTracker::new(),
            limiter: BandwidthLimiter::new(config.bandwidth_limit_bytes_per_sec),
            tasks: DashMap::new(),
            register_lock: Mutex::new(()),
            admission: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            shutdown: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            fetcher,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// 启动工作协程与维护定时器，只能调用一次
    pub fn start(&self) -> Result<()> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(DownloadError::EngineState("引擎已关闭，无法启动".to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DownloadError::EngineState("引擎已经启动".to_string()));
        }

        let mut workers = self.workers.lock();
        for worker_id in 0..self.inner.config.thread_pool_size {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move { inner.worker_loop(worker_id).await }));
        }
        let inner = self.inner.clone();
        workers.push(tokio::spawn(async move { inner.maintenance_loop().await }));

        info!(
            "🚀 下载引擎已启动: {} 个工作线程",
            self.inner.config.thread_pool_size
        );
        Ok(())
    }

    /// 添加下载任务，立即返回任务 ID
    ///
    /// 队列已满时等待空位
    pub async fn add_download(
        &self,
        url: &str,
        destination: impl AsRef<Path>,
        priority: Priority,
    ) -> Result<String> {
        let item = self.inner.register(url, destination.as_ref(), priority)?;
        let task_id = item.id.clone();
        let guard = RegistrationGuard {
            inner: self.inner.as_ref(),
            task_id: Some(task_id.clone()),
        };
        self.inner.queue.enqueue(item).await;
        guard.disarm();
        Ok(task_id)
    }

    /// 移除已结束的任务及其进度记录
    pub fn remove_task(&self, task_id: &str) -> Result<DownloadTask> {
        let entry = self.inner.entry(task_id)?;
        match self.inner.evict_if_finished(task_id, |_| true) {
            Some(task) => Ok(task),
            None => Err(DownloadError::EngineState(format!(
                "任务 {} 尚未结束 (status={})，无法移除",
                task_id,
                entry.task.lock().status
            ))),
        }
    }

    /// 取消任务，已写入磁盘的数据保留
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let entry = self.inner.entry(task_id)?;
        let mut task = entry.task.lock();
        task.mark_cancelled()?;
        self.inner.queue.remove_by_id(task_id);
        entry.token.lock().cancel();
        info!("任务已取消: {}", task_id);
        Ok(())
    }

    /// 暂停任务，进行中的分片在下一个检查点停止
    pub fn pause(&self, task_id: &str) -> Result<()> {
        let entry = self.inner.entry(task_id)?;
        let mut task = entry.task.lock();
        task.mark_paused()?;
        self.inner.queue.remove_by_id(task_id);
        entry.token.lock().cancel();
        info!("任务已暂停: {}", task_id);
        Ok(())
    }

    /// 恢复已暂停或失败的任务，按原优先级重新入队
    pub async fn resume_task(&self, task_id: &str) -> Result<()> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(DownloadError::EngineState("引擎已关闭".to_string()));
        }

        let entry = self.inner.entry(task_id)?;
        let item = {
            let mut task = entry.task.lock();
            if task.status == TaskStatus::Failed {
                if let Some(chunks) = task.chunks.as_mut() {
                    let reset = chunks.reset_failed();
                    debug!("任务 {} 重置 {} 个失败分片", task_id, reset);
                }
            }
            task.transition(TaskStatus::Pending)?;
            *entry.token.lock() = CancellationToken::new();
            PriorityDownloadItem::new(
                task.id.clone(),
                task.url.clone(),
                task.destination_path.clone(),
                task.priority,
            )
        };

        self.inner.queue.enqueue(item).await;
        info!("任务已恢复: {}", task_id);
        Ok(())
    }

    /// 关闭引擎
    ///
    /// - `graceful = true`: 停止出队，等待执行中的任务完成
    /// - `graceful = false`: 取消所有执行中的任务
    ///
    /// 返回前所有工作协程和维护定时器均已退出
    pub async fn shutdown(&self, graceful: bool) {
        self.inner.accepting.store(false, Ordering::SeqCst);

        if !graceful {
            let mut cancelled = 0;
            for entry in self.inner.tasks.iter() {
                let mut task = entry.task.lock();
                if task.status == TaskStatus::Running && task.mark_cancelled().is_ok() {
                    entry.token.lock().cancel();
                    cancelled += 1;
                }
            }
            info!("强制关闭: 已取消 {} 个执行中的任务", cancelled);
        }

        self.inner.shutdown.cancel();

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("工作协程异常退出: {}", e);
            }
        }

        info!("下载引擎已关闭 (graceful={})", graceful);
    }

    /// 获取任务
    pub fn task(&self, task_id: &str) -> Option<DownloadTask> {
        self.inner
            .tasks
            .get(task_id)
            .map(|entry| entry.task.lock().clone())
    }

    /// 获取所有任务（按创建时间排序）
    pub fn tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.task.lock().clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn snapshot(&self, task_id: &str) -> Option<DownloadProgress> {
        self.inner.tracker.snapshot(task_id)
    }

    pub fn global_snapshot(&self) -> GlobalProgress {
        self.inner.tracker.global_snapshot()
    }

    /// 等待队列中的任务数
    pub fn queued(&self) -> usize {
        self.inner.queue.size()
    }

    /// 失败任务的错误与可保留的字节数，未失败时返回 None
    pub fn failure_report(&self, task_id: &str) -> Result<Option<FailureReport>> {
        let entry = self.inner.entry(task_id)?;
        let task = entry.task.lock();
        if task.status != TaskStatus::Failed {
            return Ok(None);
        }
        Ok(task.error.as_ref().map(|error| FailureReport {
            task_id: task.id.clone(),
            error: error.to_string(),
            salvaged_bytes: task
                .chunks
                .as_ref()
                .map(|c| c.downloaded_bytes())
                .unwrap_or(0),
        }))
    }

    /// 等待任务进入终态或暂停，超时后返回当时的状态
    pub async fn wait_for_terminal(&self, task_id: &str, wait: Duration) -> Result<TaskStatus> {
        let entry = self.inner.entry(task_id)?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let status = entry.task.lock().status;
            if status.is_terminal() || status == TaskStatus::Paused {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

impl EngineInner {
    fn entry(&self, task_id: &str) -> Result<Arc<TaskEntry>> {
        self.tasks
            .get(task_id)
            .map(|e| e.clone())
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))
    }

    /// 任务已结束且满足条件时从任务表和进度表中移除
    fn evict_if_finished(
        &self,
        task_id: &str,
        predicate: impl FnOnce(&DownloadTask) -> bool,
    ) -> Option<DownloadTask> {
        let (_, entry) = self.tasks.remove_if(task_id, |_, entry| {
            let task = entry.task.lock();
            task.status.is_terminal() && predicate(&task)
        })?;
        self.tracker.forget(task_id);
        let task = entry.task.lock().clone();
        Some(task)
    }

    /// 清理超过保留时间的已结束任务
    fn evict_expired(&self) {
        if self.config.finished_task_retention_secs == 0 {
            return;
        }
        let retention = i64::try_from(self.config.finished_task_retention_secs).unwrap_or(i64::MAX);
        let now = chrono::Utc::now();

        let candidates: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let mut evicted = 0;
        for task_id in candidates {
            let expired = |task: &DownloadTask| {
                task.completed_at
                    .map(|at| now.signed_duration_since(at).num_seconds() >= retention)
                    .unwrap_or(false)
            };
            if self.evict_if_finished(&task_id, expired).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("清理 {} 个已结束的任务", evicted);
        }
    }

    /// 校验参数并登记任务
    fn register(
        &self,
        url: &str,
        destination: &Path,
        priority: Priority,
    ) -> Result<PriorityDownloadItem> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DownloadError::EngineState("引擎已关闭，不再接受新任务".to_string()));
        }

        let url = url.trim();
        if url.is_empty() {
            return Err(DownloadError::Validation("下载地址不能为空".to_string()));
        }
        reqwest::Url::parse(url)
            .map_err(|e| DownloadError::Validation(format!("无效的下载地址 {}: {}", url, e)))?;

        if destination.as_os_str().is_empty() {
            return Err(DownloadError::Validation("保存路径不能为空".to_string()));
        }
        let destination = self.resolve_destination(destination);

        let _guard = self.register_lock.lock();
        let duplicate = self.tasks.iter().any(|entry| {
            let task = entry.task.lock();
            !task.status.is_terminal() && task.destination_path == destination
        });
        if duplicate {
            return Err(DownloadError::DuplicateTask(destination.display().to_string()));
        }

        let task = DownloadTask::new(
            url.to_string(),
            destination.clone(),
            priority,
            self.config.max_retries,
            &self.tracker,
        );
        let item = PriorityDownloadItem::new(task.id.clone(), task.url.clone(), destination, priority);

        info!(
            "📥 添加下载任务: id={}, url={}, 保存到={:?}, 优先级={:?}",
            task.id, task.url, task.destination_path, priority
        );

        self.tasks.insert(
            task.id.clone(),
            Arc::new(TaskEntry {
                task: Mutex::new(task),
                exec: tokio::sync::Mutex::new(()),
                token: Mutex::new(CancellationToken::new()),
            }),
        );
        Ok(item)
    }

    /// 相对路径基于下载目录解析
    fn resolve_destination(&self, destination: &Path) -> PathBuf {
        if destination.is_absolute() {
            destination.to_path_buf()
        } else {
            self.config.download_directory.join(destination)
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("工作线程 #{} 启动", worker_id);
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.admission.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                item = self.queue.dequeue() => item,
            };

            debug!(
                "工作线程 #{} 取得任务 {} (priority={:?})",
                worker_id, item.id, item.priority
            );
            self.clone().run_task(item.id).await;
            drop(permit);
        }
        debug!("工作线程 #{} 退出", worker_id);
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.progress_report_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tracker.prune_idle();
                    self.evict_expired();
                    if self.config.progress_reporting_enabled {
                        let global = self.tracker.global_snapshot();
                        if global.active_tasks > 0 {
                            info!(
                                "📊 进度: {} 个任务, {}/{} bytes, {:.2} KB/s, 剩余 {:?}s, 排队 {}",
                                global.active_tasks,
                                global.bytes_downloaded,
                                global.total_bytes,
                                global.speed_bytes_per_sec as f64 / 1024.0,
                                global.eta_seconds,
                                self.queue.size()
                            );
                        }
                    }
                }
            }
        }
        debug!("维护定时器退出");
    }

    /// 执行一个任务直到完成、失败或被中断
    async fn run_task(self: Arc<Self>, task_id: String) {
        let Ok(entry) = self.entry(&task_id) else {
            warn!("队列中的任务不存在: {}", task_id);
            return;
        };
        let _exec = entry.exec.lock().await;

        let token = {
            let mut task = entry.task.lock();
            if let Err(e) = task.mark_running() {
                debug!("跳过任务 {}: {}", task_id, e);
                return;
            }
            let token = entry.token.lock().clone();
            token
        };

        info!("▶️ 开始下载任务: {}", task_id);
        let result = self.execute(&entry, &task_id, &token).await;

        match result {
            Ok(RunOutcome::Completed) => {
                // 文件已完整，先删除 WAL 再对外可见
                if self.config.resume_supported {
                    let destination = entry.task.lock().destination_path.clone();
                    if let Err(e) =
                        blocking("删除 WAL 失败", move || delete_wal_file(&destination)).await
                    {
                        warn!("{}", e);
                    }
                }
                let mut task = entry.task.lock();
                match task.mark_completed() {
                    Ok(()) => info!("✅ 任务下载完成: {}", task_id),
                    Err(e) => debug!("任务 {} 已完成但状态已改变: {}", task_id, e),
                }
            }
            Ok(RunOutcome::Interrupted) => self.on_interrupted(&entry, &task_id),
            Err(_) if token.is_cancelled() => self.on_interrupted(&entry, &task_id),
            Err(e) => {
                error!("❌ 任务下载失败: {}: {}", task_id, e);
                let mut task = entry.task.lock();
                if let Some(chunks) = task.chunks.as_mut() {
                    chunks.reset_in_flight();
                }
                if let Err(transition) = task.mark_failed(e) {
                    debug!("任务 {} 无法标记为失败: {}", task_id, transition);
                }
            }
        }
    }

    fn on_interrupted(&self, entry: &TaskEntry, task_id: &str) {
        let mut task = entry.task.lock();
        let reset = task
            .chunks
            .as_mut()
            .map(|c| c.reset_in_flight())
            .unwrap_or(0);
        info!(
            "⏸️ 任务已中断: {} (status={}, {} 个分片退回等待)",
            task_id, task.status, reset
        );
    }

    async fn execute(
        self: &Arc<Self>,
        entry: &Arc<TaskEntry>,
        task_id: &str,
        token: &CancellationToken,
    ) -> Result<RunOutcome> {
        let (url, destination, needs_probe) = {
            let task = entry.task.lock();
            (
                task.url.clone(),
                task.destination_path.clone(),
                task.chunks.is_none(),
            )
        };

        let mut fresh = false;
        if needs_probe {
            let resource = self.probe_with_retry(&url, token).await?;
            if resource.total_size == 0 {
                create_empty_file(&destination).await?;
                info!("远程文件为空，已创建空文件: {:?}", destination);
                return Ok(RunOutcome::Completed);
            }

            let manager = if resource.accepts_ranges {
                ChunkManager::partition(
                    &url,
                    &destination,
                    resource.total_size,
                    self.config.chunk_size_bytes,
                )?
            } else {
                ChunkManager::single(&url, &destination, resource.total_size)?
            };

            {
                let mut task = entry.task.lock();
                task.total_bytes = resource.total_size;
                task.supports_range = resource.accepts_ranges;
                task.chunks = Some(manager);
            }
            self.tracker.set_total(task_id, resource.total_size)?;
            fresh = true;
        }

        let (total, chunk_size, chunk_count, supports_range) = {
            let task = entry.task.lock();
            let chunks = task
                .chunks
                .as_ref()
                .ok_or_else(|| DownloadError::EngineState("分片尚未初始化".to_string()))?;
            (
                chunks.total_size(),
                chunks.chunk_size(),
                chunks.chunk_count(),
                task.supports_range,
            )
        };
        let header = WalHeader {
            total_size: total,
            chunk_size,
        };

        let (file, existing_len) = open_destination(&destination).await?;

        if fresh && self.config.resume_supported && existing_len == total {
            self.restore_from_wal(entry, task_id, &destination, header, chunk_count)
                .await;
        }
        if existing_len != total {
            // 文件在两次执行之间被删除或截断，已完成分片不再可信
            let reset = {
                let mut task = entry.task.lock();
                task.chunks
                    .as_mut()
                    .map(|c| c.reset_completed())
                    .unwrap_or(0)
            };
            if reset > 0 {
                warn!(
                    "目标文件大小异常 ({} != {})，{} 个已完成分片需要重新下载: {:?}",
                    existing_len, total, reset, destination
                );
                self.tracker.restore(task_id, 0)?;
            }
            file.set_len(total)
                .await
                .map_err(|e| DownloadError::resource("预分配文件空间失败", e))?;
            debug!("文件预分配完成: {:?}, 大小: {} bytes", destination, total);
        }
        let file = Arc::new(file.into_std().await);

        let wal = if self.config.resume_supported {
            self.open_wal(entry, &destination, header).await
        } else {
            None
        };

        let pending = {
            let task = entry.task.lock();
            task.chunks
                .as_ref()
                .map(|c| c.pending_indices())
                .unwrap_or_default()
        };
        debug!(
            "任务 {}: 共 {} 个分片, 待下载 {} 个",
            task_id,
            chunk_count,
            pending.len()
        );

        let job = Arc::new(ChunkJob {
            entry: entry.clone(),
            task_id: task_id.to_string(),
            url,
            supports_range,
            file,
            wal,
            token: token.clone(),
            failure: Mutex::new(None),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_chunks_per_task));
        let mut join_set = JoinSet::new();

        for index in pending {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            // 已有分片失败时不再启动新分片
            if job.has_failed() {
                break;
            }

            let inner = self.clone();
            let job = job.clone();
            join_set.spawn(async move {
                let _permit = permit;
                if let Err(e) = inner.download_chunk_with_retry(&job, index).await {
                    if !matches!(e, DownloadError::Cancelled) {
                        job.record_failure(e);
                    }
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!("分片任务异常退出 (task={}): {}", task_id, e);
                job.record_failure(DownloadError::Resource(format!("分片任务异常退出: {}", e)));
            }
        }

        if token.is_cancelled() {
            return Ok(RunOutcome::Interrupted);
        }
        if let Some(failure) = job.take_failure() {
            return Err(failure);
        }

        let completed = job.with_chunks(|c| c.is_completed()).unwrap_or(false);
        if !completed {
            return Err(DownloadError::EngineState(format!(
                "任务 {} 存在未完成的分片",
                task_id
            )));
        }

        verify_file_size(&destination, total).await?;
        Ok(RunOutcome::Completed)
    }

    /// 探测远程文件，临时错误按重试策略重试
    async fn probe_with_retry(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<RemoteResource> {
        let connect_timeout = Duration::from_millis(self.config.connection_timeout_ms);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                result = timeout(connect_timeout, self.fetcher.probe(url)) => result
                    .unwrap_or_else(|_| Err(DownloadError::Network(format!(
                        "探测超时 ({}ms)",
                        self.config.connection_timeout_ms
                    )))),
            };

            match result {
                Ok(resource) => return Ok(resource),
                Err(e) if e.is_transient() && self.retry.should_retry(attempts) => {
                    let delay = self.retry.delay_for_attempt(attempts);
                    warn!(
                        "探测失败，{:?} 后重试 ({}/{}): {}",
                        delay,
                        attempts,
                        self.retry.max_retries,
                        e
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 按 WAL 恢复已完成的分片
    async fn restore_from_wal(
        &self,
        entry: &TaskEntry,
        task_id: &str,
        destination: &Path,
        header: WalHeader,
        chunk_count: usize,
    ) {
        let path = destination.to_path_buf();
        let contents = blocking("读取 WAL 失败", move || {
            match WalReader::for_destination(&path) {
                Some(reader) => reader.read_all().map(Some),
                None => Ok(None),
            }
        })
        .await;

        match contents {
            Ok(Some(contents)) if contents.header == Some(header) => {
                let completed = contents.completed_set(chunk_count);
                let restored = {
                    let mut task = entry.task.lock();
                    task.chunks
                        .as_mut()
                        .map(|c| c.restore_completed(&completed))
                        .unwrap_or(0)
                };
                if let Err(e) = self.tracker.restore(task_id, restored) {
                    warn!("恢复进度失败: {}", e);
                }
                info!(
                    "♻️ 从 WAL 恢复任务 {}: {} 个分片已完成 ({} bytes)",
                    task_id,
                    completed.len(),
                    restored
                );
            }
            Ok(Some(contents)) => warn!(
                "WAL 分片参数不匹配 ({:?} != {:?})，重新下载",
                contents.header, header
            ),
            Ok(None) => {}
            Err(e) => warn!("{}，重新下载", e),
        }
    }

    /// 重建 WAL 并写入当前已完成的分片
    async fn open_wal(
        &self,
        entry: &TaskEntry,
        destination: &Path,
        header: WalHeader,
    ) -> Option<Mutex<WalWriter>> {
        let done: Vec<WalRecord> = {
            let task = entry.task.lock();
            task.chunks
                .as_ref()
                .map(|c| c.completed_set().iter().map(WalRecord::new).collect())
                .unwrap_or_default()
        };

        let path = destination.to_path_buf();
        match blocking("创建 WAL 失败", move || {
            let mut writer = WalWriter::create(&path, header)?;
            writer.append(&done)?;
            Ok(writer)
        })
        .await
        {
            Ok(writer) => Some(Mutex::new(writer)),
            Err(e) => {
                warn!("{}，本次下载不记录断点", e);
                None
            }
        }
    }

    /// 下载单个分片（带重试）
    async fn download_chunk_with_retry(&self, job: &Arc<ChunkJob>, index: usize) -> Result<()> {
        let chunk = job
            .with_chunks(|c| c.get(index).map(|s| s.chunk.clone()))
            .flatten()
            .ok_or_else(|| DownloadError::EngineState(format!("分片 #{} 不存在", index)))?;

        loop {
            if job.token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let attempts = job.with_chunks(|c| c.begin_attempt(index)).unwrap_or(0);
            debug!(
                "[任务 {}] 下载分片 #{}: bytes={}-{}, 第 {} 次尝试",
                job.task_id,
                index,
                chunk.start_byte(),
                chunk.end_byte(),
                attempts
            );

            let failure = match self.transfer_chunk(job, &chunk).await {
                Ok(()) => match self.commit_chunk(job, index).await {
                    Ok(()) => {
                        job.with_chunks(|c| c.mark_completed(index));
                        debug!("[任务 {}] ✓ 分片 #{} 下载成功", job.task_id, index);
                        return Ok(());
                    }
                    Err(error) => AttemptFailure {
                        error,
                        written: chunk.size(),
                    },
                },
                Err(failure) => failure,
            };

            if failure.written > 0 {
                if let Err(e) = self.tracker.rollback_bytes(&job.task_id, failure.written) {
                    warn!("回滚进度失败: {}", e);
                }
            }

            let error = failure.error;
            if matches!(error, DownloadError::Cancelled) || job.token.is_cancelled() {
                job.with_chunks(|c| c.abandon_attempt(index));
                return Err(DownloadError::Cancelled);
            }

            if error.is_transient() && self.retry.should_retry(attempts) {
                job.with_chunks(|c| c.record_failure(index, error.clone()));
                job.entry.task.lock().retry_count += 1;

                let delay = self.retry.delay_for_attempt(attempts);
                warn!(
                    "[任务 {}] ⚠ 分片 #{} 下载失败，{:?} 后重试 ({}/{}): {}",
                    job.task_id, index, delay, attempts, self.retry.max_retries, error
                );
                tokio::select! {
                    _ = job.token.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            error!(
                "[任务 {}] ✗ 分片 #{} 下载失败，已尝试 {} 次: {}",
                job.task_id, index, attempts, error
            );
            job.with_chunks(|c| c.mark_failed(index, error.clone()));
            return Err(task_failure(&job.task_id, &chunk, error));
        }
    }

    /// 单次传输：读取数据流并按偏移写入文件
    async fn transfer_chunk(
        &self,
        job: &ChunkJob,
        chunk: &ByteRangeChunk,
    ) -> std::result::Result<(), AttemptFailure> {
        let fail = |error: DownloadError, written: u64| AttemptFailure { error, written };
        let range = job
            .supports_range
            .then(|| (chunk.start_byte(), chunk.end_byte()));

        let connect_timeout = Duration::from_millis(self.config.connection_timeout_ms);
        let read_timeout = Duration::from_millis(self.config.read_timeout_ms);

        let mut stream = tokio::select! {
            biased;
            _ = job.token.cancelled() => return Err(fail(DownloadError::Cancelled, 0)),
            result = timeout(connect_timeout, self.fetcher.fetch(&job.url, range)) => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(fail(e, 0)),
                Err(_) => return Err(fail(
                    DownloadError::Network(format!("连接超时 ({}ms)", self.config.connection_timeout_ms)),
                    0,
                )),
            },
        };

        let expected = chunk.size();
        let mut written = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = job.token.cancelled() => return Err(fail(DownloadError::Cancelled, written)),
                next = timeout(read_timeout, stream.next()) => next,
            };

            let block: Bytes = match next {
                Err(_) => {
                    return Err(fail(
                        DownloadError::Network(format!("读取超时 ({}ms)", self.config.read_timeout_ms)),
                        written,
                    ))
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(fail(e, written)),
                Ok(Some(Ok(block))) => block,
            };
            if block.is_empty() {
                continue;
            }

            let len = block.len() as u64;
            if written + len > expected {
                return Err(fail(
                    DownloadError::Validation(format!(
                        "分片 #{} 响应数据超出范围: 期望 {} bytes",
                        chunk.chunk_number(),
                        expected
                    )),
                    written,
                ));
            }

            if let Some(limiter) = &self.limiter {
                limiter
                    .acquire(len, &job.token)
                    .await
                    .map_err(|e| fail(e, written))?;
            }

            write_at(&job.file, chunk.start_byte() + written, block)
                .await
                .map_err(|e| fail(e, written))?;
            written += len;
            if let Err(e) = self.tracker.report_bytes(&job.task_id, len) {
                warn!("上报进度失败: {}", e);
            }
        }

        if written != expected {
            return Err(fail(
                DownloadError::Network(format!(
                    "分片 #{} 数据不完整: 收到 {} / {} bytes",
                    chunk.chunk_number(),
                    written,
                    expected
                )),
                written,
            ));
        }
        Ok(())
    }

    /// 分片数据落盘后记录到 WAL
    async fn commit_chunk(&self, job: &Arc<ChunkJob>, index: usize) -> Result<()> {
        let file = job.file.clone();
        blocking("同步文件失败", move || file.sync_data()).await?;

        if job.wal.is_some() {
            let job = job.clone();
            let result = blocking("写入 WAL 失败", move || match &job.wal {
                Some(wal) => wal.lock().append(&[WalRecord::new(index)]),
                None => Ok(()),
            })
            .await;
            if let Err(e) = result {
                warn!("{} (分片 #{})", e, index);
            }
        }
        Ok(())
    }
}

fn task_failure(task_id: &str, chunk: &ByteRangeChunk, error: DownloadError) -> DownloadError {
    DownloadError::TaskFailure {
        task_id: task_id.to_string(),
        chunk_number: chunk.chunk_number(),
        start_byte: chunk.start_byte(),
        end_byte: chunk.end_byte(),
        last_error: Box::new(error),
    }
}

/// 在阻塞线程池中执行文件 I/O
async fn blocking<T, F>(context: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DownloadError::Resource(format!("{}: 后台任务异常: {}", context, e)))?
        .map_err(|e| DownloadError::resource(context, e))
}

async fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::resource("创建父目录失败", e))?;
        }
    }
    Ok(())
}

/// 打开（或创建）目标文件，不截断已有内容
async fn open_destination(path: &Path) -> Result<(tokio::fs::File, u64)> {
    create_parent_dir(path).await?;
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| DownloadError::resource("打开目标文件失败", e))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| DownloadError::resource("获取文件元数据失败", e))?
        .len();
    Ok((file, len))
}

async fn create_empty_file(path: &Path) -> Result<()> {
    create_parent_dir(path).await?;
    tokio::fs::File::create(path)
        .await
        .map_err(|e| DownloadError::resource("创建文件失败", e))?;
    Ok(())
}

/// 校验文件大小
async fn verify_file_size(path: &Path, expected_size: u64) -> Result<()> {
    let actual_size = tokio::fs::metadata(path)
        .await
        .map_err(|e| DownloadError::resource("获取文件元数据失败", e))?
        .len();

    if actual_size != expected_size {
        return Err(DownloadError::Resource(format!(
            "文件大小不匹配: 期望 {} bytes, 实际 {} bytes",
            expected_size, actual_size
        )));
    }
    debug!("文件大小校验通过: {:?}, {} bytes", path, actual_size);
    Ok(())
}

/// 按偏移量写入，多个分片可以并发写同一个文件
async fn write_at(file: &Arc<File>, offset: u64, data: Bytes) -> Result<()> {
    let file = file.clone();
    blocking("写入文件失败", move || positional_write(&file, offset, &data)).await
}

#[cfg(unix)]
fn positional_write(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn positional_write(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < data.len() {
        let n = file.seek_write(&data[written..], offset + written as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "写入 0 字节",
            ));
        }
        written += n;
    }
    Ok(())
}
