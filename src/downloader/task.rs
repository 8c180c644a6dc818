use super::chunk::ChunkManager;
use super::progress::{ProgressTracker, TaskProgress};
use super::queue::Priority;
use crate::error::{DownloadError, Result};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待中
    Pending,
    /// 下载中
    Running,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态
    ///
    /// 失败的任务仍可通过恢复重新进入等待状态，但不再占用目标路径
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 状态机校验
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Paused)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Paused, Pending)
                | (Paused, Cancelled)
                | (Failed, Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 下载任务
///
/// 进度计数由 [`ProgressTracker`](super::progress::ProgressTracker) 维护，任务只持有只读句柄
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    /// 任务ID
    pub id: String,
    /// 下载地址
    pub url: String,
    /// 本地保存路径
    pub destination_path: PathBuf,
    /// 优先级
    pub priority: Priority,
    /// 任务状态
    pub status: TaskStatus,
    /// 文件大小（探测前为 0）
    pub total_bytes: u64,
    /// 所有分片累计的重试次数
    pub retry_count: u32,
    /// 每个分片的最大重试次数
    pub max_retries: u32,
    /// 服务器是否支持 Range 请求
    pub supports_range: bool,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 开始时间
    pub started_at: Option<DateTime<Utc>>,
    /// 完成时间（完成、失败、取消）
    pub completed_at: Option<DateTime<Utc>>,
    /// 错误信息
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<DownloadError>,
    /// 分片状态（探测后创建）
    #[serde(skip)]
    pub chunks: Option<ChunkManager>,
    #[serde(rename = "bytes_downloaded", serialize_with = "serialize_progress")]
    progress: Arc<TaskProgress>,
}

fn serialize_error<S: Serializer>(
    error: &Option<DownloadError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

fn serialize_progress<S: Serializer>(
    progress: &Arc<TaskProgress>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(progress.downloaded())
}

impl DownloadTask {
    /// 创建任务并在进度跟踪器中注册
    pub fn new(
        url: String,
        destination_path: PathBuf,
        priority: Priority,
        max_retries: u32,
        tracker: &ProgressTracker,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let progress = tracker.register(&id, 0);
        Self {
            id,
            url,
            destination_path,
            priority,
            status: TaskStatus::Pending,
            total_bytes: 0,
            retry_count: 0,
            max_retries,
            supports_range: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            chunks: None,
            progress,
        }
    }

    /// 已确认写入的字节数
    pub fn bytes_downloaded(&self) -> u64 {
        self.progress.downloaded()
    }

    pub fn progress_handle(&self) -> &Arc<TaskProgress> {
        &self.progress
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_downloaded() as f64 / self.total_bytes as f64) * 100.0
    }

    /// 校验并执行状态转换
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(DownloadError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        match to {
            TaskStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Pending => {
                self.error = None;
                self.completed_at = None;
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Paused => {}
        }

        self.status = to;
        self.progress.set_status(to);
        Ok(())
    }

    /// 标记为下载中
    pub fn mark_running(&mut self) -> Result<()> {
        self.transition(TaskStatus::Running)
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) -> Result<()> {
        self.transition(TaskStatus::Completed)
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: DownloadError) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) -> Result<()> {
        self.transition(TaskStatus::Paused)
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) -> Result<()> {
        self.transition(TaskStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task() -> DownloadTask {
        let tracker = ProgressTracker::new();
        let task = DownloadTask::new(
            "http://example.com/file.bin".to_string(),
            PathBuf::from("./downloads/file.bin"),
            Priority::Normal,
            3,
            &tracker,
        );
        task.progress_handle().set_total(1000);
        task
    }

    #[test]
    fn test_task_creation() {
        let task = new_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.bytes_downloaded(), 0);
        assert_eq!(task.progress(), 0.0);
        assert!(task.chunks.is_none());
        assert!(!task.id.is_empty());
        assert_eq!(task.progress_handle().task_id(), task.id);
    }

    #[test]
    fn test_progress_calculation() {
        let mut task = new_task();
        task.total_bytes = 1000;

        task.progress_handle().add(250);
        assert_eq!(task.progress(), 25.0);

        task.progress_handle().add(750);
        assert_eq!(task.progress(), 100.0);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = new_task();

        task.mark_running().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert_eq!(task.progress_handle().status(), TaskStatus::Running);

        task.mark_paused().unwrap();
        assert_eq!(task.status, TaskStatus::Paused);

        task.transition(TaskStatus::Pending).unwrap();
        task.mark_running().unwrap();

        task.mark_failed(DownloadError::Network("reset".to_string()))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
        assert!(task.completed_at.is_some());

        // 失败任务可重新排队，错误被清除
        task.transition(TaskStatus::Pending).unwrap();
        assert!(task.error.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut task = new_task();
        task.mark_running().unwrap();
        task.mark_completed().unwrap();

        assert!(matches!(
            task.mark_cancelled(),
            Err(DownloadError::InvalidTransition { .. })
        ));
        assert!(task.mark_paused().is_err());
        assert_eq!(task.status, TaskStatus::Completed);

        let mut task = new_task();
        task.mark_cancelled().unwrap();
        assert!(task.mark_running().is_err());
        assert!(task.transition(TaskStatus::Pending).is_err());
    }

    #[test]
    fn test_serialize_report() {
        let mut task = new_task();
        task.progress_handle().add(42);
        task.mark_running().unwrap();
        task.mark_failed(DownloadError::Network("timeout".to_string()))
            .unwrap();

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["bytes_downloaded"], 42);
        assert!(json["error"].as_str().unwrap().contains("timeout"));
        assert!(json.get("chunks").is_none());
    }
}
