//! 下载引擎错误类型
//!
//! 错误分为五类：参数校验、网络、任务失败、并发控制、本地资源。
//! 重试与否由 [`ErrorKind`] 决定，而不是由调用栈的展开方式决定。

use serde::Serialize;
use std::io;
use thiserror::Error;

/// 错误的可重试性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// 临时性错误（超时、连接重置等），可按重试策略重试
    Transient,
    /// 永久性错误，立即失败
    Permanent,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Network,
    TaskFailure,
    Concurrency,
    Resource,
}

/// 下载引擎统一错误
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// 参数校验失败（如字节范围倒置、URL 为空）
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 网络错误（连接失败、超时、非 2xx/206 响应）
    #[error("网络错误: {0}")]
    Network(String),

    /// 分片重试耗尽后的任务级失败
    #[error("任务 {task_id} 失败: 分片 #{chunk_number} (bytes={start_byte}-{end_byte}): {last_error}")]
    TaskFailure {
        task_id: String,
        chunk_number: usize,
        start_byte: u64,
        end_byte: u64,
        last_error: Box<DownloadError>,
    },

    /// 非阻塞入队时队列已满
    #[error("下载队列已满 (容量 {capacity})")]
    QueueFull { capacity: usize },

    /// 任务不存在
    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    /// 重复的任务（同一目标路径已有未结束的任务）
    #[error("重复的下载任务: {0}")]
    DuplicateTask(String),

    /// 非法的状态转换（如对已结束的任务执行取消/暂停）
    #[error("任务 {task_id} 无法从 {from} 转换为 {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// 引擎状态错误（重复启动、已关闭）
    #[error("引擎状态错误: {0}")]
    EngineState(String),

    /// 本地资源错误（磁盘已满、权限不足等）
    #[error("本地资源错误: {0}")]
    Resource(String),

    /// 操作被取消（协作式取消检查点）
    #[error("操作已取消")]
    Cancelled,
}

impl DownloadError {
    /// 错误类别
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Network(_) => ErrorCategory::Network,
            Self::TaskFailure { .. } => ErrorCategory::TaskFailure,
            Self::QueueFull { .. }
            | Self::TaskNotFound(_)
            | Self::DuplicateTask(_)
            | Self::InvalidTransition { .. }
            | Self::EngineState(_)
            | Self::Cancelled => ErrorCategory::Concurrency,
            Self::Resource(_) => ErrorCategory::Resource,
        }
    }

    /// 是否可重试
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// 本地文件 I/O 错误归为资源错误
    pub fn resource(context: &str, err: io::Error) -> Self {
        Self::Resource(format!("{}: {} ({:?})", context, err, err.kind()))
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("请求超时: {}", err))
        } else if err.is_connect() {
            Self::Network(format!("连接失败: {}", err))
        } else {
            Self::Network(err.to_string())
        }
    }
}

pub type Result<T, E = DownloadError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_transient() {
        let err = DownloadError::Network("connection reset".to_string());
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn test_other_errors_are_permanent() {
        let errors = vec![
            DownloadError::Validation("bad range".to_string()),
            DownloadError::Resource("disk full".to_string()),
            DownloadError::QueueFull { capacity: 1 },
            DownloadError::Cancelled,
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::Permanent, "{:?}", err);
        }
    }

    #[test]
    fn test_task_failure_message_keeps_range() {
        let err = DownloadError::TaskFailure {
            task_id: "t1".to_string(),
            chunk_number: 3,
            start_byte: 3072,
            end_byte: 4095,
            last_error: Box::new(DownloadError::Network("timeout".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("#3"));
        assert!(msg.contains("3072-4095"));
        assert!(msg.contains("timeout"));
        assert_eq!(err.category(), ErrorCategory::TaskFailure);
    }

    #[test]
    fn test_io_error_maps_to_resource() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = DownloadError::resource("打开文件失败", io_err);
        assert_eq!(err.category(), ErrorCategory::Resource);
        assert!(err.to_string().contains("PermissionDenied"));
    }
}
