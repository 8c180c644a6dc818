// Chunked Downloader Library
// 并发分片下载引擎核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 下载引擎模块
pub mod downloader;

// 断点续传持久化
pub mod persistence;

// 导出常用类型
pub use config::{AppConfig, TransferConfig};
pub use downloader::{
    DownloadEngine, DownloadProgress, DownloadTask, FailureReport, GlobalProgress, Priority,
    TaskStatus,
};
pub use error::{DownloadError, ErrorKind};
