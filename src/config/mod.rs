// 配置管理模块

use crate::error::DownloadError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: TransferConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 传输配置
///
/// 构造一次后不可变，由 [`TransferConfig::validate`] 在引擎创建时统一校验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 引擎工作线程数
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    /// 最大同时下载任务数（准入控制）
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    /// 单个任务最大并发分片数
    #[serde(default = "default_max_concurrent_chunks_per_task")]
    pub max_concurrent_chunks_per_task: usize,
    /// 建立连接超时（毫秒）
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// 单次读取超时（毫秒）
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// 每个分片的最大重试次数（总尝试次数 = max_retries + 1）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试退避基数（毫秒）
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// 重试退避倍数
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    /// 重试退避上限（毫秒）
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u64,
    /// 全局带宽限制（字节/秒），0 表示不限速
    #[serde(default)]
    pub bandwidth_limit_bytes_per_sec: u64,
    /// 是否启用断点续传（分片 WAL）
    #[serde(default = "default_true")]
    pub resume_supported: bool,
    /// 是否周期性输出进度日志
    #[serde(default = "default_true")]
    pub progress_reporting_enabled: bool,
    /// 维护定时器间隔（毫秒）
    #[serde(default = "default_progress_report_interval_ms")]
    pub progress_report_interval_ms: u64,
    /// 默认下载目录（相对目标路径基于此目录解析）
    #[serde(default = "default_download_directory")]
    pub download_directory: PathBuf,
    /// 等待队列容量
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// HTTP User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 已结束任务的保留时间（秒），超时后由维护定时器移除；0 表示一直保留
    #[serde(default)]
    pub finished_task_retention_secs: u64,
}

fn default_thread_pool_size() -> usize {
    8
}
fn default_max_concurrent_downloads() -> usize {
    3
}
fn default_max_concurrent_chunks_per_task() -> usize {
    4
}
fn default_connection_timeout_ms() -> u64 {
    10_000
}
fn default_read_timeout_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_base_ms() -> u64 {
    500
}
fn default_retry_backoff_multiplier() -> f64 {
    2.0
}
fn default_retry_backoff_max_ms() -> u64 {
    30_000
}
fn default_chunk_size_bytes() -> u64 {
    5 * 1024 * 1024 // 5MB
}
fn default_true() -> bool {
    true
}
fn default_progress_report_interval_ms() -> u64 {
    1_000
}
fn default_download_directory() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_user_agent() -> String {
    concat!("chunked-downloader/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: default_thread_pool_size(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_concurrent_chunks_per_task: default_max_concurrent_chunks_per_task(),
            connection_timeout_ms: default_connection_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_multiplier: default_retry_backoff_multiplier(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            chunk_size_bytes: default_chunk_size_bytes(),
            bandwidth_limit_bytes_per_sec: 0,
            resume_supported: true,
            progress_reporting_enabled: true,
            progress_report_interval_ms: default_progress_report_interval_ms(),
            download_directory: default_download_directory(),
            queue_capacity: default_queue_capacity(),
            user_agent: default_user_agent(),
            finished_task_retention_secs: 0,
        }
    }
}

impl TransferConfig {
    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), DownloadError> {
        fn non_zero(name: &str, value: u64) -> Result<(), DownloadError> {
            if value == 0 {
                return Err(DownloadError::Validation(format!("{} 必须大于 0", name)));
            }
            Ok(())
        }

        non_zero("thread_pool_size", self.thread_pool_size as u64)?;
        non_zero("max_concurrent_downloads", self.max_concurrent_downloads as u64)?;
        non_zero(
            "max_concurrent_chunks_per_task",
            self.max_concurrent_chunks_per_task as u64,
        )?;
        non_zero("connection_timeout_ms", self.connection_timeout_ms)?;
        non_zero("read_timeout_ms", self.read_timeout_ms)?;
        non_zero("chunk_size_bytes", self.chunk_size_bytes)?;
        non_zero("progress_report_interval_ms", self.progress_report_interval_ms)?;
        non_zero("queue_capacity", self.queue_capacity as u64)?;

        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(DownloadError::Validation(format!(
                "retry_backoff_multiplier 必须 >= 1.0，当前值: {}",
                self.retry_backoff_multiplier
            )));
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return Err(DownloadError::Validation(format!(
                "retry_backoff_base_ms ({}) 不能大于 retry_backoff_max_ms ({})",
                self.retry_backoff_base_ms, self.retry_backoff_max_ms
            )));
        }
        if self.download_directory.as_os_str().is_empty() {
            return Err(DownloadError::Validation("download_directory 不能为空".to_string()));
        }

        Ok(())
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config
            .download
            .validate()
            .context("Invalid download config")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download.validate().context("Invalid download config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时回退到默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("加载配置失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.download.thread_pool_size, 8);
        assert_eq!(config.download.max_retries, 3);
        assert_eq!(config.download.chunk_size_bytes, 5 * 1024 * 1024);
        assert_eq!(config.download.bandwidth_limit_bytes_per_sec, 0);
        assert!(config.download.resume_supported);
        assert!(config.download.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config/app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.max_concurrent_chunks_per_task = 6;
        config.download.bandwidth_limit_bytes_per_sec = 1024 * 1024;
        config.log.level = "debug".to_string();

        config.save_to_file(path).await.unwrap();
        let loaded = AppConfig::load_from_file(path).await.unwrap();

        assert_eq!(loaded.download, config.download);
        assert_eq!(loaded.log.level, "debug");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [download]
            chunk_size_bytes = 1024
            max_retries = 5
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.download.chunk_size_bytes, 1024);
        assert_eq!(config.download.max_retries, 5);
        assert_eq!(config.download.thread_pool_size, 8);
        assert_eq!(config.download.queue_capacity, 1024);
        assert!(config.log.enabled);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TransferConfig::default();
        config.chunk_size_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.retry_backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.retry_backoff_base_ms = 60_000;
        config.retry_backoff_max_ms = 1_000;
        assert!(config.validate().is_err());

        let mut config = TransferConfig::default();
        config.thread_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default("/nonexistent/dir/app.toml").await;
        assert_eq!(config.download, TransferConfig::default());
    }
}
