//! 网络传输层
//!
//! 引擎只依赖 [`RangeFetcher`]，HTTP 实现基于 reqwest 的 Range 请求

use crate::config::TransferConfig;
use crate::error::{DownloadError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 响应体数据流
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// 远程资源探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteResource {
    /// 文件总大小
    pub total_size: u64,
    /// 是否支持 Range 请求
    pub accepts_ranges: bool,
}

/// 按字节范围获取远程数据
#[async_trait]
pub trait RangeFetcher: Send + Sync + std::fmt::Debug {
    /// 探测文件大小与 Range 支持情况
    async fn probe(&self, url: &str) -> Result<RemoteResource>;

    /// 获取数据，`range` 为闭区间；None 表示整个文件
    async fn fetch(&self, url: &str, range: Option<(u64, u64)>) -> Result<ByteStream>;
}

/// 解析 `Content-Range: bytes 0-0/1234` 中的总大小
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    rest.split('/').nth(1)?.trim().parse().ok()
}

/// 基于 reqwest 的 HTTP 实现
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &TransferConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connection_timeout_ms))
            .user_agent(config.user_agent.clone())
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| DownloadError::Validation(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RangeFetcher for HttpFetcher {
    async fn probe(&self, url: &str) -> Result<RemoteResource> {
        info!("🔍 探测下载链接: {}", url);

        let response = self.client.get(url).header(RANGE, "bytes=0-0").send().await?;
        let status = response.status();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        debug!("探测响应: status={}, content-range={:?}", status, content_range);

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let total_size = content_range
                    .as_deref()
                    .and_then(parse_content_range_total)
                    .ok_or_else(|| {
                        DownloadError::Validation(format!(
                            "无法解析 Content-Range: {:?}",
                            content_range
                        ))
                    })?;
                info!("✅ 服务器支持 Range 请求, 文件大小: {} bytes", total_size);
                Ok(RemoteResource {
                    total_size,
                    accepts_ranges: true,
                })
            }
            // 空文件对 bytes=0-0 返回 416，Content-Range 为 bytes */0
            StatusCode::RANGE_NOT_SATISFIABLE => {
                match content_range.as_deref().and_then(parse_content_range_total) {
                    Some(0) => Ok(RemoteResource {
                        total_size: 0,
                        accepts_ranges: true,
                    }),
                    _ => Err(DownloadError::Network(format!("探测失败: 服务器返回 {}", status))),
                }
            }
            s if s.is_success() => {
                let total_size = response.content_length().ok_or_else(|| {
                    DownloadError::Validation("服务器未返回 Content-Length，无法确定文件大小".to_string())
                })?;
                warn!(
                    "⚠️ 服务器不支持 Range 请求 (status={}), 回退到单连接下载, 文件大小: {} bytes",
                    status, total_size
                );
                Ok(RemoteResource {
                    total_size,
                    accepts_ranges: false,
                })
            }
            s => Err(DownloadError::Network(format!("探测失败: 服务器返回 {}", s))),
        }
    }

    async fn fetch(&self, url: &str, range: Option<(u64, u64)>) -> Result<ByteStream> {
        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            request = request.header(RANGE, format!("bytes={}-{}", start, end));
        }

        let response = request.send().await?;
        let status = response.status();

        match (range, status) {
            (Some(_), StatusCode::PARTIAL_CONTENT) => {}
            (Some((start, end)), StatusCode::OK) => {
                return Err(DownloadError::Validation(format!(
                    "服务器忽略了 Range 请求 bytes={}-{}",
                    start, end
                )));
            }
            (None, s) if s.is_success() => {}
            (_, s) => {
                return Err(DownloadError::Network(format!("服务器返回异常状态码 {}", s)));
            }
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(DownloadError::from))
            .boxed())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{FailureMode, MockFetcher};
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range_total("bytes 0-0/1234"), Some(1234));
        assert_eq!(parse_content_range_total("bytes */0"), Some(0));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("items 0-0/10"), None);
        assert_eq!(parse_content_range_total(""), None);
    }

    #[test]
    fn test_http_fetcher_builds_from_default_config() {
        assert!(HttpFetcher::new(&TransferConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_mock_fetch_range() {
        let data: Vec<u8> = (0..100u8).collect();
        let fetcher = MockFetcher::new("mock://f", data.clone());

        let resource = fetcher.probe("mock://f").await.unwrap();
        assert_eq!(resource.total_size, 100);
        assert!(resource.accepts_ranges);

        let stream = fetcher.fetch("mock://f", Some((10, 19))).await.unwrap();
        let blocks: Vec<Bytes> = stream.map(|b| b.unwrap()).collect().await;
        let body: Vec<u8> = blocks.concat();
        assert_eq!(body, data[10..20].to_vec());
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let fetcher = MockFetcher::new("mock://f", vec![7u8; 64])
            .fail(0, 1, FailureMode::Connect)
            .fail(32, 1, FailureMode::MidStream);

        assert!(fetcher.fetch("mock://f", Some((0, 31))).await.is_err());
        assert!(fetcher.fetch("mock://f", Some((0, 31))).await.is_ok());

        let stream = fetcher.fetch("mock://f", Some((32, 63))).await.unwrap();
        let results: Vec<Result<Bytes>> = stream.collect().await;
        assert!(results.last().unwrap().is_err());
        assert_eq!(fetcher.fetch_log().len(), 3);
    }
}
