use anyhow::{bail, Context};
use chunked_downloader::{logging, AppConfig, DownloadEngine, DownloadTask, Priority, TaskStatus};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 单个任务的输出报告
#[derive(Debug, Serialize)]
struct TaskReport {
    #[serde(flatten)]
    task: DownloadTask,
    salvaged_bytes: Option<u64>,
}

/// 解析 `URL[=DEST]` 参数，未指定目标时取 URL 最后一段作为文件名
fn parse_target(arg: &str) -> anyhow::Result<(String, PathBuf)> {
    let (url, dest) = match arg.split_once('=') {
        // 查询串中的 '=' 属于 URL 本身
        Some((url, dest)) if !url.contains('?') => (url, Some(dest)),
        _ => (arg, None),
    };

    let dest = match dest {
        Some(dest) if !dest.is_empty() => PathBuf::from(dest),
        _ => {
            let parsed = reqwest::Url::parse(url).with_context(|| format!("无效的下载地址: {}", url))?;
            let name = parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|name| !name.is_empty())
                .unwrap_or("index.html");
            PathBuf::from(name)
        }
    };
    Ok((url.to_string(), dest))
}

/// 等待所有任务结束
async fn wait_all(engine: &DownloadEngine, ids: &[String]) -> anyhow::Result<()> {
    for id in ids {
        loop {
            let status = engine.wait_for_terminal(id, Duration::from_secs(1)).await?;
            if status.is_terminal() || status == TaskStatus::Paused {
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(CONFIG_PATH).await;

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    let targets = std::env::args()
        .skip(1)
        .map(|arg| parse_target(&arg))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if targets.is_empty() {
        bail!("用法: chunked-downloader URL[=DEST] ...");
    }

    info!("Chunked Downloader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let engine = DownloadEngine::new(config.download.clone()).context("创建下载引擎失败")?;
    engine.start().context("启动下载引擎失败")?;

    let mut ids = Vec::with_capacity(targets.len());
    for (url, dest) in &targets {
        match engine.add_download(url, dest, Priority::Normal).await {
            Ok(id) => ids.push(id),
            Err(e) => warn!("添加任务失败 {}: {}", url, e),
        }
    }

    let graceful = tokio::select! {
        result = wait_all(&engine, &ids) => {
            result?;
            true
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，取消所有任务...");
            false
        }
    };
    engine.shutdown(graceful).await;

    let reports: Vec<TaskReport> = engine
        .tasks()
        .into_iter()
        .map(|task| {
            let salvaged_bytes = engine
                .failure_report(&task.id)
                .ok()
                .flatten()
                .map(|report| report.salvaged_bytes);
            TaskReport {
                task,
                salvaged_bytes,
            }
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&reports)?);

    let failed = reports
        .iter()
        .filter(|r| r.task.status != TaskStatus::Completed)
        .count();
    if failed > 0 {
        bail!("{} 个任务未完成", failed);
    }
    info!("所有任务下载完成");
    Ok(())
}
