use crate::error::{DownloadError, Result};
use bit_set::BitSet;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

/// 分片字节范围（不可变）
///
/// `start_byte` 与 `end_byte` 均为闭区间端点，与 HTTP Range 头一致
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRangeChunk {
    url: String,
    local_path: PathBuf,
    start_byte: u64,
    end_byte: u64,
    chunk_number: usize,
    created_at: DateTime<Utc>,
}

impl ByteRangeChunk {
    /// 创建分片，范围倒置或 URL/路径为空时返回校验错误
    pub fn new(
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
        start_byte: u64,
        end_byte: u64,
        chunk_number: usize,
    ) -> Result<Self> {
        let url = url.into();
        let local_path = local_path.into();

        if url.trim().is_empty() {
            return Err(DownloadError::Validation("分片 URL 不能为空".to_string()));
        }
        if local_path.as_os_str().is_empty() {
            return Err(DownloadError::Validation("分片本地路径不能为空".to_string()));
        }
        if start_byte > end_byte {
            return Err(DownloadError::Validation(format!(
                "分片 #{} 字节范围倒置: {}-{}",
                chunk_number, start_byte, end_byte
            )));
        }

        Ok(Self {
            url,
            local_path,
            start_byte,
            end_byte,
            chunk_number,
            created_at: Utc::now(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn start_byte(&self) -> u64 {
        self.start_byte
    }

    pub fn end_byte(&self) -> u64 {
        self.end_byte
    }

    pub fn chunk_number(&self) -> usize {
        self.chunk_number
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }
}

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// 等待下载
    Pending,
    /// 下载中（防止重复调度）
    Downloading,
    /// 已完成
    Done,
    /// 重试耗尽或永久失败
    Failed,
}

/// 单个分片的执行状态
#[derive(Debug, Clone)]
pub struct ChunkState {
    pub chunk: ByteRangeChunk,
    /// 已尝试次数（含首次）
    pub attempts: u32,
    pub status: ChunkStatus,
    /// 最近一次失败原因
    pub last_error: Option<DownloadError>,
}

impl ChunkState {
    pub fn new(chunk: ByteRangeChunk) -> Self {
        Self {
            chunk,
            attempts: 0,
            status: ChunkStatus::Pending,
            last_error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ChunkStatus::Done
    }
}

/// 分片管理器
///
/// 负责把文件切分为连续、无重叠的字节范围，并记录每个分片的执行状态
#[derive(Debug, Clone)]
pub struct ChunkManager {
    /// 所有分片
    chunks: Vec<ChunkState>,
    /// 文件总大小
    total_size: u64,
    /// 分片大小
    chunk_size: u64,
}

impl ChunkManager {
    /// 按 `chunk_size` 切分 `[0, total_size)`
    ///
    /// 分片数量为 `ceil(total_size / chunk_size)`，最后一个分片的 `end_byte` 截断到 `total_size - 1`
    pub fn partition(
        url: &str,
        local_path: &Path,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<Self> {
        if total_size == 0 {
            return Err(DownloadError::Validation("文件大小为 0，无法分片".to_string()));
        }
        if chunk_size == 0 {
            return Err(DownloadError::Validation("分片大小必须大于 0".to_string()));
        }

        let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
        let mut offset = 0u64;
        let mut index = 0usize;

        while offset < total_size {
            let end = offset.saturating_add(chunk_size).min(total_size) - 1;
            chunks.push(ChunkState::new(ByteRangeChunk::new(
                url, local_path, offset, end, index,
            )?));
            offset = end + 1;
            index += 1;
        }

        info!(
            "创建分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        Ok(Self {
            chunks,
            total_size,
            chunk_size,
        })
    }

    /// 服务器不支持 Range 时退化为单个整文件分片
    pub fn single(url: &str, local_path: &Path, total_size: u64) -> Result<Self> {
        Self::partition(url, local_path, total_size, total_size)
    }

    /// 获取所有分片
    pub fn chunks(&self) -> &[ChunkState] {
        &self.chunks
    }

    pub fn get(&self, index: usize) -> Option<&ChunkState> {
        self.chunks.get(index)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 获取已完成的分片数量
    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_done()).count()
    }

    /// 已完成分片的字节数
    pub fn downloaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.is_done())
            .map(|c| c.chunk.size())
            .sum()
    }

    /// 计算下载进度
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.downloaded_bytes() as f64 / self.total_size as f64) * 100.0
    }

    /// 是否全部完成
    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.is_done())
    }

    /// 是否存在失败分片
    pub fn has_failed(&self) -> bool {
        self.chunks.iter().any(|c| c.status == ChunkStatus::Failed)
    }

    /// 待下载的分片索引（未完成且未在下载中）
    pub fn pending_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c.status, ChunkStatus::Pending | ChunkStatus::Failed))
            .map(|(i, _)| i)
            .collect()
    }

    /// 标记分片开始一次新的尝试，返回本次尝试序号（从 1 开始）
    pub fn begin_attempt(&mut self, index: usize) -> u32 {
        match self.chunks.get_mut(index) {
            Some(chunk) => {
                chunk.attempts += 1;
                chunk.status = ChunkStatus::Downloading;
                chunk.attempts
            }
            None => 0,
        }
    }

    /// 撤销被暂停或取消打断的尝试，不计入尝试次数
    pub fn abandon_attempt(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.attempts = chunk.attempts.saturating_sub(1);
            if chunk.status == ChunkStatus::Downloading {
                chunk.status = ChunkStatus::Pending;
            }
        }
    }

    /// 记录一次失败尝试（分片保持下载中，等待退避后重试）
    pub fn record_failure(&mut self, index: usize, error: DownloadError) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.last_error = Some(error);
        }
    }

    /// 标记分片为已完成
    pub fn mark_completed(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Done;
            chunk.last_error = None;
        }
    }

    /// 标记分片为失败
    pub fn mark_failed(&mut self, index: usize, error: DownloadError) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Failed;
            chunk.last_error = Some(error);
        }
    }

    /// 把下载中的分片退回等待状态（暂停或取消时调用）
    pub fn reset_in_flight(&mut self) -> usize {
        let mut reset = 0;
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::Downloading {
                chunk.status = ChunkStatus::Pending;
                reset += 1;
            }
        }
        reset
    }

    /// 失败分片重新进入等待状态并清零尝试次数（手动恢复时调用）
    pub fn reset_failed(&mut self) -> usize {
        let mut reset = 0;
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
                chunk.attempts = 0;
                reset += 1;
            }
        }
        reset
    }

    /// 目标文件丢失或被截断时，已完成分片全部作废，返回作废的分片数
    pub fn reset_completed(&mut self) -> usize {
        let mut reset = 0;
        for chunk in &mut self.chunks {
            if chunk.is_done() {
                chunk.status = ChunkStatus::Pending;
                chunk.attempts = 0;
                reset += 1;
            }
        }
        reset
    }

    /// 已完成分片的位集合
    pub fn completed_set(&self) -> BitSet {
        let mut set = BitSet::with_capacity(self.chunks.len());
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.is_done() {
                set.insert(i);
            }
        }
        set
    }

    /// 按持久化记录恢复已完成分片，返回恢复的字节数
    pub fn restore_completed(&mut self, completed: &BitSet) -> u64 {
        let mut restored = 0;
        for index in completed.iter() {
            if let Some(chunk) = self.chunks.get_mut(index) {
                if !chunk.is_done() {
                    chunk.status = ChunkStatus::Done;
                    restored += chunk.chunk.size();
                }
            }
        }
        restored
    }
}
