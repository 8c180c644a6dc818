//! 分片 WAL (Write-Ahead Log)
//!
//! 记录已落盘的分片，进程重启后据此跳过已完成的字节范围
//!
//! ## 文件格式
//!
//! WAL 文件与目标文件放在同一目录，文件名为 `{目标文件名}.chunks.wal`，纯文本：
//! ```text
//! #{total_size},{chunk_size}
//! {chunk_index},{timestamp_ms}
//! ```
//!
//! - 首行为分片参数，参数不一致时整个 WAL 作废
//! - `chunk_index`: 分片索引（0-based）
//! - `timestamp_ms`: 记录时间戳（Unix 毫秒）

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bit_set::BitSet;
use tracing::{debug, error, warn};

/// WAL 文件后缀
const WAL_SUFFIX: &str = ".chunks.wal";

/// 获取目标文件对应的 WAL 路径
pub fn wal_path_for(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(WAL_SUFFIX);
    PathBuf::from(name)
}

/// 删除 WAL 文件
///
/// # Returns
/// - `Ok(true)` - 文件已删除
/// - `Ok(false)` - 文件不存在
pub fn delete_wal_file(destination: &Path) -> io::Result<bool> {
    let path = wal_path_for(destination);
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!("已删除 WAL 文件: {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// 分片参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub total_size: u64,
    pub chunk_size: u64,
}

impl WalHeader {
    fn to_wal_line(self) -> String {
        format!("#{},{}", self.total_size, self.chunk_size)
    }

    fn from_wal_line(line: &str) -> Option<Self> {
        let (total, chunk) = line.strip_prefix('#')?.split_once(',')?;
        Some(Self {
            total_size: total.trim().parse().ok()?,
            chunk_size: chunk.trim().parse().ok()?,
        })
    }
}

/// 单条分片完成记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalRecord {
    pub chunk_index: usize,
    pub timestamp_ms: i64,
}

impl WalRecord {
    pub fn new(chunk_index: usize) -> Self {
        Self {
            chunk_index,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn to_wal_line(self) -> String {
        format!("{},{}", self.chunk_index, self.timestamp_ms)
    }

    fn from_wal_line(line: &str) -> Option<Self> {
        let (index, ts) = line.split_once(',')?;
        Some(Self {
            chunk_index: index.trim().parse().ok()?,
            timestamp_ms: ts.trim().parse().ok()?,
        })
    }
}

// ============================================================================
// WalWriter - WAL 写入器
// ============================================================================

/// WAL 写入器
pub struct WalWriter {
    /// WAL 文件路径
    path: PathBuf,
    /// 带缓冲的文件写入器
    writer: Option<BufWriter<File>>,
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter").field("path", &self.path).finish()
    }
}

impl WalWriter {
    /// 新建 WAL（覆盖旧文件）并写入分片参数
    pub fn create(destination: &Path, header: WalHeader) -> io::Result<Self> {
        let path = wal_path_for(destination);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut writer = Self {
            path,
            writer: Some(BufWriter::new(file)),
        };
        writer.write_line(&header.to_wal_line())?;
        writer.sync()?;

        debug!("已创建 WAL: {:?} ({:?})", writer.path, header);
        Ok(writer)
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writeln!(writer, "{}", line),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "WAL writer already closed",
            )),
        }
    }

    /// 追加记录并同步到磁盘
    pub fn append(&mut self, records: &[WalRecord]) -> io::Result<()> {
        for record in records {
            self.write_line(&record.to_wal_line())?;
        }
        self.sync()
    }

    /// 刷写缓冲区并 fsync
    pub fn sync(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// 关闭 WAL 写入器
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("关闭 WAL 写入器失败 ({:?}): {}", self.path, e);
        }
    }
}

// ============================================================================
// WalReader - WAL 读取器
// ============================================================================

/// WAL 读取结果
#[derive(Debug, Clone, Default)]
pub struct WalContents {
    pub header: Option<WalHeader>,
    pub records: Vec<WalRecord>,
}

impl WalContents {
    /// 已完成分片集合，丢弃越界索引
    pub fn completed_set(&self, chunk_count: usize) -> BitSet {
        let mut set = BitSet::with_capacity(chunk_count);
        for record in &self.records {
            if record.chunk_index < chunk_count {
                set.insert(record.chunk_index);
            }
        }
        set
    }
}

/// WAL 读取器
#[derive(Debug)]
pub struct WalReader {
    path: PathBuf,
}

impl WalReader {
    /// 目标文件没有 WAL 时返回 None
    pub fn for_destination(destination: &Path) -> Option<Self> {
        let path = wal_path_for(destination);
        path.is_file().then_some(Self { path })
    }

    /// 读取所有记录
    ///
    /// 容错处理：跳过无法解析的行（例如崩溃时写了一半的末行）
    pub fn read_all(&self) -> io::Result<WalContents> {
        let reader = BufReader::new(File::open(&self.path)?);

        let mut contents = WalContents::default();
        let mut line_number = 0;
        let mut skipped = 0;

        for line_result in reader.lines() {
            line_number += 1;
            let line = match line_result {
                Ok(line) => line,
                Err(e) => {
                    warn!("WAL 读取失败 (行 {}): {} in {:?}", line_number, e, self.path);
                    skipped += 1;
                    continue;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line_number == 1 && line.starts_with('#') {
                contents.header = WalHeader::from_wal_line(line);
                if contents.header.is_none() {
                    skipped += 1;
                }
                continue;
            }

            match WalRecord::from_wal_line(line) {
                Some(record) => contents.records.push(record),
                None => {
                    warn!("WAL 解析失败 (行 {}): {:?} in {:?}", line_number, line, self.path);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            warn!(
                "WAL 读取完成，跳过 {} 行无效记录 (共 {} 行) in {:?}",
                skipped, line_number, self.path
            );
        }

        debug!("已读取 {} 条 WAL 记录 from {:?}", contents.records.len(), self.path);
        Ok(contents)
    }
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HEADER: WalHeader = WalHeader {
        total_size: 10240,
        chunk_size: 1024,
    };

    #[test]
    fn test_wal_path() {
        let path = wal_path_for(Path::new("/data/movie.mkv"));
        assert_eq!(path, PathBuf::from("/data/movie.mkv.chunks.wal"));
    }

    #[test]
    fn test_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("file.bin");

        let mut writer = WalWriter::create(&dest, HEADER).unwrap();
        writer.append(&[WalRecord::new(0), WalRecord::new(3)]).unwrap();
        writer.append(&[WalRecord::new(7)]).unwrap();
        writer.close().unwrap();

        let contents = WalReader::for_destination(&dest).unwrap().read_all().unwrap();
        assert_eq!(contents.header, Some(HEADER));
        let indices: Vec<usize> = contents.records.iter().map(|r| r.chunk_index).collect();
        assert_eq!(indices, vec![0, 3, 7]);
        assert_eq!(contents.completed_set(10).len(), 3);
        assert_eq!(contents.completed_set(5).iter().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn test_fault_tolerant_read() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("file.bin");
        fs::write(
            wal_path_for(&dest),
            "#10240,1024\n0,1700000000000\ngarbage\n\n2,17000\n5,",
        )
        .unwrap();

        let contents = WalReader::for_destination(&dest).unwrap().read_all().unwrap();
        assert_eq!(contents.header, Some(HEADER));
        let indices: Vec<usize> = contents.records.iter().map(|r| r.chunk_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_missing_header() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("file.bin");
        fs::write(wal_path_for(&dest), "0,1\n1,2\n").unwrap();

        let contents = WalReader::for_destination(&dest).unwrap().read_all().unwrap();
        assert!(contents.header.is_none());
        assert_eq!(contents.records.len(), 2);
    }

    #[test]
    fn test_create_truncates_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("file.bin");

        let mut writer = WalWriter::create(&dest, HEADER).unwrap();
        writer.append(&[WalRecord::new(1)]).unwrap();
        drop(writer);

        let header = WalHeader {
            total_size: 2048,
            chunk_size: 512,
        };
        drop(WalWriter::create(&dest, header).unwrap());
        let contents = WalReader::for_destination(&dest).unwrap().read_all().unwrap();
        assert_eq!(contents.header, Some(header));
        assert!(contents.records.is_empty());

        assert!(delete_wal_file(&dest).unwrap());
        assert!(!delete_wal_file(&dest).unwrap());
        assert!(WalReader::for_destination(&dest).is_none());
    }
}
