//! 断点续传持久化
//!
//! 每个任务在目标文件旁维护一个分片 WAL，只有 fsync 之后的分片才会被记录，
//! 因此 WAL 中出现的字节范围一定已经完整落盘。任务完成后删除 WAL。

pub mod wal;

pub use wal::{
    delete_wal_file, wal_path_for, WalContents, WalHeader, WalReader, WalRecord, WalWriter,
};
