//! 内容指纹：本地 MD5 与远程 ETag 比较
//!
//! 分片上传产生的 ETag（`<hex>-<n>`）不等于整文件 MD5，这类对象总会被重新传输。

use crate::storage::{ObjectMeta, CHUNK_SIZE};
use std::io;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncReadExt;

/// 本地路径状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEntry {
    Missing,
    /// 存在但不可传输
    Directory,
    File { size: u64 },
}

pub async fn probe_local(path: &Path) -> io::Result<LocalEntry> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(LocalEntry::Directory),
        Ok(meta) => Ok(LocalEntry::File { size: meta.len() }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LocalEntry::Missing),
        Err(e) => Err(e),
    }
}

/// 计算本地文件的 MD5（小写十六进制）
pub async fn local_checksum(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; CHUNK_SIZE.min(1024 * 1024)];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }

    Ok(format!("{:x}", ctx.compute()))
}

/// 存储端报告的校验值，去掉引号
pub fn remote_checksum(meta: &ObjectMeta) -> Option<String> {
    meta.etag
        .as_deref()
        .map(|s| s.trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
}

/// 本地文件内容是否与远程对象一致
pub async fn content_matches(path: &Path, meta: &ObjectMeta) -> io::Result<bool> {
    let Some(remote) = remote_checksum(meta) else {
        return Ok(false);
    };
    let local = local_checksum(path).await?;
    Ok(local == remote)
}
