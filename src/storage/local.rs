use super::{Bucket, ObjectMeta, TransferOptions, CHUNK_SIZE};
use crate::core::fingerprint::local_checksum;
use crate::core::progress::TransferProgress;
use crate::error::BucketError;
use anyhow::Result;
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use walkdir::WalkDir;

/// 先写入同目录下的临时文件，完成后原子重命名
///
/// 未提交就被丢弃时（出错、超时、取消）删除临时文件。
pub(crate) struct StagedFile {
    temp_path: PathBuf,
    dest_path: PathBuf,
    file: Option<fs::File>,
    committed: bool,
}

impl StagedFile {
    pub async fn create(dest: &Path) -> io::Result<Self> {
        let file_name = dest
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?
            .to_string_lossy();
        let temp_path = dest.with_file_name(format!(".{}.part", file_name));
        let file = fs::File::create(&temp_path).await?;
        Ok(Self {
            temp_path,
            dest_path: dest.to_path_buf(),
            file: Some(file),
            committed: false,
        })
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data).await,
            None => Err(io::Error::new(io::ErrorKind::Other, "staged file already closed")),
        }
    }

    pub async fn commit(mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        fs::rename(&self.temp_path, &self.dest_path).await?;
        self.committed = true;
        Ok(())
    }

    pub async fn discard(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.temp_path).await;
        self.committed = true;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// 分块读取本地文件，每块推进一次进度
pub(crate) async fn read_with_progress(path: &Path, progress: &TransferProgress) -> io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    let mut data = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        progress.advance(n as u64);
    }

    Ok(data)
}

/// 分块复制本地文件到目标路径（经由临时文件）
pub(crate) async fn copy_with_progress(src: &Path, dest: &Path, progress: &TransferProgress) -> io::Result<()> {
    let mut reader = fs::File::open(src).await?;
    let mut staged = StagedFile::create(dest).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                staged.discard().await;
                return Err(e);
            }
        };
        if n == 0 {
            break;
        }
        if let Err(e) = staged.write_chunk(&buf[..n]).await {
            staged.discard().await;
            return Err(e);
        }
        progress.advance(n as u64);
    }

    staged.commit().await
}

/// 以本地目录模拟 bucket，key 对应目录下的相对路径
pub struct LocalBucket {
    base_path: PathBuf,
    name: String,
}

impl LocalBucket {
    pub fn new(path: &str) -> Result<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    /// key 转为根目录下的路径，拒绝 `..` 等越出根目录的组成部分
    fn resolve_path(&self, key: &str) -> Result<PathBuf, BucketError> {
        let mut path = self.base_path.clone();
        for component in Path::new(&Self::normalize_path(key)).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(BucketError::InvalidKey(key.to_string()));
                }
            }
        }
        Ok(path)
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/")
    }

    async fn ensure_parent(path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) => fs::create_dir_all(parent).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BucketError> {
        let full_path = self.resolve_path(key)?;

        match fs::metadata(&full_path).await {
            // 目录不是对象
            Ok(metadata) if metadata.is_dir() => Ok(None),
            Ok(metadata) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                content_length: metadata.len(),
                etag: Some(local_checksum(&full_path).await?),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }

        let base_path = self.base_path.clone();
        let prefix = prefix.to_string();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let entries = tokio::task::spawn_blocking(move || -> io::Result<Vec<(String, PathBuf, u64)>> {
            let mut entries = Vec::new();
            for entry in WalkDir::new(&base_path)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(relative) = entry
                    .path()
                    .strip_prefix(&base_path)
                    .ok()
                    .and_then(|p| p.to_str())
                else {
                    continue;
                };
                let key = Self::normalize_path(relative);
                // 跳过未完成的下载
                if key.rsplit('/').next().is_some_and(|n| n.starts_with('.') && n.ends_with(".part")) {
                    continue;
                }
                if !key.starts_with(&prefix) {
                    continue;
                }
                let size = entry.metadata().map_err(io::Error::from)?.len();
                entries.push((key, entry.into_path(), size));
            }
            Ok(entries)
        })
        .await
        .map_err(|e| BucketError::Backend(e.to_string()))??;

        let mut objects = Vec::with_capacity(entries.len());
        for (key, path, size) in entries {
            objects.push(ObjectMeta {
                key,
                content_length: size,
                etag: Some(local_checksum(&path).await?),
            });
        }
        Ok(objects)
    }

    async fn copy(&self, from: &str, to: &str, options: &TransferOptions) -> Result<(), BucketError> {
        if options.public_read {
            tracing::debug!("本地 bucket 忽略 ACL: {}", to);
        }
        let src = self.resolve_path(from)?;
        let dest = self.resolve_path(to)?;
        Self::ensure_parent(&dest).await?;
        fs::copy(&src, &dest).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BucketError> {
        let full_path = self.resolve_path(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload(
        &self,
        src: &Path,
        key: &str,
        options: &TransferOptions,
        progress: &TransferProgress,
    ) -> Result<(), BucketError> {
        if options.public_read || options.encrypt {
            tracing::debug!("本地 bucket 忽略 ACL/加密参数: {}", key);
        }
        let dest = self.resolve_path(key)?;
        Self::ensure_parent(&dest).await?;
        copy_with_progress(src, &dest, progress).await?;
        Ok(())
    }

    async fn download(&self, key: &str, dest: &Path, progress: &TransferProgress) -> Result<(), BucketError> {
        let src = self.resolve_path(key)?;
        copy_with_progress(&src, dest, progress).await?;
        Ok(())
    }
}
