pub mod local;
pub mod memory;
pub mod s3;

use crate::config::{BucketConfig, StorageType};
use crate::core::progress::TransferProgress;
use crate::error::BucketError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use local::LocalBucket;
pub use memory::MemoryBucket;
pub use s3::S3Bucket;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- head, copy, delete, list 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- upload, download
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 分块传输大小
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// 公开读 ACL
pub const ACL_PUBLIC_READ: &str = "public-read";
/// 服务端加密标记
pub const SSE_AES256: &str = "AES256";

/// 远程对象元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub key: String,
    pub content_length: u64,
    /// 存储端报告的校验值，可能带引号
    pub etag: Option<String>,
}

/// 传输附加参数，原样交给存储端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub public_read: bool,
    pub encrypt: bool,
}

impl TransferOptions {
    pub fn acl(&self) -> Option<&'static str> {
        self.public_read.then_some(ACL_PUBLIC_READ)
    }

    pub fn server_side_encryption(&self) -> Option<&'static str> {
        self.encrypt.then_some(SSE_AES256)
    }
}

/// 单个 bucket 的访问句柄
#[async_trait]
pub trait Bucket: Send + Sync {
    /// bucket 名称（用于日志）
    fn name(&self) -> &str;

    /// 获取对象元数据，不存在时返回 `Ok(None)`
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BucketError>;

    /// 列出 key 以 `prefix` 开头的所有对象，保持存储端的返回顺序
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError>;

    /// 服务端复制
    async fn copy(&self, from: &str, to: &str, options: &TransferOptions)
        -> Result<(), BucketError>;

    /// 删除对象，对象不存在时由存储端决定是否报错
    async fn delete(&self, key: &str) -> Result<(), BucketError>;

    /// 上传本地文件
    async fn upload(
        &self,
        src: &Path,
        key: &str,
        options: &TransferOptions,
        progress: &TransferProgress,
    ) -> Result<(), BucketError>;

    /// 下载对象到本地路径
    async fn download(
        &self,
        key: &str,
        dest: &Path,
        progress: &TransferProgress,
    ) -> Result<(), BucketError>;
}

/// 拆分 `s3://bucket/key` 形式的路径，返回 (bucket, key)
pub fn split_bucket_uri(path: &str) -> (Option<&str>, &str) {
    const SCHEME: &str = "s3://";
    let has_scheme = path
        .get(..SCHEME.len())
        .is_some_and(|s| s.eq_ignore_ascii_case(SCHEME));
    if !has_scheme {
        return (None, path);
    }

    let rest = &path[SCHEME.len()..];
    match rest.split_once('/') {
        Some((bucket, key)) => (Some(bucket), key.trim_start_matches('/')),
        None => (Some(rest), ""),
    }
}

/// 去掉 `s3://bucket/` 前缀，bucket 由调用上下文决定
pub fn normalize_key(path: &str) -> &str {
    split_bucket_uri(path).1
}

/// 根据配置创建 bucket 句柄
pub async fn create_bucket(config: &BucketConfig) -> Result<Arc<dyn Bucket>> {
    match config.typ {
        StorageType::S3 => {
            let bucket = config
                .bucket
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
            tracing::info!(
                "连接 S3 bucket: {} (region={:?}, endpoint={:?})",
                bucket,
                config.region,
                config.endpoint
            );
            Ok(Arc::new(S3Bucket::new(config).await?) as Arc<dyn Bucket>)
        }
        StorageType::Local => {
            let root = config
                .root
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Local storage requires root"))?;
            tracing::info!("初始化本地 bucket: {}", root);
            Ok(Arc::new(LocalBucket::new(root)?) as Arc<dyn Bucket>)
        }
        StorageType::Memory => {
            let name = config.bucket.as_deref().unwrap_or("memory");
            tracing::info!("初始化内存 bucket: {}", name);
            Ok(Arc::new(MemoryBucket::new(name)) as Arc<dyn Bucket>)
        }
    }
}
