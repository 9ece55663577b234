use super::local::{read_with_progress, StagedFile};
use super::{Bucket, ObjectMeta, TransferOptions, CHUNK_SIZE};
use crate::core::progress::TransferProgress;
use crate::error::BucketError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;

/// 内存中保存的对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    /// 与 S3 一致，带引号的 MD5
    pub etag: String,
    pub acl: Option<&'static str>,
    pub server_side_encryption: Option<&'static str>,
}

impl StoredObject {
    fn new(data: Vec<u8>, options: &TransferOptions) -> Self {
        let etag = format!("\"{:x}\"", md5::compute(&data));
        Self {
            data,
            etag,
            acl: options.acl(),
            server_side_encryption: options.server_side_encryption(),
        }
    }

    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            content_length: self.data.len() as u64,
            etag: Some(self.etag.clone()),
        }
    }
}

/// 进程内 bucket，按 key 字典序列出
pub struct MemoryBucket {
    name: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryBucket {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// 直接写入对象
    pub async fn put(&self, key: &str, data: impl Into<Vec<u8>>) {
        let object = StoredObject::new(data.into(), &TransferOptions::default());
        self.objects.write().await.insert(key.to_string(), object);
    }

    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BucketError> {
        Ok(self.objects.read().await.get(key).map(|o| o.meta(key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| object.meta(key))
            .collect())
    }

    async fn copy(&self, from: &str, to: &str, options: &TransferOptions) -> Result<(), BucketError> {
        let mut objects = self.objects.write().await;
        let source = objects
            .get(from)
            .ok_or_else(|| BucketError::Backend(format!("NoSuchKey: {}", from)))?;
        let copied = StoredObject {
            acl: options.acl(),
            ..source.clone()
        };
        objects.insert(to.to_string(), copied);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BucketError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn upload(
        &self,
        src: &Path,
        key: &str,
        options: &TransferOptions,
        progress: &TransferProgress,
    ) -> Result<(), BucketError> {
        let data = read_with_progress(src, progress).await?;
        let object = StoredObject::new(data, options);
        self.objects.write().await.insert(key.to_string(), object);
        Ok(())
    }

    async fn download(&self, key: &str, dest: &Path, progress: &TransferProgress) -> Result<(), BucketError> {
        let data = self
            .object(key)
            .await
            .ok_or_else(|| BucketError::Backend(format!("NoSuchKey: {}", key)))?
            .data;

        let mut staged = StagedFile::create(dest).await?;
        for chunk in data.chunks(CHUNK_SIZE) {
            if let Err(e) = staged.write_chunk(chunk).await {
                staged.discard().await;
                return Err(e.into());
            }
            progress.advance(chunk.len() as u64);
        }
        staged.commit().await?;
        Ok(())
    }
}
