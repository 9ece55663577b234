use super::local::StagedFile;
use super::{Bucket, ObjectMeta, TransferOptions, CHUNK_SIZE, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::config::BucketConfig;
use crate::core::progress::TransferProgress;
use crate::error::BucketError;
use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::types::ObjectCannedAcl;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, services::S3, Metakey, Operator, Writer};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;

const DEFAULT_REGION: &str = "us-east-1";

/// 对象完整 key：opendal 的 root 前缀 + 相对 key
fn object_key(root: Option<&str>, key: &str) -> String {
    let key = key.trim_start_matches('/');
    match root.map(|r| r.trim_matches('/')).filter(|r| !r.is_empty()) {
        Some(root) => format!("{}/{}", root, key),
        None => key.to_string(),
    }
}

/// 未完成的分片上传在析构时中止（出错、超时、取消）
struct PendingWrite {
    writer: Option<Writer>,
}

impl PendingWrite {
    async fn run(&mut self, file: &mut tokio::fs::File, progress: &TransferProgress) -> Result<(), BucketError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        S3Bucket::pump(file, writer, progress).await?;
        writer.close().await?;
        self.writer = None;
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.abort().await;
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = writer.abort().await {
                        tracing::warn!("中止未完成的上传失败: {}", e);
                    }
                });
            }
        }
    }
}

pub struct S3Bucket {
    operator: Operator,
    /// 启用 SSE-S3 (AES256) 的同一 bucket
    encrypted: Operator,
    /// opendal 不支持 canned ACL，public-read 通过 SDK 的 PutObjectAcl 设置
    acl_client: aws_sdk_s3::Client,
    bucket: String,
    root: Option<String>,
    name: String,
}

impl S3Bucket {
    pub async fn new(config: &BucketConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;

        let operator = Self::build_operator(config, bucket, false)?;
        let encrypted = Self::build_operator(config, bucket, true)?;
        let acl_client = Self::build_acl_client(config).await;

        let name = format!(
            "s3://{}{}",
            bucket,
            config
                .root
                .as_deref()
                .map(|p| format!("/{}", p.trim_start_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self {
            operator,
            encrypted,
            acl_client,
            bucket: bucket.to_string(),
            root: config.root.clone(),
            name,
        })
    }

    async fn build_acl_client(config: &BucketConfig) -> aws_sdk_s3::Client {
        let region = Region::new(config.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string()));

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(ak), Some(sk)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(Credentials::new(ak, sk, None, None, "bucketsync-config")),
            // 与 opendal 一致：未配置密钥时使用环境变量 / 实例角色
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region.clone())
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };
        builder = builder.region(region);
        if let Some(ref ep) = config.endpoint {
            builder = builder.endpoint_url(ep).force_path_style(true);
        }

        aws_sdk_s3::Client::from_conf(builder.build())
    }

    /// 给已写入的对象设置 public-read
    async fn make_public(&self, key: &str) -> Result<(), BucketError> {
        let full_key = object_key(self.root.as_deref(), key);
        self.acl_client
            .put_object_acl()
            .bucket(&self.bucket)
            .key(&full_key)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| match e.code() {
                Some("AccessDenied") => BucketError::PermissionDenied(format!("PutObjectAcl {}", full_key)),
                _ => BucketError::Backend(format!("PutObjectAcl {}: {}", full_key, DisplayErrorContext(&e))),
            })?;
        tracing::debug!("已设置 public-read: {}", full_key);
        Ok(())
    }

    fn build_operator(config: &BucketConfig, bucket: &str, encrypt: bool) -> Result<Operator> {
        let mut builder = S3::default().bucket(bucket);

        if let Some(ref region) = config.region {
            builder = builder.region(region);
        }
        // 未配置密钥时使用环境变量 / 实例角色
        if let (Some(ak), Some(sk)) = (&config.access_key, &config.secret_key) {
            builder = builder.access_key_id(ak).secret_access_key(sk);
        }
        if let Some(ref ep) = config.endpoint {
            builder = builder.endpoint(ep);
        }
        if let Some(ref root) = config.root {
            builder = builder.root(root);
        }
        if config.anonymous {
            builder = builder.allow_anonymous();
        }
        if encrypt {
            builder = builder.server_side_encryption_with_s3_key();
        }

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        Ok(operator)
    }

    async fn pump(file: &mut tokio::fs::File, writer: &mut Writer, progress: &TransferProgress) -> Result<(), BucketError> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            writer.write(buf[..n].to_vec()).await?;
            progress.advance(n as u64);
        }
    }

    async fn fetch(&self, key: &str, len: u64, staged: &mut StagedFile, progress: &TransferProgress) -> Result<(), BucketError> {
        let mut offset = 0u64;
        while offset < len {
            let end = (offset + CHUNK_SIZE as u64).min(len);
            let data = self.operator.read_with(key).range(offset..end).await?;
            let chunk = data.to_vec();
            staged.write_chunk(&chunk).await?;
            progress.advance(chunk.len() as u64);
            offset = end;
        }
        Ok(())
    }
}

#[async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BucketError> {
        match self.operator.stat(key).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                content_length: meta.content_length(),
                etag: meta.etag().map(str::to_string),
            })),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError> {
        let mut objects = Vec::new();

        let mut lister = self
            .operator
            .lister_with(prefix)
            .recursive(true)
            .metakey(Metakey::ContentLength | Metakey::Etag | Metakey::Mode)
            .await?;

        while let Some(entry) = lister.try_next().await? {
            let meta = entry.metadata();
            // 跳过目录占位
            if meta.is_dir() {
                continue;
            }

            let key = entry.path().trim_start_matches('/');
            if key.is_empty() || !key.starts_with(prefix) {
                continue;
            }

            objects.push(ObjectMeta {
                key: key.to_string(),
                content_length: meta.content_length(),
                etag: meta.etag().map(str::to_string),
            });
        }

        Ok(objects)
    }

    async fn copy(&self, from: &str, to: &str, options: &TransferOptions) -> Result<(), BucketError> {
        self.operator.copy(from, to).await?;
        if options.public_read {
            self.make_public(to).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BucketError> {
        // S3 删除不存在的对象不会报错
        self.operator.delete(key).await?;
        Ok(())
    }

    async fn upload(
        &self,
        src: &Path,
        key: &str,
        options: &TransferOptions,
        progress: &TransferProgress,
    ) -> Result<(), BucketError> {
        let operator = if options.encrypt { &self.encrypted } else { &self.operator };

        let mut file = tokio::fs::File::open(src).await?;
        let mut pending = PendingWrite {
            writer: Some(operator.writer_with(key).chunk(CHUNK_SIZE).await?),
        };

        if let Err(e) = pending.run(&mut file, progress).await {
            pending.abort().await;
            return Err(e);
        }

        if options.public_read {
            self.make_public(key).await?;
        }
        Ok(())
    }

    async fn download(&self, key: &str, dest: &Path, progress: &TransferProgress) -> Result<(), BucketError> {
        let len = self.operator.stat(key).await?.content_length();

        let mut staged = StagedFile::create(dest).await?;
        match self.fetch(key, len, &mut staged, progress).await {
            Ok(()) => {
                staged.commit().await?;
                Ok(())
            }
            Err(e) => {
                staged.discard().await;
                Err(e)
            }
        }
    }
}
