use crate::core::fingerprint::{content_matches, probe_local, LocalEntry};
use crate::core::lister::{self, ChecksumListing};
use crate::core::outcome::{BatchReport, ItemOutcome, Operation, SkipReason};
use crate::core::progress::{SizeSource, TransferProgress};
use crate::error::{BucketError, SyncError, SyncResult};
use crate::storage::{split_bucket_uri, Bucket, TransferOptions, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// 元数据、复制、删除、列表操作超时（秒）
    pub op_timeout_secs: u64,
    /// 上传、下载无进度超时（秒），每次推进进度后重新计时
    pub io_timeout_secs: u64,
    /// 上传前查询目标对象出错时按"不存在"处理并直接上传
    pub upload_on_lookup_error: bool,
    /// 在 stdout 输出单个文件的字节进度
    pub show_progress: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            op_timeout_secs: OP_TIMEOUT_SECS,
            io_timeout_secs: IO_TIMEOUT_SECS,
            upload_on_lookup_error: false,
            show_progress: true,
        }
    }
}

/// 上传参数
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    pub make_public: bool,
    pub encrypt: bool,
}

/// 重命名参数
#[derive(Debug, Clone, Copy, Default)]
pub struct RenameOptions {
    /// 复制后保留源对象
    pub keep_original: bool,
    pub make_public: bool,
}

/// 同步引擎
///
/// 每个批量操作按顺序逐项处理，每个输入项在报告中恰好对应一条结果。
pub struct SyncEngine {
    bucket: Arc<dyn Bucket>,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self::with_config(bucket, SyncConfig::default())
    }

    pub fn with_config(bucket: Arc<dyn Bucket>, config: SyncConfig) -> Self {
        Self {
            bucket,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn bucket(&self) -> &Arc<dyn Bucket> {
        &self.bucket
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 取消进行中的批量操作，剩余项记为失败
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 为远程调用加上超时与取消
    async fn guarded<T, F>(&self, timeout_secs: u64, fut: F) -> Result<T, BucketError>
    where
        F: Future<Output = Result<T, BucketError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BucketError::Cancelled),
            res = tokio::time::timeout(Duration::from_secs(timeout_secs), fut) => {
                res.unwrap_or(Err(BucketError::Timeout(timeout_secs)))
            }
        }
    }

    /// 只响应取消，时限由后端自身的超时控制（如 opendal `TimeoutLayer`）
    async fn cancellable<T, F>(&self, fut: F) -> Result<T, BucketError>
    where
        F: Future<Output = Result<T, BucketError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BucketError::Cancelled),
            res = fut => res,
        }
    }

    /// 传输期间的空闲超时：`io_timeout_secs` 内没有任何进度才判定超时
    async fn guarded_transfer<F>(&self, progress: &TransferProgress, fut: F) -> Result<(), BucketError>
    where
        F: Future<Output = Result<(), BucketError>>,
    {
        let idle_limit = Duration::from_secs(self.config.io_timeout_secs);
        tokio::pin!(fut);

        loop {
            let wait = idle_limit.saturating_sub(progress.idle_for());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BucketError::Cancelled),
                res = &mut fut => return res,
                _ = tokio::time::sleep(wait) => {
                    if progress.idle_for() >= idle_limit {
                        return Err(BucketError::Timeout(self.config.io_timeout_secs));
                    }
                }
            }
        }
    }

    fn progress_for(&self, source: SizeSource<'_>) -> TransferProgress {
        if self.config.show_progress {
            TransferProgress::new(source, Box::new(std::io::stdout()))
        } else {
            TransferProgress::hidden(source.resolve())
        }
    }

    fn check_lengths(sources: usize, destinations: usize) -> SyncResult<()> {
        if sources != destinations {
            return Err(SyncError::LengthMismatch {
                sources,
                destinations,
            });
        }
        Ok(())
    }

    /// 当前句柄的 bucket 名称（`s3://bucket/root` 取 `bucket`）
    fn handle_bucket(&self) -> &str {
        let name = self.bucket.name();
        match split_bucket_uri(name) {
            (Some(bucket), _) => bucket,
            (None, _) => name,
        }
    }

    fn is_own_bucket(&self, bucket: &str) -> bool {
        bucket == self.handle_bucket()
    }

    /// 去掉 `s3://bucket/` 前缀，bucket 始终是当前句柄
    fn normalize<'a>(&self, key: &'a str) -> &'a str {
        let (bucket, key) = split_bucket_uri(key);
        if let Some(bucket) = bucket {
            if !self.is_own_bucket(bucket) {
                debug!("忽略路径中的 bucket {}，使用 {}", bucket, self.handle_bucket());
            }
        }
        key
    }

    fn log_batch_progress(done: usize, total: usize) {
        let percent = if total == 0 {
            100.0
        } else {
            done as f64 / total as f64 * 100.0
        };
        info!("完成 {}/{} ({:.2}%)", done, total, percent);
    }

    fn cancelled_outcome() -> ItemOutcome {
        ItemOutcome::Failed(BucketError::Cancelled.to_string())
    }

    fn lookup_failed(err: BucketError) -> ItemOutcome {
        match err {
            BucketError::Cancelled => Self::cancelled_outcome(),
            e => ItemOutcome::Failed(format!("lookup failed: {}", e)),
        }
    }

    /// 列出 `prefix` 下 key 包含 `filter` 的对象校验值
    pub async fn list_checksums(&self, prefix: &str, filter: &str) -> SyncResult<ChecksumListing> {
        let prefix = self.normalize(prefix);
        let listing = self
            .cancellable(lister::list_checksums(self.bucket.as_ref(), prefix, filter))
            .await?;
        Ok(listing)
    }

    /// 上传本地文件，远程对象已存在且校验值一致时跳过
    pub async fn upload_files<P, K>(
        &self,
        local_paths: &[P],
        remote_keys: &[K],
        options: UploadOptions,
    ) -> SyncResult<BatchReport>
    where
        P: AsRef<Path>,
        K: AsRef<str>,
    {
        Self::check_lengths(local_paths.len(), remote_keys.len())?;

        let total = local_paths.len();
        let transfer = TransferOptions {
            public_read: options.make_public,
            encrypt: options.encrypt,
        };
        let mut report = BatchReport::begin(Operation::Upload, self.bucket.name(), total);

        for (idx, (src, key)) in local_paths.iter().zip(remote_keys).enumerate() {
            let src = src.as_ref();
            let key = self.normalize(key.as_ref());

            let outcome = if self.is_cancelled() {
                Self::cancelled_outcome()
            } else {
                self.upload_one(src, key, &transfer).await
            };

            if let ItemOutcome::Failed(ref reason) = outcome {
                warn!("上传失败 {} -> {}: {}", src.display(), key, reason);
            }
            report.record(&src.display().to_string(), Some(key), outcome);
            Self::log_batch_progress(idx + 1, total);
        }

        Ok(report.finish())
    }

    async fn upload_one(&self, src: &Path, key: &str, options: &TransferOptions) -> ItemOutcome {
        match probe_local(src).await {
            Ok(LocalEntry::File { .. }) => {}
            Ok(LocalEntry::Directory) => {
                debug!("跳过目录: {}", src.display());
                return ItemOutcome::Skipped(SkipReason::SourceIsDirectory);
            }
            Ok(LocalEntry::Missing) => {
                return ItemOutcome::Failed(format!("local file not found: {}", src.display()));
            }
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        }

        info!("上传 {} 到 bucket {} 的 {}", src.display(), self.bucket.name(), key);

        match self.guarded(self.config.op_timeout_secs, self.bucket.head(key)).await {
            Ok(None) => {}
            Ok(Some(meta)) => match content_matches(src, &meta).await {
                Ok(true) => {
                    debug!("校验值一致，跳过: {}", key);
                    return ItemOutcome::Skipped(SkipReason::Unchanged);
                }
                Ok(false) => debug!("校验值不同，重新上传: {}", key),
                Err(e) => return ItemOutcome::Failed(format!("checksum failed: {}", e)),
            },
            Err(BucketError::Cancelled) => return Self::cancelled_outcome(),
            Err(e) if self.config.upload_on_lookup_error => {
                warn!("查询 {} 失败，按不存在处理并上传: {}", key, e);
            }
            Err(e) => return Self::lookup_failed(e),
        }

        let progress = self.progress_for(SizeSource::LocalFile(src));
        let result = self
            .guarded_transfer(&progress, self.bucket.upload(src, key, options, &progress))
            .await;
        if self.config.show_progress {
            progress.finish();
        }

        match result {
            Ok(()) => ItemOutcome::Success,
            Err(e) => ItemOutcome::Failed(e.to_string()),
        }
    }

    /// 下载对象到本地；本地文件校验值一致时跳过，目标为目录时跳过
    pub async fn download_files<K, P>(&self, remote_keys: &[K], local_paths: &[P]) -> SyncResult<BatchReport>
    where
        K: AsRef<str>,
        P: AsRef<Path>,
    {
        Self::check_lengths(remote_keys.len(), local_paths.len())?;

        let total = remote_keys.len();
        let mut report = BatchReport::begin(Operation::Download, self.bucket.name(), total);

        for (idx, (key, dest)) in remote_keys.iter().zip(local_paths).enumerate() {
            let key = self.normalize(key.as_ref());
            let dest = dest.as_ref();

            let outcome = if self.is_cancelled() {
                Self::cancelled_outcome()
            } else {
                self.download_one(key, dest).await
            };

            if let ItemOutcome::Failed(ref reason) = outcome {
                warn!("无法下载 {}: {}，跳过", key, reason);
            }
            report.record(key, Some(&dest.display().to_string()), outcome);
            Self::log_batch_progress(idx + 1, total);
        }

        Ok(report.finish())
    }

    async fn download_one(&self, key: &str, dest: &Path) -> ItemOutcome {
        let meta = match self.guarded(self.config.op_timeout_secs, self.bucket.head(key)).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                warn!("{} 在 bucket {} 中不存在，跳过", key, self.bucket.name());
                return ItemOutcome::Skipped(SkipReason::SourceMissing);
            }
            Err(e) => return Self::lookup_failed(e),
        };

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ItemOutcome::Failed(format!("cannot create {}: {}", parent.display(), e));
            }
        }

        match probe_local(dest).await {
            Ok(LocalEntry::Directory) => {
                debug!("目标是目录，跳过: {}", dest.display());
                return ItemOutcome::Skipped(SkipReason::DestinationIsDirectory);
            }
            Ok(LocalEntry::File { .. }) => match content_matches(dest, &meta).await {
                Ok(true) => {
                    info!("跳过 {}，已下载", key);
                    return ItemOutcome::Skipped(SkipReason::Unchanged);
                }
                Ok(false) => info!("覆盖 {}", dest.display()),
                Err(e) => return ItemOutcome::Failed(format!("checksum failed: {}", e)),
            },
            Ok(LocalEntry::Missing) => info!("下载 {} 到 {}", key, dest.display()),
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        }

        let progress = self.progress_for(SizeSource::RemoteObject(&meta));
        let result = self
            .guarded_transfer(&progress, self.bucket.download(key, dest, &progress))
            .await;
        if self.config.show_progress {
            progress.finish();
        }

        match result {
            Ok(()) => ItemOutcome::Success,
            Err(e) => ItemOutcome::Failed(e.to_string()),
        }
    }

    /// 通过 复制 + 删除 重命名对象
    ///
    /// 两步不是原子的：复制成功而删除失败时两个 key 同时存在。
    /// 再次执行同一批重命名是安全的，目标已存在的项会被跳过。
    pub async fn rename_keys<S, D>(
        &self,
        src_keys: &[S],
        dst_keys: &[D],
        options: RenameOptions,
    ) -> SyncResult<BatchReport>
    where
        S: AsRef<str>,
        D: AsRef<str>,
    {
        Self::check_lengths(src_keys.len(), dst_keys.len())?;

        let total = src_keys.len();
        let mut report = BatchReport::begin(Operation::Rename, self.bucket.name(), total);

        for (idx, (src, dst)) in src_keys.iter().zip(dst_keys).enumerate() {
            let src = self.normalize(src.as_ref());
            let dst = self.normalize(dst.as_ref());

            let outcome = if self.is_cancelled() {
                Self::cancelled_outcome()
            } else {
                self.rename_one(src, dst, &options).await
            };

            if let ItemOutcome::Failed(ref reason) = outcome {
                warn!("重命名失败 {} -> {}: {}", src, dst, reason);
            }
            report.record(src, Some(dst), outcome);
            Self::log_batch_progress(idx + 1, total);
        }

        Ok(report.finish())
    }

    async fn rename_one(&self, src: &str, dst: &str, options: &RenameOptions) -> ItemOutcome {
        let op_timeout = self.config.op_timeout_secs;

        match self.guarded(op_timeout, self.bucket.head(src)).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("源 {} 不存在，跳过", src);
                return ItemOutcome::Skipped(SkipReason::SourceMissing);
            }
            Err(e) => return Self::lookup_failed(e),
        }

        match self.guarded(op_timeout, self.bucket.head(dst)).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                info!("目标 {} 已存在，跳过", dst);
                return ItemOutcome::Skipped(SkipReason::DestinationExists);
            }
            Err(e) => return Self::lookup_failed(e),
        }

        info!("复制 {} 到 {}", src, dst);
        let copy_options = TransferOptions {
            public_read: options.make_public,
            encrypt: false,
        };
        if let Err(e) = self
            .guarded(op_timeout, self.bucket.copy(src, dst, &copy_options))
            .await
        {
            return ItemOutcome::Failed(format!("copy failed: {}", e));
        }

        if !options.keep_original {
            if let Err(e) = self.guarded(op_timeout, self.bucket.delete(src)).await {
                return ItemOutcome::Failed(format!(
                    "copied to {} but failed to delete source: {}",
                    dst, e
                ));
            }
        }

        ItemOutcome::Success
    }

    /// 逐个删除 key，单个失败不影响其余
    pub async fn delete_keys<K: AsRef<str>>(&self, keys: &[K]) -> BatchReport {
        let total = keys.len();
        let mut report = BatchReport::begin(Operation::Delete, self.bucket.name(), total);

        for (idx, key) in keys.iter().enumerate() {
            let key = self.normalize(key.as_ref());

            let outcome = if self.is_cancelled() {
                Self::cancelled_outcome()
            } else {
                info!("尝试从 {} 删除 {}", self.bucket.name(), key);
                match self
                    .guarded(self.config.op_timeout_secs, self.bucket.delete(key))
                    .await
                {
                    Ok(()) => ItemOutcome::Success,
                    Err(e) => {
                        warn!("无法删除 {}: {}", key, e);
                        ItemOutcome::Failed(e.to_string())
                    }
                }
            };

            report.record(key, None, outcome);
            Self::log_batch_progress(idx + 1, total);
        }

        report.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fingerprint::local_checksum;
    use crate::storage::local::StagedFile;
    use crate::storage::{MemoryBucket, ObjectMeta};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// 可注入故障并记录调用的 bucket
    struct FlakyBucket {
        inner: MemoryBucket,
        fail_head: HashSet<String>,
        fail_copy: HashSet<String>,
        fail_delete: HashSet<String>,
        fail_download: HashSet<String>,
        hang_head: bool,
        /// 上传时每 200ms 推进一次进度，持续 2s
        trickle_upload: bool,
        /// 下载写入一块后不再返回
        stall_download: bool,
        calls: Mutex<Vec<String>>,
    }

    impl Default for FlakyBucket {
        fn default() -> Self {
            Self {
                inner: MemoryBucket::new("flaky"),
                fail_head: HashSet::new(),
                fail_copy: HashSet::new(),
                fail_delete: HashSet::new(),
                fail_download: HashSet::new(),
                hang_head: false,
                trickle_upload: false,
                stall_download: false,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl FlakyBucket {
        fn call(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }

        fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .cloned()
                .collect()
        }
    }

    fn denied(what: &str) -> BucketError {
        BucketError::PermissionDenied(what.to_string())
    }

    #[async_trait]
    impl Bucket for FlakyBucket {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, BucketError> {
            self.call(format!("head {}", key));
            if self.hang_head {
                std::future::pending::<()>().await;
            }
            if self.fail_head.contains(key) {
                return Err(denied(key));
            }
            self.inner.head(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError> {
            self.inner.list(prefix).await
        }

        async fn copy(&self, from: &str, to: &str, options: &TransferOptions) -> Result<(), BucketError> {
            self.call(format!("copy {} {}", from, to));
            if self.fail_copy.contains(from) {
                return Err(denied(from));
            }
            self.inner.copy(from, to, options).await
        }

        async fn delete(&self, key: &str) -> Result<(), BucketError> {
            self.call(format!("delete {}", key));
            if self.fail_delete.contains(key) {
                return Err(denied(key));
            }
            self.inner.delete(key).await
        }

        async fn upload(
            &self,
            src: &Path,
            key: &str,
            options: &TransferOptions,
            progress: &TransferProgress,
        ) -> Result<(), BucketError> {
            self.call(format!("upload {}", key));
            if self.trickle_upload {
                for _ in 0..10 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    progress.advance(1);
                }
            }
            self.inner.upload(src, key, options, progress).await
        }

        async fn download(&self, key: &str, dest: &Path, progress: &TransferProgress) -> Result<(), BucketError> {
            self.call(format!("download {}", key));
            if self.fail_download.contains(key) {
                return Err(BucketError::Backend("connection reset".to_string()));
            }
            if self.stall_download {
                let mut staged = StagedFile::create(dest).await?;
                staged.write_chunk(b"partial").await?;
                progress.advance(7);
                std::future::pending::<()>().await;
            }
            self.inner.download(key, dest, progress).await
        }
    }

    fn quiet() -> SyncConfig {
        SyncConfig {
            show_progress: false,
            ..Default::default()
        }
    }

    fn engine(bucket: Arc<FlakyBucket>) -> SyncEngine {
        SyncEngine::with_config(bucket, quiet())
    }

    fn set(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    async fn etag(bucket: &FlakyBucket, key: &str) -> Option<String> {
        bucket.inner.object(key).await.map(|o| o.etag.trim_matches('"').to_string())
    }

    // ============ upload ============

    #[tokio::test]
    async fn test_upload_new_object() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"some content").unwrap();

        let bucket = Arc::new(FlakyBucket::default());
        let report = engine(bucket.clone())
            .upload_files(&[&src], &["data/a.txt"], UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Success));
        assert_eq!(etag(&bucket, "data/a.txt").await, Some(local_checksum(&src).await.unwrap()));
    }

    #[tokio::test]
    async fn test_upload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"same").unwrap();

        let bucket = Arc::new(FlakyBucket::default());
        let engine = engine(bucket.clone());

        let first = engine.upload_files(&[&src], &["a.txt"], UploadOptions::default()).await.unwrap();
        let second = engine.upload_files(&[&src], &["a.txt"], UploadOptions::default()).await.unwrap();

        assert_eq!(first.outcome(0), Some(&ItemOutcome::Success));
        assert_eq!(second.outcome(0), Some(&ItemOutcome::Skipped(SkipReason::Unchanged)));
        assert_eq!(bucket.calls_starting_with("upload").len(), 1);
    }

    #[tokio::test]
    async fn test_upload_replaces_changed_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"new").unwrap();

        let bucket = Arc::new(FlakyBucket::default());
        bucket.inner.put("a.txt", "old").await;

        let report = engine(bucket.clone())
            .upload_files(&[&src], &["a.txt"], UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Success));
        assert_eq!(bucket.inner.object("a.txt").await.unwrap().data, b"new");
    }

    #[tokio::test]
    async fn test_upload_length_mismatch_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<_> = (0..3)
            .map(|i| {
                let p = dir.path().join(format!("{}.txt", i));
                std::fs::write(&p, b"x").unwrap();
                p
            })
            .collect();

        let bucket = Arc::new(FlakyBucket::default());
        let err = engine(bucket.clone())
            .upload_files(&paths, &["a", "b"], UploadOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::LengthMismatch { sources: 3, destinations: 2 }));
        assert!(bucket.calls.lock().unwrap().is_empty());
        assert!(bucket.inner.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_upload_strips_bucket_uri() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"x").unwrap();

        let bucket = Arc::new(FlakyBucket::default());
        let report = engine(bucket.clone())
            .upload_files(&[&src], &["s3://some-bucket/data/a.txt"], UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(report.items[0].destination.as_deref(), Some("data/a.txt"));
        assert!(bucket.inner.contains("data/a.txt").await);
    }

    #[tokio::test]
    async fn test_upload_skips_directory_and_fails_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        let good = dir.path().join("good.txt");
        std::fs::write(&good, b"ok").unwrap();

        let bucket = Arc::new(FlakyBucket::default());
        let report = engine(bucket.clone())
            .upload_files(
                &[dir.path(), missing.as_path(), good.as_path()],
                &["d", "m", "g"],
                UploadOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(report.len(), 3);
        assert_eq!(report.outcome(0), Some(&ItemOutcome::Skipped(SkipReason::SourceIsDirectory)));
        assert!(report.outcome(1).unwrap().is_failed());
        assert_eq!(report.outcome(2), Some(&ItemOutcome::Success));
        assert_eq!(bucket.inner.keys().await, vec!["g"]);
    }

    #[tokio::test]
    async fn test_upload_lookup_error_is_reported_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"x").unwrap();

        let bucket = Arc::new(FlakyBucket {
            fail_head: set(&["a.txt"]),
            ..Default::default()
        });
        let report = engine(bucket.clone())
            .upload_files(&[&src], &["a.txt"], UploadOptions::default())
            .await
            .unwrap();

        match report.outcome(0) {
            Some(ItemOutcome::Failed(reason)) => assert!(reason.contains("lookup failed")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(bucket.calls_starting_with("upload").is_empty());
    }

    #[tokio::test]
    async fn test_upload_lookup_error_uploads_when_configured() {
        // 查询失败一律当作不存在：会掩盖权限/网络问题
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"x").unwrap();

        let bucket = Arc::new(FlakyBucket {
            fail_head: set(&["a.txt"]),
            ..Default::default()
        });
        let config = SyncConfig {
            upload_on_lookup_error: true,
            ..quiet()
        };
        let report = SyncEngine::with_config(bucket.clone(), config)
            .upload_files(&[&src], &["a.txt"], UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Success));
        assert!(bucket.inner.contains("a.txt").await);
    }

    #[tokio::test]
    async fn test_upload_passes_acl_and_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"x").unwrap();

        let bucket = Arc::new(FlakyBucket::default());
        engine(bucket.clone())
            .upload_files(
                &[&src],
                &["a.txt"],
                UploadOptions {
                    make_public: true,
                    encrypt: true,
                },
            )
            .await
            .unwrap();

        let object = bucket.inner.object("a.txt").await.unwrap();
        assert_eq!(object.acl, Some("public-read"));
        assert_eq!(object.server_side_encryption, Some("AES256"));
    }

    // ============ download ============

    #[tokio::test]
    async fn test_download_missing_source_continues() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = Arc::new(FlakyBucket::default());
        bucket.inner.put("present", "data").await;

        let dest_missing = dir.path().join("a");
        let dest_present = dir.path().join("nested/deeper/b");
        let report = engine(bucket.clone())
            .download_files(&["absent", "present"], &[&dest_missing, &dest_present])
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Skipped(SkipReason::SourceMissing)));
        assert_eq!(report.outcome(1), Some(&ItemOutcome::Success));
        assert!(!dest_missing.exists());
        assert_eq!(std::fs::read(&dest_present).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_download_skips_directory_destination() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();

        let bucket = Arc::new(FlakyBucket::default());
        bucket.inner.put("k", "data").await;

        let report = engine(bucket.clone())
            .download_files(&["k"], &[&target])
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Skipped(SkipReason::DestinationIsDirectory)));
        assert!(bucket.calls_starting_with("download").is_empty());
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn test_download_compares_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let same = dir.path().join("same");
        let stale = dir.path().join("stale");
        std::fs::write(&same, b"one").unwrap();
        std::fs::write(&stale, b"old").unwrap();

        let bucket = Arc::new(FlakyBucket::default());
        bucket.inner.put("same", "one").await;
        bucket.inner.put("stale", "fresh").await;

        let report = engine(bucket.clone())
            .download_files(&["same", "stale"], &[&same, &stale])
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Skipped(SkipReason::Unchanged)));
        assert_eq!(report.outcome(1), Some(&ItemOutcome::Success));
        assert_eq!(std::fs::read(&stale).unwrap(), b"fresh");
        assert_eq!(bucket.calls_starting_with("download"), vec!["download stale"]);
    }

    #[tokio::test]
    async fn test_download_failure_is_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("a");
        std::fs::write(&existing, b"local").unwrap();

        let bucket = Arc::new(FlakyBucket {
            fail_download: set(&["a"]),
            ..Default::default()
        });
        bucket.inner.put("a", "remote").await;
        bucket.inner.put("b", "remote b").await;

        let dest_b = dir.path().join("b");
        let report = engine(bucket.clone())
            .download_files(&["a", "b"], &[&existing, &dest_b])
            .await
            .unwrap();

        assert!(report.outcome(0).unwrap().is_failed());
        assert_eq!(report.outcome(1), Some(&ItemOutcome::Success));
        // 失败的覆盖不会破坏原文件
        assert_eq!(std::fs::read(&existing).unwrap(), b"local");
    }

    #[tokio::test]
    async fn test_download_length_mismatch() {
        let bucket = Arc::new(FlakyBucket::default());
        let err = engine(bucket.clone())
            .download_files(&["a", "b", "c"], &["x", "y"])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LengthMismatch { sources: 3, destinations: 2 }));
        assert!(bucket.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_transfer_with_progress_outlives_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"slow").unwrap();

        let bucket = Arc::new(FlakyBucket {
            trickle_upload: true,
            ..Default::default()
        });
        let config = SyncConfig {
            io_timeout_secs: 1,
            ..quiet()
        };
        let report = SyncEngine::with_config(bucket.clone(), config)
            .upload_files(&[&src], &["a.txt"], UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Success));
        assert!(bucket.inner.contains("a.txt").await);
    }

    #[tokio::test]
    async fn test_stalled_download_times_out_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = Arc::new(FlakyBucket {
            stall_download: true,
            ..Default::default()
        });
        bucket.inner.put("a", "remote").await;

        let config = SyncConfig {
            io_timeout_secs: 1,
            ..quiet()
        };
        let dest = dir.path().join("a");
        let report = SyncEngine::with_config(bucket, config)
            .download_files(&["a"], &[&dest])
            .await
            .unwrap();

        match report.outcome(0) {
            Some(ItemOutcome::Failed(reason)) => assert!(reason.contains("timed out")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    // ============ rename ============

    #[tokio::test]
    async fn test_rename_moves_object() {
        let bucket = Arc::new(FlakyBucket::default());
        bucket.inner.put("old/a", "payload").await;
        let before = etag(&bucket, "old/a").await;

        let report = engine(bucket.clone())
            .rename_keys(&["old/a"], &["new/a"], RenameOptions::default())
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Success));
        assert!(!bucket.inner.contains("old/a").await);
        assert_eq!(etag(&bucket, "new/a").await, before);
    }

    #[tokio::test]
    async fn test_rename_keep_original() {
        let bucket = Arc::new(FlakyBucket::default());
        bucket.inner.put("old/a", "payload").await;

        let report = engine(bucket.clone())
            .rename_keys(
                &["old/a"],
                &["new/a"],
                RenameOptions {
                    keep_original: true,
                    make_public: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Success));
        assert!(bucket.inner.contains("old/a").await);
        assert_eq!(bucket.inner.object("new/a").await.unwrap().acl, Some("public-read"));
    }

    #[tokio::test]
    async fn test_rename_never_overwrites() {
        let bucket = Arc::new(FlakyBucket::default());
        bucket.inner.put("old/a", "source").await;
        bucket.inner.put("new/a", "existing").await;

        let report = engine(bucket.clone())
            .rename_keys(&["old/a"], &["new/a"], RenameOptions::default())
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Skipped(SkipReason::DestinationExists)));
        assert!(bucket.calls_starting_with("copy").is_empty());
        assert!(bucket.calls_starting_with("delete").is_empty());
        assert_eq!(bucket.inner.object("old/a").await.unwrap().data, b"source");
        assert_eq!(bucket.inner.object("new/a").await.unwrap().data, b"existing");
    }

    #[tokio::test]
    async fn test_rename_missing_source_is_skipped() {
        let bucket = Arc::new(FlakyBucket::default());
        bucket.inner.put("b", "x").await;

        let report = engine(bucket.clone())
            .rename_keys(&["a", "b"], &["a2", "b2"], RenameOptions::default())
            .await
            .unwrap();

        assert_eq!(report.outcome(0), Some(&ItemOutcome::Skipped(SkipReason::SourceMissing)));
        assert_eq!(report.outcome(1), Some(&ItemOutcome::Success));
        assert_eq!(bucket.inner.keys().await, vec!["b2"]);
    }

    #[tokio::test]
    async fn test_interrupted_rename_can_be_rerun() {
        let bucket = Arc::new(FlakyBucket {
            fail_delete: set(&["old/a"]),
            ..Default::default()
        });
        bucket.inner.put("old/a", "payload").await;
        let engine = engine(bucket.clone());

        let first = engine
            .rename_keys(&["old/a"], &["new/a"], RenameOptions::default())
            .await
            .unwrap();
        match first.outcome(0) {
            Some(ItemOutcome::Failed(reason)) => assert!(reason.contains("failed to delete source")),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(bucket.inner.contains("old/a").await);
        assert!(bucket.inner.contains("new/a").await);

        let second = engine
            .rename_keys(&["old/a"], &["new/a"], RenameOptions::default())
            .await
            .unwrap();
        assert_eq!(second.outcome(0), Some(&ItemOutcome::Skipped(SkipReason::DestinationExists)));
        assert_eq!(bucket.calls_starting_with("copy").len(), 1);
    }

    #[tokio::test]
    async fn test_rename_copy_failure() {
        let bucket = Arc::new(FlakyBucket {
            fail_copy: set(&["a"]),
            ..Default::default()
        });
        bucket.inner.put("a", "x").await;

        let report = engine(bucket.clone())
            .rename_keys(&["a"], &["b"], RenameOptions::default())
            .await
            .unwrap();

        assert!(report.outcome(0).unwrap().is_failed());
        assert!(bucket.inner.contains("a").await);
        assert!(!bucket.inner.contains("b").await);
        assert!(bucket.calls_starting_with("delete").is_empty());
    }

    #[tokio::test]
    async fn test_rename_length_mismatch_does_nothing() {
        let bucket = Arc::new(FlakyBucket::default());
        for key in ["a", "b", "c"] {
            bucket.inner.put(key, key).await;
        }

        let err = engine(bucket.clone())
            .rename_keys(&["a", "b", "c"], &["x", "y"], RenameOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::LengthMismatch { sources: 3, destinations: 2 }));
        assert!(bucket.calls.lock().unwrap().is_empty());
        assert_eq!(bucket.inner.keys().await, vec!["a", "b", "c"]);
    }

    // ============ delete ============

    #[tokio::test]
    async fn test_delete_continues_past_failure() {
        let keys = ["k1", "k2", "k3", "k4", "k5"];
        let bucket = Arc::new(FlakyBucket {
            fail_delete: set(&["k2"]),
            ..Default::default()
        });
        for key in keys {
            bucket.inner.put(key, key).await;
        }

        let report = engine(bucket.clone()).delete_keys(&keys).await;

        assert_eq!(report.len(), 5);
        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.failed(), 1);
        assert!(report.outcome(1).unwrap().is_failed());
        assert_eq!(bucket.inner.keys().await, vec!["k2"]);
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_not_an_error() {
        let bucket = Arc::new(FlakyBucket::default());
        let report = engine(bucket).delete_keys(&["nothing-here"]).await;
        assert_eq!(report.outcome(0), Some(&ItemOutcome::Success));
    }

    // ============ batch invariants ============

    #[tokio::test]
    async fn test_every_pair_gets_one_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = Arc::new(FlakyBucket {
            fail_head: set(&["k3"]),
            ..Default::default()
        });

        let mut paths = Vec::new();
        let mut keys = Vec::new();
        for i in 0..6 {
            let p = dir.path().join(format!("f{}", i));
            std::fs::write(&p, format!("content {}", i)).unwrap();
            paths.push(p);
            keys.push(format!("k{}", i));
        }
        bucket.inner.put("k1", "content 1").await;

        let report = engine(bucket.clone())
            .upload_files(&paths, &keys, UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(report.len(), 6);
        assert_eq!(report.succeeded() + report.skipped() + report.failed(), 6);
        assert_eq!((report.succeeded(), report.skipped(), report.failed()), (4, 1, 1));
        for (i, item) in report.items.iter().enumerate() {
            assert_eq!(item.index, i);
        }
    }

    #[tokio::test]
    async fn test_cancel_fails_remaining_items() {
        let bucket = Arc::new(FlakyBucket {
            hang_head: true,
            ..Default::default()
        });
        let engine = Arc::new(engine(bucket));

        let token = engine.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let report = engine
            .rename_keys(&["a", "b", "c"], &["x", "y", "z"], RenameOptions::default())
            .await
            .unwrap();

        assert_eq!(report.len(), 3);
        assert_eq!(report.failed(), 3);
        for item in &report.items {
            assert_eq!(item.outcome, ItemOutcome::Failed("operation cancelled".to_string()));
        }
    }

    #[tokio::test]
    async fn test_remote_call_timeout() {
        let bucket = Arc::new(FlakyBucket {
            hang_head: true,
            ..Default::default()
        });
        let config = SyncConfig {
            op_timeout_secs: 1,
            ..quiet()
        };
        let report = SyncEngine::with_config(bucket, config)
            .download_files(&["a"], &["/nonexistent/a"])
            .await
            .unwrap();

        match report.outcome(0) {
            Some(ItemOutcome::Failed(reason)) => assert!(reason.contains("timed out")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_bucket_uri_must_match_exactly() {
        let engine = SyncEngine::new(Arc::new(MemoryBucket::new("mybucket")));
        assert!(engine.is_own_bucket("mybucket"));
        assert!(!engine.is_own_bucket("b"));
        assert!(!engine.is_own_bucket("my"));
        assert_eq!(engine.normalize("s3://b/x"), "x");
    }

    #[tokio::test]
    async fn test_list_checksums_through_engine() {
        let bucket = Arc::new(FlakyBucket::default());
        bucket.inner.put("data/a", "1").await;
        bucket.inner.put("data/b", "2").await;
        bucket.inner.put("other", "3").await;

        let listing = engine(bucket)
            .list_checksums("s3://flaky/data/", "")
            .await
            .unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing.get("data/b"), Some(format!("{:x}", md5::compute("2")).as_str()));
    }
}
