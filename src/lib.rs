use std::path::PathBuf;
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{AppConfig, BucketConfig, StorageType};
pub use core::{
    BatchReport, ChecksumListing, ItemOutcome, RenameOptions, SkipReason, SyncConfig, SyncEngine,
    UploadOptions,
};
pub use error::{BucketError, SyncError, SyncResult};
pub use storage::Bucket;

/// 应用状态：已加载的配置和绑定到 bucket 的同步引擎
pub struct AppState {
    pub config: AppConfig,
    pub config_file: PathBuf,
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    /// 读取配置并连接 bucket
    pub async fn new(config: AppConfig, config_file: PathBuf) -> anyhow::Result<Self> {
        let bucket = storage::create_bucket(&config.bucket).await?;
        let engine = Arc::new(SyncEngine::with_config(bucket, config.sync.clone()));

        tracing::debug!("同步引擎已就绪: bucket={}", engine.bucket().name());

        Ok(Self {
            config,
            config_file,
            engine,
        })
    }

    /// 配置文件路径：命令行指定优先，否则使用系统配置目录
    pub fn resolve_config_file(explicit: Option<PathBuf>) -> PathBuf {
        explicit.unwrap_or_else(config::default_config_file)
    }

    /// 取消所有进行中的操作
    pub fn cleanup(&self) {
        tracing::info!("正在取消进行中的操作...");
        self.engine.cancel();
    }
}
