//! 错误类型

use thiserror::Error;

/// 存储端操作错误
///
/// "对象不存在" 不是错误，由 [`crate::storage::Bucket::head`] 以 `Ok(None)` 表示。
#[derive(Debug, Error)]
pub enum BucketError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation timed out after {0}s")]
    Timeout(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<opendal::Error> for BucketError {
    fn from(err: opendal::Error) -> Self {
        match err.kind() {
            opendal::ErrorKind::PermissionDenied => BucketError::PermissionDenied(err.to_string()),
            _ => BucketError::Backend(err.to_string()),
        }
    }
}

/// 批量操作错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 源列表与目标列表长度不一致，未执行任何操作
    #[error("source list has {sources} entries but destination list has {destinations}")]
    LengthMismatch { sources: usize, destinations: usize },

    #[error(transparent)]
    Bucket(#[from] BucketError),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
