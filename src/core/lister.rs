use crate::core::fingerprint::remote_checksum;
use crate::error::BucketError;
use crate::storage::Bucket;
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

/// key -> checksum，保持存储端列出的顺序
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChecksumListing {
    entries: Vec<(String, String)>,
}

impl ChecksumListing {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, sum)| sum.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_map(self) -> HashMap<String, String> {
        self.entries.into_iter().collect()
    }
}

/// 列出 `prefix` 下 key 包含 `filter` 的对象及其校验值
///
/// 列表失败直接返回错误，不返回部分结果。
pub async fn list_checksums(
    bucket: &dyn Bucket,
    prefix: &str,
    filter: &str,
) -> Result<ChecksumListing, BucketError> {
    let objects = bucket.list(prefix).await?;

    let mut entries = Vec::new();
    for object in objects {
        if object.key.ends_with('/') || !object.key.contains(filter) {
            continue;
        }
        let checksum = remote_checksum(&object).unwrap_or_default();
        info!("{}: {}", object.key, checksum);
        entries.push((object.key, checksum));
    }

    Ok(ChecksumListing { entries })
}
