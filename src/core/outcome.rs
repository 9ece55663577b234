//! 批量操作的逐项结果

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 批量操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Upload,
    Download,
    Rename,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Upload => write!(f, "upload"),
            Operation::Download => write!(f, "download"),
            Operation::Rename => write!(f, "rename"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// 校验值一致
    Unchanged,
    /// 源不存在
    SourceMissing,
    /// 上传源是目录
    SourceIsDirectory,
    /// 重命名目标已存在
    DestinationExists,
    /// 下载目标是目录
    DestinationIsDirectory,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Unchanged => write!(f, "unchanged"),
            SkipReason::SourceMissing => write!(f, "source missing"),
            SkipReason::SourceIsDirectory => write!(f, "source is a directory"),
            SkipReason::DestinationExists => write!(f, "destination exists"),
            SkipReason::DestinationIsDirectory => write!(f, "destination is a directory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status", content = "detail")]
pub enum ItemOutcome {
    Success,
    Skipped(SkipReason),
    Failed(String),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ItemOutcome::Skipped(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ItemOutcome::Failed(_))
    }
}

/// 单个 (源, 目标) 的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReport {
    pub index: usize,
    pub source: String,
    /// 删除操作没有目标
    pub destination: Option<String>,
    pub outcome: ItemOutcome,
}

/// 批量操作报告，每个输入项恰好对应一条结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub id: String,
    pub operation: Operation,
    pub bucket: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    pub(crate) fn begin(operation: Operation, bucket: &str, capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            bucket: bucket.to_string(),
            started_at: now,
            finished_at: now,
            items: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn record(&mut self, source: &str, destination: Option<&str>, outcome: ItemOutcome) {
        self.items.push(ItemReport {
            index: self.items.len(),
            source: source.to_string(),
            destination: destination.map(str::to_string),
            outcome,
        });
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_success()).count()
    }

    pub fn skipped(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_skipped()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_failed()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.items.iter().any(|i| i.outcome.is_failed())
    }

    pub fn outcome(&self, index: usize) -> Option<&ItemOutcome> {
        self.items.get(index).map(|i| &i.outcome)
    }

    /// 一行摘要，例如 `upload: 3 succeeded, 1 skipped, 0 failed`
    pub fn summary(&self) -> String {
        format!(
            "{}: {} succeeded, {} skipped, {} failed",
            self.operation,
            self.succeeded(),
            self.skipped(),
            self.failed()
        )
    }
}
