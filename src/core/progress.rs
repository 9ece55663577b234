//! 单个文件的传输进度统计

use crate::storage::ObjectMeta;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// 传输总大小的来源，在构造时解析一次
#[derive(Debug, Clone, Copy)]
pub enum SizeSource<'a> {
    /// 上传：本地文件大小
    LocalFile(&'a Path),
    /// 下载：远程对象的 content-length
    RemoteObject(&'a ObjectMeta),
}

impl SizeSource<'_> {
    /// 无法获取大小时返回 0
    pub fn resolve(&self) -> u64 {
        match self {
            SizeSource::LocalFile(path) => std::fs::metadata(path).map_or(0, |m| m.len()),
            SizeSource::RemoteObject(meta) => meta.content_length,
        }
    }
}

/// 某一时刻的进度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub delivered: u64,
    pub total: u64,
    pub percent: f64,
}

impl ProgressSnapshot {
    fn new(delivered: u64, total: u64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            delivered as f64 / total as f64 * 100.0
        };
        Self {
            delivered,
            total,
            percent,
        }
    }

    /// `<已传输> / <总数> (<百分比>%)`
    pub fn render(&self) -> String {
        format!("{} / {} ({:.2}%)", self.delivered, self.total, self.percent)
    }
}

struct ProgressState {
    delivered: u64,
    last_advance: Instant,
    out: Box<dyn Write + Send>,
}

/// 传输进度跟踪器
///
/// 底层传输可能在多个工作上下文中回调 [`TransferProgress::advance`]，
/// 累加在互斥锁内完成。
pub struct TransferProgress {
    total: u64,
    state: Mutex<ProgressState>,
}

impl TransferProgress {
    pub fn new(source: SizeSource<'_>, out: Box<dyn Write + Send>) -> Self {
        Self::with_total(source.resolve(), out)
    }

    pub fn with_total(total: u64, out: Box<dyn Write + Send>) -> Self {
        Self {
            total,
            state: Mutex::new(ProgressState {
                delivered: 0,
                last_advance: Instant::now(),
                out,
            }),
        }
    }

    /// 不输出任何内容的跟踪器
    pub fn hidden(total: u64) -> Self {
        Self::with_total(total, Box::new(io::sink()))
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// 累加已传输字节并输出进度行
    pub fn advance(&self, bytes: u64) -> ProgressSnapshot {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.delivered = state.delivered.saturating_add(bytes);
        state.last_advance = Instant::now();

        let snapshot = ProgressSnapshot::new(state.delivered, self.total);
        // 进度输出失败不影响传输
        let _ = write!(state.out, "{}\r", snapshot.render());
        let _ = state.out.flush();

        snapshot
    }

    /// 距上次推进（或创建）经过的时间
    pub fn idle_for(&self) -> Duration {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_advance.elapsed()
    }

    /// 传输结束后换行，避免下一行覆盖进度
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(state.out);
        let _ = state.out.flush();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        ProgressSnapshot::new(state.delivered, self.total)
    }
}

impl std::fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferProgress")
            .field("total", &self.total)
            .field("delivered", &self.snapshot().delivered)
            .finish()
    }
}
