//! 日志模块 - 提供文件日志和大小管理功能

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志目录，默认使用系统数据目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
            dir: None,
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(get_log_dir)
    }
}

type SharedWriter = Arc<Mutex<Option<BufWriter<File>>>>;

fn lock(writer: &SharedWriter) -> MutexGuard<'_, Option<BufWriter<File>>> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 带大小限制的日志写入器
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: SharedWriter,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join("app.log");
        let max_size = (max_size_mb as u64) * 1024 * 1024;

        let writer = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
        // 现有文件超过限制则先轮转
        if Self::oversized(file_path, max_size) {
            Self::rotate_log(file_path)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(file_path)?;

        Ok(BufWriter::new(file))
    }

    fn oversized(file_path: &Path, max_size: u64) -> bool {
        fs::metadata(file_path).is_ok_and(|m| m.len() > max_size)
    }

    /// 轮转日志文件 app.log -> app.log.old
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");

        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }

        fs::rename(file_path, &backup_path)
    }

    /// 关闭当前文件、轮转并重新打开
    fn rotate_shared(writer: &SharedWriter, file_path: &Path, max_size: u64) -> io::Result<()> {
        let mut guard = lock(writer);
        if let Some(mut w) = guard.take() {
            let _ = w.flush();
        }
        Self::rotate_log(file_path)?;
        *guard = Some(Self::open_file(file_path, max_size)?);
        Ok(())
    }
}

/// 日志写入器包装
pub struct LogWriter {
    inner: SharedWriter,
    file_path: PathBuf,
    max_size: u64,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = {
            let mut guard = lock(&self.inner);
            let writer = guard
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Writer not available"))?;
            let n = writer.write(buf)?;
            writer.flush()?;
            n
        };

        if SizeRotatingWriter::oversized(&self.file_path, self.max_size) {
            let _ = SizeRotatingWriter::rotate_shared(&self.inner, &self.file_path, self.max_size);
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}

/// 默认日志目录（系统数据目录下的 logs）
pub fn get_log_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "bucketsync")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from(".bucketsync/logs"))
}

/// 初始化日志系统：控制台输出到 stderr，启用时同时写入文件
pub fn init_logging(config: &LogConfig, verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };

    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["opendal=warn", "hyper=warn", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let file_layer = if config.enabled {
        match SizeRotatingWriter::new(&config.log_dir(), config.max_size_mb) {
            Ok(file_writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(false),
            ),
            Err(e) => {
                eprintln!("无法创建日志文件，仅输出到控制台: {}", e);
                None
            }
        }
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
}
