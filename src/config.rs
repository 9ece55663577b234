//! 应用配置模块

use crate::core::SyncConfig;
use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 存储类型
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    S3,
    Local,
    Memory,
}

/// bucket 连接配置
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// S3: key 前缀；local: 根目录
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// 不签名访问公开 bucket
    pub anonymous: bool,
}

impl std::fmt::Debug for BucketConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketConfig")
            .field("typ", &self.typ)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "***"))
            .field("endpoint", &self.endpoint)
            .field("root", &self.root)
            .field("anonymous", &self.anonymous)
            .finish()
    }
}

/// config.json 的完整内容，各部分均可省略
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bucket: BucketConfig,
    pub sync: SyncConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// 读取配置文件，文件不存在时使用默认值
    pub fn load(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            tracing::debug!("配置文件不存在，使用默认配置: {:?}", config_file);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_file)
            .with_context(|| format!("reading config file {}", config_file.display()))?;
        let config = serde_json::from_str::<AppConfig>(&content)
            .with_context(|| format!("parsing config file {}", config_file.display()))?;

        Ok(config)
    }

    /// 保存配置（保留文件中的其他字段）
    pub fn save(&self, config_file: &Path) -> Result<()> {
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        config["bucket"] = serde_json::to_value(&self.bucket)?;
        config["sync"] = serde_json::to_value(&self.sync)?;
        config["log"] = serde_json::to_value(&self.log)?;

        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(config_file, serde_json::to_string_pretty(&config)?)?;
        Ok(())
    }
}

/// 默认配置目录
pub fn default_config_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "bucketsync")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".bucketsync"))
}

/// 默认配置文件路径
pub fn default_config_file() -> PathBuf {
    default_config_dir().join("config.json")
}
