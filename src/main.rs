use anyhow::{Context, Result};
use bucketsync_lib::config::{AppConfig, StorageType};
use bucketsync_lib::logging::init_logging;
use bucketsync_lib::{AppState, BatchReport, ItemOutcome, RenameOptions, UploadOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// 在对象存储 bucket 与本地文件之间批量同步
#[derive(Parser, Debug)]
#[command(name = "bucketsync", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// 配置文件路径（默认：系统配置目录下的 config.json）
    #[arg(long, global = true, env = "BUCKETSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// 覆盖配置中的 bucket 名称
    #[arg(long, global = true, env = "BUCKETSYNC_BUCKET")]
    bucket: Option<String>,

    /// 覆盖配置中的存储类型
    #[arg(long, value_enum, global = true)]
    backend: Option<StorageType>,

    /// 覆盖 root（S3 前缀或本地目录）
    #[arg(long, global = true)]
    root: Option<String>,

    /// 以 JSON 输出报告（同时关闭字节进度，保证 stdout 是合法 JSON）
    #[arg(long, global = true)]
    json: bool,

    /// 不输出字节进度
    #[arg(short, long, global = true)]
    quiet: bool,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 把当前生效的配置（含命令行覆盖）写入配置文件
    Init,
    /// 列出对象及其校验值
    List {
        #[arg(long, default_value = "")]
        prefix: String,
        /// 只保留 key 包含该子串的对象
        #[arg(long, default_value = "")]
        filter: String,
    },
    /// 上传本地文件，--file 与 --key 按顺序一一对应
    Upload {
        #[arg(long = "file", required = true, num_args = 1..)]
        files: Vec<PathBuf>,
        #[arg(long = "key", required = true, num_args = 1..)]
        keys: Vec<String>,
        #[arg(long)]
        public: bool,
        #[arg(long)]
        encrypt: bool,
    },
    /// 下载对象，--key 与 --to 按顺序一一对应
    Download {
        #[arg(long = "key", required = true, num_args = 1..)]
        keys: Vec<String>,
        #[arg(long = "to", required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },
    /// 通过 复制 + 删除 重命名对象
    Rename {
        #[arg(long = "from", required = true, num_args = 1..)]
        from: Vec<String>,
        #[arg(long = "to", required = true, num_args = 1..)]
        to: Vec<String>,
        #[arg(long)]
        keep_original: bool,
        #[arg(long)]
        public: bool,
    },
    /// 删除对象
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

fn load_config(cli: &Cli) -> Result<(AppConfig, PathBuf)> {
    let config_file = AppState::resolve_config_file(cli.config.clone());
    let mut config = AppConfig::load(&config_file)?;

    if let Some(backend) = cli.backend {
        config.bucket.typ = backend;
    }
    if let Some(ref bucket) = cli.bucket {
        config.bucket.bucket = Some(bucket.clone());
    }
    if let Some(ref root) = cli.root {
        config.bucket.root = Some(root.clone());
    }
    if cli.quiet || cli.json {
        config.sync.show_progress = false;
    }

    Ok((config, config_file))
}

fn print_report(report: &BatchReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for item in &report.items {
        let target = item
            .destination
            .as_deref()
            .map(|d| format!(" -> {}", d))
            .unwrap_or_default();
        let status = match &item.outcome {
            ItemOutcome::Success => "ok".to_string(),
            ItemOutcome::Skipped(reason) => format!("skipped ({})", reason),
            ItemOutcome::Failed(reason) => format!("FAILED: {}", reason),
        };
        println!("[{}] {}{}: {}", item.index, item.source, target, status);
    }
    println!("{}", report.summary());
    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    let (config, config_file) = load_config(&cli)?;
    init_logging(&config.log, cli.verbose);
    tracing::debug!("使用配置文件: {:?}", config_file);

    if let Command::Init = cli.command {
        config.save(&config_file)?;
        tracing::info!("配置已写入: {}", config_file.display());
        println!("{}", config_file.display());
        return Ok(true);
    }

    let state = AppState::new(config, config_file)
        .await
        .context("connecting to bucket")?;

    let token = state.engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("收到中断信号，取消剩余操作");
            token.cancel();
        }
    });

    let engine = &state.engine;
    let report = match cli.command {
        Command::List { ref prefix, ref filter } => {
            let listing = engine.list_checksums(prefix, filter).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                for (key, checksum) in listing.iter() {
                    println!("{}  {}", checksum, key);
                }
            }
            return Ok(true);
        }
        Command::Upload {
            ref files,
            ref keys,
            public,
            encrypt,
        } => {
            let options = UploadOptions {
                make_public: public,
                encrypt,
            };
            engine.upload_files(files, keys, options).await?
        }
        Command::Download { ref keys, ref paths } => engine.download_files(keys, paths).await?,
        Command::Rename {
            ref from,
            ref to,
            keep_original,
            public,
        } => {
            let options = RenameOptions {
                keep_original,
                make_public: public,
            };
            engine.rename_keys(from, to, options).await?
        }
        Command::Delete { ref keys } => engine.delete_keys(keys).await,
        Command::Init => return Ok(true),
    };

    print_report(&report, cli.json)?;
    Ok(!report.has_failures())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
