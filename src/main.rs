// sftp-fetch - 非阻塞 SFTP 单文件下载
// 命令行入口

use std::cell::RefCell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use sftp_fetch::services::storage;
use sftp_fetch::ssh::{
    EofPolicy, EventLoop, Ssh2Backend, TransferEvent, TransferRequest, TransferResult,
};
use sftp_fetch::TransferConfig;

/// 通过 SFTP 下载单个文件
#[derive(Debug, Parser)]
#[command(name = "sftp-fetch", version, about)]
struct Cli {
    /// 服务器地址
    host: String,

    /// 远程文件路径
    remote_path: String,

    /// 本地保存路径
    local_path: PathBuf,

    /// 用户名
    #[arg(short, long)]
    user: String,

    /// 密码
    #[arg(short, long, env = "SFTP_FETCH_PASSWORD", hide_env_values = true)]
    password: String,

    /// SSH 端口
    #[arg(long)]
    port: Option<u16>,

    /// 整体超时（秒）
    #[arg(long)]
    timeout: Option<u64>,

    /// 每次读取的块大小（字节）
    #[arg(long)]
    chunk_size: Option<usize>,

    /// 读到 0 字节才认为文件结束
    #[arg(long)]
    zero_read_eof: bool,

    /// 配置文件路径
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// 合并配置文件与命令行参数，命令行优先
    fn transfer_config(&self) -> Result<TransferConfig> {
        let mut config = storage::load_config(self.config.as_deref())?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = Some(timeout);
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if self.zero_read_eof {
            config.eof_policy = EofPolicy::ZeroRead;
        }
        Ok(config)
    }
}

fn run(cli: Cli) -> Result<TransferResult> {
    let config = cli.transfer_config()?;
    let request = TransferRequest::new(
        cli.host,
        cli.remote_path,
        cli.local_path,
        cli.user,
        cli.password,
    )
    .with_config(config);
    let backend = Ssh2Backend::new(request.config.teardown_timeout_ms);

    let mut event_loop = EventLoop::new().context("无法创建事件循环")?;
    let mut events = event_loop.subscribe();

    let outcome = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    event_loop.begin_transfer(backend, request, move |result| {
        *slot.borrow_mut() = Some(result);
    });
    event_loop.run();

    // 指纹输出到标准输出，便于脚本比对
    while let Ok(event) = events.try_recv() {
        if let TransferEvent::Fingerprint { fingerprint, .. } = event {
            println!("{}", fingerprint);
        }
    }

    let result = outcome
        .borrow_mut()
        .take()
        .context("传输未返回结果")?;
    Ok(result)
}

fn main() -> ExitCode {
    // 初始化日志系统
    // 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug sftp-fetch ...
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false) // 不显示 target（模块路径）
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(Ok(report)) => {
            info!(
                "Transfer {} finished: {} bytes in {} reads ({:.2}s)",
                report.id,
                report.bytes,
                report.reads,
                report.elapsed.as_secs_f64()
            );
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("Transfer failed ({:?}): {}", e.category(), e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}
