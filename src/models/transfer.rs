// 传输相关类型
// 定义传输状态、进度、传输项和最终报告

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::ssh::event::Stage;

/// 传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferStatus {
    /// 等待中
    #[default]
    Pending,
    /// 建立连接中（解析、握手、认证、打开文件）
    Connecting,
    /// 下载中
    Downloading,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TransferStatus {
    /// 是否是错误状态
    pub fn is_error(&self) -> bool {
        matches!(self, TransferStatus::Failed | TransferStatus::Cancelled)
    }

    /// 是否已完成
    pub fn is_complete(&self) -> bool {
        matches!(self, TransferStatus::Completed)
    }

    /// 是否已结束（成功或失败）
    pub fn is_finished(&self) -> bool {
        self.is_complete() || self.is_error()
    }

    /// 根据当前阶段推导状态
    pub fn from_stage(stage: Stage) -> Self {
        match stage {
            Stage::Connecting
            | Stage::Handshaking
            | Stage::Authenticating
            | Stage::InitSubsystem
            | Stage::OpeningFile => TransferStatus::Connecting,
            Stage::Streaming | Stage::TearingDown => TransferStatus::Downloading,
            Stage::Finished => TransferStatus::Completed,
        }
    }
}

/// 传输进度
/// 远程文件大小事先未知，只记录已传输量和速度
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    /// 已传输字节数
    pub bytes_transferred: u64,
    /// 传输速度 (bytes/s)
    pub speed_bytes_per_sec: u64,
    /// 开始时间
    pub started_at: Option<Instant>,
}

impl TransferProgress {
    /// 开始传输
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// 累加已传输字节数并更新速度
    pub fn advance(&mut self, bytes: u64) {
        self.bytes_transferred += bytes;

        if let Some(started_at) = self.started_at {
            let elapsed = started_at.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                self.speed_bytes_per_sec = (self.bytes_transferred as f64 / elapsed) as u64;
            }
        }
    }

    /// 已用时间
    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|started_at| started_at.elapsed())
            .unwrap_or_default()
    }

    /// 格式化速度显示
    pub fn format_speed(&self) -> String {
        format_bytes_per_sec(self.speed_bytes_per_sec)
    }
}

/// 传输项
/// 由会话和调用方持有的句柄共享
#[derive(Debug, Clone)]
pub struct TransferItem {
    /// 唯一标识符
    pub id: String,
    /// 远程文件路径
    pub remote_path: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 传输状态
    pub status: TransferStatus,
    /// 传输进度
    pub progress: TransferProgress,
    /// 错误信息
    pub error: Option<String>,
    /// 取消令牌
    pub cancel_token: CancellationToken,
}

impl TransferItem {
    /// 创建新的下载项
    pub fn new_download(remote_path: String, local_path: PathBuf) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_path,
            local_path,
            status: TransferStatus::Pending,
            progress: TransferProgress::default(),
            error: None,
            cancel_token: CancellationToken::new(),
        }
    }

    /// 设置失败状态
    pub fn set_failed(&mut self, error: String, cancelled: bool) {
        self.status = if cancelled {
            TransferStatus::Cancelled
        } else {
            TransferStatus::Failed
        };
        self.error = Some(error);
    }

    /// 设置完成状态
    pub fn set_completed(&mut self) {
        self.status = TransferStatus::Completed;
    }

    /// 获取文件名
    pub fn file_name(&self) -> String {
        self.remote_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.remote_path)
            .to_string()
    }
}

/// 成功传输的报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// 传输 ID
    pub id: String,
    /// 写入本地的字节数
    pub bytes: u64,
    /// 完成的读取次数（含确认文件结束的空读，不含 WouldBlock 的尝试）
    pub reads: u64,
    /// 主机密钥指纹（SHA1，未校验）
    pub fingerprint: Vec<u8>,
    /// 耗时
    pub elapsed: Duration,
}

/// 格式化字节速度
fn format_bytes_per_sec(bytes_per_sec: u64) -> String {
    let speed = bytes_per_sec as f64;
    if speed >= 1_073_741_824.0 {
        format!("{:.1} GB/s", speed / 1_073_741_824.0)
    } else if speed >= 1_048_576.0 {
        format!("{:.1} MB/s", speed / 1_048_576.0)
    } else if speed >= 1_024.0 {
        format!("{:.1} KB/s", speed / 1_024.0)
    } else {
        format!("{} B/s", bytes_per_sec)
    }
}

/// 将指纹格式化为冒号分隔的十六进制
pub fn format_fingerprint(fingerprint: &[u8]) -> String {
    fingerprint
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
