// 传输错误类型定义

use thiserror::Error;

/// 传输错误类型
/// 每个阶段的失败都会带到完成回调，调用方据此区分失败阶段
#[derive(Debug, Error)]
pub enum TransferError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 域名解析失败
    #[error("Resolve failed: {0}")]
    Resolve(String),

    /// TCP 连接失败
    #[error("Connect failed: {0}")]
    Connect(String),

    /// SSH 握手失败
    #[error("SSH handshake failed: {0}")]
    Handshake(String),

    /// 认证失败
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// SFTP 子系统初始化失败
    #[error("SFTP subsystem init failed: {0}")]
    SubsystemInit(String),

    /// 远程文件打开失败
    #[error("Failed to open remote file: {0}")]
    Open(String),

    /// 远程文件读取失败
    #[error("Failed to read remote file: {0}")]
    Read(String),

    /// 本地目标文件写入失败
    #[error("Local sink error: {0}")]
    Sink(String),

    /// 超时（调用方设定的整体期限）
    #[error("Transfer timeout after {0}s")]
    Timeout(u64),

    /// 传输已取消
    #[error("Transfer cancelled")]
    Cancelled,

    /// IO 错误（套接字就绪等待等）
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 错误分类
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCategory {
    Config,
    Resolve,
    Connect,
    Handshake,
    Auth,
    SubsystemInit,
    Open,
    Read,
    Sink,
    Timeout,
    Cancelled,
    Io,
}

impl TransferError {
    /// 获取错误分类
    pub fn category(&self) -> FaultCategory {
        match self {
            Self::Config(_) => FaultCategory::Config,
            Self::Resolve(_) => FaultCategory::Resolve,
            Self::Connect(_) => FaultCategory::Connect,
            Self::Handshake(_) => FaultCategory::Handshake,
            Self::Auth(_) => FaultCategory::Auth,
            Self::SubsystemInit(_) => FaultCategory::SubsystemInit,
            Self::Open(_) => FaultCategory::Open,
            Self::Read(_) => FaultCategory::Read,
            Self::Sink(_) => FaultCategory::Sink,
            Self::Timeout(_) => FaultCategory::Timeout,
            Self::Cancelled => FaultCategory::Cancelled,
            Self::Io(_) => FaultCategory::Io,
        }
    }

    /// 是否由调用方主动终止（取消或超时）
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }
}
