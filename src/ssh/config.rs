// 传输配置与请求

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::TransferError;

/// 默认读取块大小
pub const DEFAULT_CHUNK_SIZE: usize = 0x1000;

/// 文件结束判定策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EofPolicy {
    /// 读到不足一个块即视为结束（块大小整数倍的文件会多读一次空块）
    #[default]
    ShortRead,
    /// 一直读到返回 0 字节为止
    ZeroRead,
}

/// 传输配置
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// SSH 端口
    pub port: u16,
    /// 单个地址的 TCP 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 整体传输期限（秒），None 表示不限
    pub timeout_secs: Option<u64>,
    /// 每次读取的块大小
    pub chunk_size: usize,
    /// 文件结束判定策略
    pub eof_policy: EofPolicy,
    /// 拆除阶段阻塞调用的超时（毫秒）
    pub teardown_timeout_ms: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout_secs: 30,
            timeout_secs: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            eof_policy: EofPolicy::ShortRead,
            teardown_timeout_ms: 5000,
        }
    }
}

impl TransferConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::Config(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(TransferError::Config(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// 登录凭据
/// 只在认证完成前保留在会话中
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// 下载请求
#[derive(Clone, Debug)]
pub struct TransferRequest {
    /// 目标主机
    pub host: String,
    /// 远程文件路径
    pub remote_path: String,
    /// 本地保存路径
    pub local_path: PathBuf,
    /// 登录凭据
    pub credentials: Credentials,
    /// 传输配置
    pub config: TransferConfig,
}

impl TransferRequest {
    /// 使用默认配置创建请求
    pub fn new(
        host: impl Into<String>,
        remote_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            credentials: Credentials::new(username, secret),
            config: TransferConfig::default(),
        }
    }

    /// 替换传输配置
    pub fn with_config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    /// 校验请求
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.host.is_empty() {
            return Err(TransferError::Config("host is empty".to_string()));
        }
        if self.remote_path.is_empty() {
            return Err(TransferError::Config("remote path is empty".to_string()));
        }
        if self.local_path.as_os_str().is_empty() {
            return Err(TransferError::Config("local path is empty".to_string()));
        }
        self.config.validate()
    }
}
