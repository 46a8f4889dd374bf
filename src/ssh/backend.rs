// 外部协作者接口
//
// 驱动层只依赖这里的 trait：
// - Backend: 域名解析、TCP 连接、创建协议会话
// - Transport: 已建立的连接，提供套接字就绪等待
// - ProtocolSession: SSH/SFTP 的非阻塞原语

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use super::error::TransferError;
use super::step::{Direction, Step};

/// 已建立的传输层连接
#[async_trait(?Send)]
pub trait Transport {
    /// 等待底层套接字在指定方向就绪
    async fn ready(&self, direction: Direction) -> io::Result<()>;

    /// 释放连接（拆除的最后一步）
    fn close(self)
    where
        Self: Sized;
}

/// SSH/SFTP 协议会话
/// 所有方法都是单次非阻塞尝试，WouldBlock 时必须可以原样重试
pub trait ProtocolSession {
    /// SFTP 子系统句柄
    type Subsystem;
    /// 远程文件句柄
    type File;

    /// 握手，完成时返回主机密钥指纹
    fn handshake(&mut self) -> Step<Vec<u8>>;

    /// 密码认证
    fn authenticate(&mut self, username: &str, secret: &str) -> Step<()>;

    /// 打开 SFTP 子系统
    fn init_subsystem(&mut self) -> Step<Self::Subsystem>;

    /// 以只读方式打开远程文件
    fn open_file(&mut self, subsystem: &Self::Subsystem, path: &str) -> Step<Self::File>;

    /// 读取一块数据，返回 0 表示文件结束
    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Step<usize>;

    /// 关闭远程文件（可能阻塞）
    fn close_file(&mut self, file: Self::File);

    /// 关闭 SFTP 子系统（可能阻塞）
    fn shutdown_subsystem(&mut self, subsystem: Self::Subsystem);

    /// 断开并销毁协议会话（阻塞执行）
    fn terminate(self)
    where
        Self: Sized;
}

/// 协作者工厂
#[async_trait(?Send)]
pub trait Backend {
    type Transport: Transport;
    type Session: ProtocolSession;

    /// 解析主机地址
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, TransferError>;

    /// 按顺序尝试连接，返回第一个成功的连接
    async fn connect(
        &self,
        endpoints: &[SocketAddr],
        connect_timeout: Duration,
    ) -> Result<Self::Transport, TransferError>;

    /// 在连接上创建协议会话并切换到非阻塞模式
    fn new_session(&self, transport: &mut Self::Transport)
        -> Result<Self::Session, TransferError>;
}

/// 使用 tokio 解析主机地址
pub async fn resolve_endpoints(host: &str, port: u16) -> Result<Vec<SocketAddr>, TransferError> {
    let endpoints: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| TransferError::Resolve(format!("{}: {}", host, e)))?
        .collect();

    if endpoints.is_empty() {
        return Err(TransferError::Resolve(format!(
            "No endpoints found for {}",
            host
        )));
    }

    debug!("[SFTP] Resolved {} to {:?}", host, endpoints);
    Ok(endpoints)
}

/// 依次连接候选地址，返回第一个成功的 TcpStream
pub async fn connect_endpoints(
    endpoints: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<TcpStream, TransferError> {
    let mut last_error = String::from("No endpoints to connect");

    for endpoint in endpoints {
        debug!("[SFTP] Connecting to {}...", endpoint);
        match timeout(connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("[SFTP] Connect to {} failed: {}", endpoint, e);
                last_error = format!("{}: {}", endpoint, e);
            }
            Err(_) => {
                debug!("[SFTP] Connect to {} timed out", endpoint);
                last_error = format!(
                    "{}: timed out after {}s",
                    endpoint,
                    connect_timeout.as_secs()
                );
            }
        }
    }

    Err(TransferError::Connect(last_error))
}
