// 基于 ssh2 (libssh2) 的协作者实现
//
// libssh2 会话工作在非阻塞模式：任何操作返回 EAGAIN 时映射为 Step::WouldBlock，
// 等待方向取自 libssh2 报告的阻塞方向。
// 就绪事件通过 tokio 的 TcpStream 获得，libssh2 使用同一套接字的另一个描述符。

use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{BlockDirections, ErrorCode, HashType, Session, Sftp};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::backend::{connect_endpoints, resolve_endpoints, Backend, ProtocolSession, Transport};
use super::error::TransferError;
use super::step::{Direction, Step};

/// libssh2 的 EAGAIN 错误码
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// libssh2 后端
#[derive(Clone, Debug)]
pub struct Ssh2Backend {
    /// 拆除阶段阻塞调用的超时（毫秒）
    teardown_timeout_ms: u32,
}

impl Ssh2Backend {
    pub fn new(teardown_timeout_ms: u32) -> Self {
        Self {
            teardown_timeout_ms,
        }
    }
}

impl Default for Ssh2Backend {
    fn default() -> Self {
        Self::new(5000)
    }
}

#[async_trait(?Send)]
impl Backend for Ssh2Backend {
    type Transport = TcpTransport;
    type Session = Ssh2Session;

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, TransferError> {
        resolve_endpoints(host, port).await
    }

    async fn connect(
        &self,
        endpoints: &[SocketAddr],
        connect_timeout: Duration,
    ) -> Result<TcpTransport, TransferError> {
        let stream = connect_endpoints(endpoints, connect_timeout).await?;
        TcpTransport::new(stream).map_err(|e| TransferError::Connect(e.to_string()))
    }

    fn new_session(&self, transport: &mut TcpTransport) -> Result<Ssh2Session, TransferError> {
        let stream = transport
            .clone_std_stream()
            .map_err(|e| TransferError::Connect(format!("Failed to share socket: {}", e)))?;

        let mut session = Session::new()
            .map_err(|e| TransferError::Connect(format!("Init session failed: {}", e)))?;
        session.set_tcp_stream(stream);
        session.set_blocking(false);

        Ok(Ssh2Session {
            session,
            teardown_timeout_ms: self.teardown_timeout_ms,
        })
    }
}

/// TCP 连接
/// 持有 tokio 端用于就绪等待，另复制一个描述符交给 libssh2
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr().ok();
        Ok(Self { stream, peer })
    }

    /// 复制出一个标准库 TcpStream（共享同一套接字）
    pub fn clone_std_stream(&self) -> io::Result<std::net::TcpStream> {
        #[cfg(unix)]
        let owned = {
            use std::os::fd::AsFd;
            self.stream.as_fd().try_clone_to_owned()?
        };
        #[cfg(windows)]
        let owned = {
            use std::os::windows::io::AsSocket;
            self.stream.as_socket().try_clone_to_owned()?
        };
        Ok(std::net::TcpStream::from(owned))
    }
}

#[async_trait(?Send)]
impl Transport for TcpTransport {
    async fn ready(&self, direction: Direction) -> io::Result<()> {
        match direction {
            Direction::Read => {
                // peek 会在 tokio 端正确清除已失效的就绪状态，直到真正有数据（或 EOF）才返回
                let mut probe = [0u8; 1];
                self.stream.peek(&mut probe).await?;
            }
            Direction::Write => {
                self.stream.writable().await?;
            }
            Direction::Both => {
                self.stream.ready(direction.interest()).await?;
            }
        }
        Ok(())
    }

    fn close(self) {
        debug!("[SFTP] Closing connection to {:?}", self.peer);
        drop(self.stream);
    }
}

/// libssh2 会话
pub struct Ssh2Session {
    session: Session,
    teardown_timeout_ms: u32,
}

impl Ssh2Session {
    /// 把 ssh2 的结果转换为三态结果
    fn classify<T>(&self, result: Result<T, ssh2::Error>, fallback: Direction) -> Step<T> {
        match result {
            Ok(value) => Step::Complete(value),
            Err(e) if matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN)) => {
                Step::WouldBlock(self.block_direction(fallback))
            }
            Err(e) => Step::Fault(e.to_string()),
        }
    }

    /// libssh2 报告的阻塞方向
    fn block_direction(&self, fallback: Direction) -> Direction {
        match self.session.block_directions() {
            BlockDirections::Inbound => Direction::Read,
            BlockDirections::Outbound => Direction::Write,
            BlockDirections::Both => Direction::Both,
            BlockDirections::None => fallback,
        }
    }

    /// 拆除前切换到阻塞模式，并限制阻塞调用的时长
    fn enter_blocking(&self) {
        if !self.session.is_blocking() {
            self.session.set_timeout(self.teardown_timeout_ms);
            self.session.set_blocking(true);
        }
    }
}

impl ProtocolSession for Ssh2Session {
    type Subsystem = Sftp;
    type File = ssh2::File;

    fn handshake(&mut self) -> Step<Vec<u8>> {
        let result = self.session.handshake();
        self.classify(result, Direction::Write).map(|()| {
            self.session
                .host_key_hash(HashType::Sha1)
                .map(|hash| hash.to_vec())
                .unwrap_or_default()
        })
    }

    fn authenticate(&mut self, username: &str, secret: &str) -> Step<()> {
        let result = self.session.userauth_password(username, secret);
        self.classify(result, Direction::Write)
    }

    fn init_subsystem(&mut self) -> Step<Sftp> {
        let result = self.session.sftp();
        self.classify(result, Direction::Write)
    }

    fn open_file(&mut self, subsystem: &Sftp, path: &str) -> Step<ssh2::File> {
        let result = subsystem.open(Path::new(path));
        self.classify(result, Direction::Write)
    }

    fn read(&mut self, file: &mut ssh2::File, buf: &mut [u8]) -> Step<usize> {
        match file.read(buf) {
            Ok(count) => Step::Complete(count),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Step::WouldBlock(self.block_direction(Direction::Read))
            }
            Err(e) => Step::Fault(e.to_string()),
        }
    }

    fn close_file(&mut self, file: ssh2::File) {
        self.enter_blocking();
        drop(file);
    }

    fn shutdown_subsystem(&mut self, subsystem: Sftp) {
        self.enter_blocking();
        drop(subsystem);
    }

    fn terminate(self) {
        // 阻塞执行，超时由 teardown_timeout_ms 限定
        self.enter_blocking();
        if let Err(e) = self.session.disconnect(None, "Normal Shutdown", None) {
            warn!("[SFTP] Disconnect failed: {}", e);
        }
    }
}
