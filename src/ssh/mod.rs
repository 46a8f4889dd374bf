// SFTP 非阻塞下载模块
//
// 模块结构:
// - config: 传输配置与请求 (TransferConfig, TransferRequest, Credentials)
// - error: 错误类型 (TransferError, FaultCategory)
// - event: 传输阶段与事件 (Stage, TransferEvent)
// - step: 非阻塞三态结果 (Step, Direction)
// - backend: 外部协作者接口 (Backend, Transport, ProtocolSession)
// - libssh2: 基于 ssh2 的协作者实现
// - session: 会话上下文 (TransferSession)
// - driver: 阶段调度与运行
// - manager: 单线程事件循环与启动入口

pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod libssh2;
pub mod manager;
pub mod session;
pub mod step;

#[cfg(test)]
pub(crate) mod testing;

// 公开导出
pub use backend::{Backend, ProtocolSession, Transport};
pub use config::{Credentials, EofPolicy, TransferConfig, TransferRequest, DEFAULT_CHUNK_SIZE};
pub use driver::run_transfer;
pub use error::{FaultCategory, TransferError};
pub use event::{Stage, TransferEvent};
pub use libssh2::{Ssh2Backend, Ssh2Session, TcpTransport};
pub use manager::{begin_transfer, EventLoop, TransferHandle};
pub use session::{TransferResult, TransferSession};
pub use step::{Direction, Step};
