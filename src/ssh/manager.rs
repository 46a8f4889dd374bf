// 传输管理器
//
// 单线程事件循环：tokio current_thread 运行时 + LocalSet。
// 每个下载是一个本地任务，会话由该任务独占，结束时触发一次完成回调。

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::backend::Backend;
use super::config::TransferRequest;
use super::driver::run_transfer;
use super::event::TransferEvent;
use super::libssh2::Ssh2Backend;
use super::session::{TransferResult, TransferSession};
use crate::models::transfer::{TransferItem, TransferStatus};

/// 传输句柄
/// 用于查询状态或取消传输
#[derive(Clone)]
pub struct TransferHandle {
    item: Rc<RefCell<TransferItem>>,
}

impl TransferHandle {
    /// 获取传输 ID
    pub fn id(&self) -> String {
        self.item.borrow().id.clone()
    }

    /// 当前状态
    pub fn status(&self) -> TransferStatus {
        self.item.borrow().status
    }

    /// 已写入本地的字节数
    pub fn bytes_transferred(&self) -> u64 {
        self.item.borrow().progress.bytes_transferred
    }

    /// 失败原因
    pub fn error(&self) -> Option<String> {
        self.item.borrow().error.clone()
    }

    /// 取消传输
    /// 会话会在下一个阶段边界或当前等待中转入拆除
    pub fn cancel(&self) {
        let item = self.item.borrow();
        info!("[Transfer] [{}] Cancel requested", item.id);
        item.cancel_token.cancel();
    }
}

/// 构建会话任务
fn prepare<B, F>(
    backend: B,
    request: TransferRequest,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
    on_complete: F,
) -> (TransferHandle, impl Future<Output = ()>)
where
    B: Backend + 'static,
    F: FnOnce(TransferResult) + 'static,
{
    let item = Rc::new(RefCell::new(TransferItem::new_download(
        request.remote_path.clone(),
        request.local_path.clone(),
    )));
    let cancel = item.borrow().cancel_token.clone();

    info!(
        "[Transfer] [{}] Download {}:{} -> {}",
        item.borrow().id,
        request.host,
        request.remote_path,
        request.local_path.display()
    );

    let mut session = TransferSession::<B>::new(request, item.clone());
    if let Some(events) = events {
        session = session.with_events(events);
    }

    let task = async move {
        let result = run_transfer(backend, session, cancel).await;
        on_complete(result);
    };

    (TransferHandle { item }, task)
}

/// 在当前 LocalSet 中启动下载，立即返回
///
/// 必须在 `LocalSet` 上下文中调用。`on_complete` 在拆除完成后恰好调用一次。
pub fn begin_transfer<B, F>(backend: B, request: TransferRequest, on_complete: F) -> TransferHandle
where
    B: Backend + 'static,
    F: FnOnce(TransferResult) + 'static,
{
    let (handle, task) = prepare(backend, request, None, on_complete);
    tokio::task::spawn_local(task);
    handle
}

/// 单线程事件循环
pub struct EventLoop {
    /// current_thread 运行时
    runtime: Runtime,
    /// 所有传输任务
    local: LocalSet,
    /// 事件发送器
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl EventLoop {
    /// 创建事件循环
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            runtime,
            local: LocalSet::new(),
            events: None,
        })
    }

    /// 订阅传输事件
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// 启动下载，立即返回
    pub fn begin_transfer<B, F>(
        &self,
        backend: B,
        request: TransferRequest,
        on_complete: F,
    ) -> TransferHandle
    where
        B: Backend + 'static,
        F: FnOnce(TransferResult) + 'static,
    {
        let (handle, task) = prepare(backend, request, self.events.clone(), on_complete);
        self.local.spawn_local(task);
        handle
    }

    /// 使用 libssh2 后端和默认配置下载单个文件
    pub fn download_file<F>(
        &self,
        host: impl Into<String>,
        remote_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
        username: impl Into<String>,
        secret: impl Into<String>,
        on_complete: F,
    ) -> TransferHandle
    where
        F: FnOnce(TransferResult) + 'static,
    {
        let request = TransferRequest::new(host, remote_path, local_path, username, secret);
        let backend = Ssh2Backend::new(request.config.teardown_timeout_ms);
        self.begin_transfer(backend, request, on_complete)
    }

    /// 运行直到所有传输结束
    pub fn run(self) {
        // 事件发送器随 EventLoop 一起释放，订阅方在所有传输结束后收到通道关闭
        let Self {
            runtime,
            local,
            events,
        } = self;
        drop(events);
        runtime.block_on(local);
    }
}
