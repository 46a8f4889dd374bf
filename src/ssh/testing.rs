// 测试用的脚本化协作者
// 记录每次调用，便于断言阶段顺序、重试与拆除顺序

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;

use super::backend::{Backend, ProtocolSession, Transport};
use super::error::TransferError;
use super::step::{Direction, Step};

/// 注入失败的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FailAt {
    Resolve,
    Connect,
    Handshake,
    Auth,
    Subsystem,
    Open,
    /// 第 n 次读取失败（从 0 开始计数）
    Read(usize),
}

/// 调用日志
#[derive(Debug, Default)]
pub(crate) struct Journal {
    calls: Vec<String>,
    waiting: bool,
}

impl Journal {
    fn record(&mut self, call: impl Into<String>) {
        let call = call.into();
        assert!(
            !self.waiting,
            "{} invoked while a readiness wait is outstanding",
            call
        );
        self.calls.push(call);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.clone()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| c.as_str() == call).count()
    }

    /// 拆除相关的调用
    pub(crate) fn releases(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter(|c| {
                matches!(
                    c.as_str(),
                    "close_file" | "shutdown_subsystem" | "terminate" | "release_transport"
                )
            })
            .cloned()
            .collect()
    }
}

/// 脚本
#[derive(Clone, Debug, Default)]
pub(crate) struct Script {
    /// 远程文件内容
    pub file: Vec<u8>,
    /// 每次读取最多返回的字节数
    pub max_read: Option<usize>,
    /// 失败注入
    pub fail_at: Option<FailAt>,
    /// 解析结果为空
    pub empty_resolve: bool,
    /// 就绪等待永不返回
    pub stall: bool,
    /// 各操作在完成前依次返回的 WouldBlock 方向
    pub would_block: HashMap<&'static str, VecDeque<Direction>>,
}

impl Script {
    pub(crate) fn serving(file: Vec<u8>) -> Self {
        Self {
            file,
            ..Default::default()
        }
    }

    pub(crate) fn block(mut self, op: &'static str, directions: &[Direction]) -> Self {
        self.would_block
            .entry(op)
            .or_default()
            .extend(directions.iter().copied());
        self
    }

    pub(crate) fn fail(mut self, at: FailAt) -> Self {
        self.fail_at = Some(at);
        self
    }
}

/// 测试后端
pub(crate) struct MockBackend {
    script: Script,
    journal: Rc<RefCell<Journal>>,
}

impl MockBackend {
    pub(crate) fn new(script: Script) -> (Self, Rc<RefCell<Journal>>) {
        let journal = Rc::new(RefCell::new(Journal::default()));
        (
            Self {
                script,
                journal: journal.clone(),
            },
            journal,
        )
    }
}

#[async_trait(?Send)]
impl Backend for MockBackend {
    type Transport = MockTransport;
    type Session = MockSession;

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, TransferError> {
        self.journal.borrow_mut().record("resolve");
        if self.script.fail_at == Some(FailAt::Resolve) {
            return Err(TransferError::Resolve(format!("{}: injected", host)));
        }
        if self.script.empty_resolve {
            return Ok(Vec::new());
        }
        Ok(vec![SocketAddr::from(([127, 0, 0, 1], port))])
    }

    async fn connect(
        &self,
        endpoints: &[SocketAddr],
        _connect_timeout: Duration,
    ) -> Result<MockTransport, TransferError> {
        self.journal.borrow_mut().record("connect");
        if self.script.fail_at == Some(FailAt::Connect) {
            return Err(TransferError::Connect(format!(
                "{:?}: connection refused",
                endpoints
            )));
        }
        Ok(MockTransport {
            journal: self.journal.clone(),
            stall: self.script.stall,
        })
    }

    fn new_session(&self, _transport: &mut MockTransport) -> Result<MockSession, TransferError> {
        self.journal.borrow_mut().record("new_session");
        Ok(MockSession {
            script: self.script.clone(),
            journal: self.journal.clone(),
            reads: 0,
        })
    }
}

pub(crate) struct MockTransport {
    journal: Rc<RefCell<Journal>>,
    stall: bool,
}

#[async_trait(?Send)]
impl Transport for MockTransport {
    async fn ready(&self, direction: Direction) -> io::Result<()> {
        {
            let mut journal = self.journal.borrow_mut();
            journal.record(format!("wait:{}", direction.as_str()));
            journal.waiting = true;
        }
        // future 被取消丢弃时同样结束等待
        let _guard = WaitGuard(self.journal.clone());
        if self.stall {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;
        Ok(())
    }

    fn close(self) {
        self.journal.borrow_mut().record("release_transport");
    }
}

struct WaitGuard(Rc<RefCell<Journal>>);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.borrow_mut().waiting = false;
    }
}

pub(crate) struct MockSession {
    script: Script,
    journal: Rc<RefCell<Journal>>,
    reads: usize,
}

pub(crate) struct MockFile {
    offset: usize,
}

impl MockSession {
    fn attempt(&mut self, op: &'static str, fail: FailAt) -> Step<()> {
        self.journal.borrow_mut().record(op);
        if let Some(direction) = self
            .script
            .would_block
            .get_mut(op)
            .and_then(|queue| queue.pop_front())
        {
            return Step::WouldBlock(direction);
        }
        if self.script.fail_at == Some(fail) {
            return Step::Fault(format!("{} injected failure", op));
        }
        Step::Complete(())
    }
}

impl ProtocolSession for MockSession {
    type Subsystem = ();
    type File = MockFile;

    fn handshake(&mut self) -> Step<Vec<u8>> {
        self.attempt("handshake", FailAt::Handshake)
            .map(|()| vec![0xde, 0xad, 0xbe, 0xef])
    }

    fn authenticate(&mut self, username: &str, secret: &str) -> Step<()> {
        assert!(!username.is_empty() && !secret.is_empty());
        self.attempt("authenticate", FailAt::Auth)
    }

    fn init_subsystem(&mut self) -> Step<()> {
        self.attempt("init_subsystem", FailAt::Subsystem)
    }

    fn open_file(&mut self, _subsystem: &(), _path: &str) -> Step<MockFile> {
        self.attempt("open_file", FailAt::Open)
            .map(|()| MockFile { offset: 0 })
    }

    fn read(&mut self, file: &mut MockFile, buf: &mut [u8]) -> Step<usize> {
        let step = self.attempt("read", FailAt::Read(self.reads));
        if step != Step::Complete(()) {
            return step.map(|()| 0);
        }
        self.reads += 1;

        let remaining = &self.script.file[file.offset..];
        let limit = self.script.max_read.unwrap_or(usize::MAX);
        let count = remaining.len().min(buf.len()).min(limit);
        buf[..count].copy_from_slice(&remaining[..count]);
        file.offset += count;
        Step::Complete(count)
    }

    fn close_file(&mut self, _file: MockFile) {
        self.journal.borrow_mut().record("close_file");
    }

    fn shutdown_subsystem(&mut self, _subsystem: ()) {
        self.journal.borrow_mut().record("shutdown_subsystem");
    }

    fn terminate(self) {
        self.journal.borrow_mut().record("terminate");
    }
}

/// 生成测试文件内容
pub(crate) fn fixture(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}
