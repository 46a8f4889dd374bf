// 阶段调度
//
// 会话是一个显式状态机：Stage 记录当前阶段，dispatch 每次只执行当前阶段的一次尝试。
// 尝试返回 WouldBlock 时，run_transfer 在套接字就绪后重新 dispatch 同一阶段；
// 这是整个流程唯一的挂起点。

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::backend::{Backend, ProtocolSession};
use super::config::EofPolicy;
use super::error::TransferError;
use super::event::{Stage, TransferEvent};
use super::session::{TransferResult, TransferSession};
use super::step::{Direction, Step};
use crate::models::transfer::format_fingerprint;

/// 一次调度之后的动作
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Next {
    /// 立即继续调度（阶段已推进，或需要马上再读一块）
    Continue,
    /// 等待套接字就绪后重试当前阶段
    Wait(Direction),
    /// 拆除完成
    Done,
}

impl<B: Backend> TransferSession<B> {
    /// 连接阶段：解析、TCP 连接、创建非阻塞协议会话
    pub(super) async fn connect(&mut self, backend: &B) -> Result<(), TransferError> {
        info!(
            "[SFTP] [{}] Connecting to {}:{}...",
            self.id, self.host, self.config.port
        );

        let endpoints = backend.resolve(&self.host, self.config.port).await?;
        if endpoints.is_empty() {
            return Err(TransferError::Resolve(format!(
                "No endpoints found for {}",
                self.host
            )));
        }

        let transport = backend
            .connect(&endpoints, self.config.connect_timeout())
            .await?;
        info!("[SFTP] [{}] TCP connection established", self.id);
        let transport = self.transport.insert(transport);

        let protocol = backend.new_session(transport)?;
        self.protocol = Some(protocol);
        Ok(())
    }

    /// 执行当前阶段的一次尝试
    pub(super) fn dispatch(&mut self) -> Next {
        assert!(
            self.pending.is_none(),
            "session {} dispatched {:?} while a readiness wait is outstanding",
            self.id,
            self.stage
        );

        match self.stage {
            Stage::Connecting => unreachable!("connect stage is driven by run_transfer"),
            Stage::Handshaking => self.handshake(),
            Stage::Authenticating => self.authenticate(),
            Stage::InitSubsystem => self.init_subsystem(),
            Stage::OpeningFile => self.open_file(),
            Stage::Streaming => self.stream(),
            Stage::TearingDown => {
                self.teardown();
                Next::Done
            }
            Stage::Finished => Next::Done,
        }
    }

    /// 统一处理三态结果：完成返回值，WouldBlock 交给调用者等待，失败转入拆除
    fn settle<T>(
        &mut self,
        step: Step<T>,
        fault: impl FnOnce(String) -> TransferError,
    ) -> Result<T, Next> {
        match step {
            Step::Complete(value) => Ok(value),
            Step::WouldBlock(direction) => {
                debug!(
                    "[SFTP] [{}] {} would block on {}",
                    self.id,
                    self.stage.label_en(),
                    direction.as_str()
                );
                Err(Next::Wait(direction))
            }
            Step::Fault(message) => {
                self.fail(fault(message));
                Err(Next::Continue)
            }
        }
    }

    fn handshake(&mut self) -> Next {
        let protocol = self
            .protocol
            .as_mut()
            .expect("protocol session exists after connect");
        let step = protocol.handshake();
        let fingerprint = match self.settle(step, TransferError::Handshake) {
            Ok(fingerprint) => fingerprint,
            Err(next) => return next,
        };

        // 指纹只记录，不校验
        let fingerprint_hex = format_fingerprint(&fingerprint);
        info!(
            "[SFTP] [{}] Server key fingerprint: {}",
            self.id, fingerprint_hex
        );
        self.emit(TransferEvent::Fingerprint {
            id: self.id.clone(),
            fingerprint: fingerprint_hex,
        });
        self.fingerprint = fingerprint;

        self.enter(Stage::Authenticating);
        Next::Continue
    }

    fn authenticate(&mut self) -> Next {
        let credentials = self
            .credentials
            .as_ref()
            .expect("credentials are kept until authenticated");
        let protocol = self
            .protocol
            .as_mut()
            .expect("protocol session exists after connect");
        let step = protocol.authenticate(&credentials.username, &credentials.secret);
        if let Err(next) = self.settle(step, TransferError::Auth) {
            return next;
        }

        info!("[SFTP] [{}] Authentication successful", self.id);
        self.credentials = None;
        self.enter(Stage::InitSubsystem);
        Next::Continue
    }

    fn init_subsystem(&mut self) -> Next {
        let protocol = self
            .protocol
            .as_mut()
            .expect("protocol session exists after connect");
        let step = protocol.init_subsystem();
        let subsystem = match self.settle(step, TransferError::SubsystemInit) {
            Ok(subsystem) => subsystem,
            Err(next) => return next,
        };

        debug!("[SFTP] [{}] SFTP subsystem ready", self.id);
        self.subsystem = Some(subsystem);
        self.enter(Stage::OpeningFile);
        Next::Continue
    }

    fn open_file(&mut self) -> Next {
        let protocol = self
            .protocol
            .as_mut()
            .expect("protocol session exists after connect");
        let subsystem = self
            .subsystem
            .as_ref()
            .expect("subsystem exists before opening the file");
        let step = protocol.open_file(subsystem, &self.remote_path);
        let file = match self.settle(step, TransferError::Open) {
            Ok(file) => file,
            Err(next) => return next,
        };

        debug!("[SFTP] [{}] Opened {}", self.id, self.remote_path);
        self.file = Some(file);

        if let Err(e) = self.open_sink() {
            self.fail(e);
            return Next::Continue;
        }

        self.item.borrow_mut().progress.start();
        self.enter(Stage::Streaming);
        Next::Continue
    }

    fn stream(&mut self) -> Next {
        let protocol = self
            .protocol
            .as_mut()
            .expect("protocol session exists after connect");
        let file = self.file.as_mut().expect("file is open while streaming");
        let step = protocol.read(file, &mut self.buffer);
        let count = match self.settle(step, TransferError::Read) {
            Ok(count) => count,
            Err(next) => return next,
        };
        self.reads += 1;

        if count == 0 {
            debug!("[SFTP] [{}] Reached end of file", self.id);
            self.enter(Stage::TearingDown);
            return Next::Continue;
        }

        if let Err(e) = self.write_chunk(count) {
            self.fail(e);
            return Next::Continue;
        }

        let capacity = self.buffer.len();
        if count < capacity && self.config.eof_policy == EofPolicy::ShortRead {
            debug!(
                "[SFTP] [{}] Short read ({} < {}), transfer complete",
                self.id, count, capacity
            );
            self.enter(Stage::TearingDown);
        }

        // 读满一块时立即再读，不等待就绪
        Next::Continue
    }
}

/// 驱动一个会话直到拆除完成
///
/// 取消令牌和整体期限在每次调度前、每次登记就绪等待前检查，
/// 等待期间也会与就绪事件竞争。
pub async fn run_transfer<B: Backend>(
    backend: B,
    mut session: TransferSession<B>,
    cancel: CancellationToken,
) -> TransferResult {
    let deadline = session.config.timeout().map(|t| Instant::now() + t);
    let timeout_secs = session.config.timeout_secs.unwrap_or_default();

    session.enter(Stage::Connecting);
    if let Some(e) = session.rejected.take() {
        session.fail(e);
    }

    loop {
        if !session.stage.is_terminal() {
            if let Some(err) = interruption(&cancel, deadline, timeout_secs) {
                session.fail(err);
            }
        }

        let next = match session.stage {
            Stage::Connecting => {
                let connected = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TransferError::Cancelled),
                    _ = wait_deadline(deadline) => Err(TransferError::Timeout(timeout_secs)),
                    result = session.connect(&backend) => result,
                };
                match connected {
                    Ok(()) => session.enter(Stage::Handshaking),
                    Err(e) => session.fail(e),
                }
                Next::Continue
            }
            _ => session.dispatch(),
        };

        match next {
            Next::Continue => {}
            Next::Done => break,
            Next::Wait(direction) => {
                if let Some(err) = interruption(&cancel, deadline, timeout_secs) {
                    session.fail(err);
                    continue;
                }

                session.begin_wait(direction);
                let ready = wait_ready(&session, direction, &cancel, deadline, timeout_secs).await;
                session.end_wait();

                if let Err(e) = ready {
                    session.fail(e);
                }
            }
        }
    }

    session.into_result()
}

/// 等待套接字就绪，同时响应取消与超时
async fn wait_ready<B: Backend>(
    session: &TransferSession<B>,
    direction: Direction,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    timeout_secs: u64,
) -> Result<(), TransferError> {
    use super::backend::Transport;

    let transport = session
        .transport
        .as_ref()
        .expect("transport exists while waiting for readiness");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        _ = wait_deadline(deadline) => Err(TransferError::Timeout(timeout_secs)),
        ready = transport.ready(direction) => ready.map_err(TransferError::from),
    }
}

/// 检查取消与超时
fn interruption(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    timeout_secs: u64,
) -> Option<TransferError> {
    if cancel.is_cancelled() {
        return Some(TransferError::Cancelled);
    }
    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        return Some(TransferError::Timeout(timeout_secs));
    }
    None
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::{Path, PathBuf};
    use std::rc::Rc;

    use super::*;
    use crate::models::transfer::{TransferItem, TransferStatus};
    use crate::ssh::config::{TransferConfig, TransferRequest};
    use crate::ssh::error::FaultCategory;
    use crate::ssh::testing::{fixture, FailAt, Journal, MockBackend, Script};

    fn request(dir: &Path, config: TransferConfig) -> TransferRequest {
        TransferRequest::new(
            "sftp.example.com",
            "/srv/export/data.bin",
            dir.join("data.bin"),
            "alice",
            "s3cret",
        )
        .with_config(config)
    }

    fn session(request: TransferRequest) -> TransferSession<MockBackend> {
        let item = Rc::new(RefCell::new(TransferItem::new_download(
            request.remote_path.clone(),
            request.local_path.clone(),
        )));
        TransferSession::new(request, item)
    }

    async fn download(
        script: Script,
        config: TransferConfig,
        dir: &Path,
    ) -> (TransferResult, Rc<RefCell<Journal>>, PathBuf) {
        let (backend, journal) = MockBackend::new(script);
        let request = request(dir, config);
        let local_path = request.local_path.clone();
        let result = run_transfer(backend, session(request), CancellationToken::new()).await;
        (result, journal, local_path)
    }

    fn calls(journal: &Rc<RefCell<Journal>>) -> Vec<String> {
        journal.borrow().calls()
    }

    #[tokio::test]
    async fn test_download_10000_bytes_in_three_reads() {
        let dir = tempfile::tempdir().unwrap();
        let data = fixture(10_000);
        let (result, journal, local_path) =
            download(Script::serving(data.clone()), TransferConfig::default(), dir.path()).await;

        let report = result.unwrap();
        assert_eq!(report.bytes, 10_000);
        assert_eq!(report.reads, 3);
        assert_eq!(report.fingerprint, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(journal.borrow().count("read"), 3);
        assert_eq!(std::fs::read(&local_path).unwrap(), data);
        assert_eq!(
            journal.borrow().releases(),
            ["close_file", "shutdown_subsystem", "terminate", "release_transport"]
        );
    }

    #[tokio::test]
    async fn test_chunk_boundaries() {
        for (size, reads) in [(0, 1), (4095, 1), (4096, 2), (4097, 2), (8192, 3)] {
            let dir = tempfile::tempdir().unwrap();
            let data = fixture(size);
            let (result, _, local_path) =
                download(Script::serving(data.clone()), TransferConfig::default(), dir.path())
                    .await;

            let report = result.unwrap();
            assert_eq!(report.bytes, size as u64, "size {}", size);
            assert_eq!(report.reads, reads, "size {}", size);
            assert_eq!(std::fs::read(&local_path).unwrap(), data, "size {}", size);
        }
    }

    #[tokio::test]
    async fn test_zero_read_policy_reads_until_empty() {
        let dir = tempfile::tempdir().unwrap();
        let data = fixture(10_000);
        let config = TransferConfig {
            eof_policy: EofPolicy::ZeroRead,
            ..Default::default()
        };
        let (result, _, local_path) =
            download(Script::serving(data.clone()), config, dir.path()).await;

        let report = result.unwrap();
        assert_eq!(report.reads, 4);
        assert_eq!(std::fs::read(&local_path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_short_reads_from_server() {
        let data = fixture(10_000);
        let script = Script {
            max_read: Some(1000),
            ..Script::serving(data.clone())
        };

        // 默认策略把第一次短读当作结束
        let dir = tempfile::tempdir().unwrap();
        let (result, _, local_path) =
            download(script.clone(), TransferConfig::default(), dir.path()).await;
        assert_eq!(result.unwrap().bytes, 1000);
        assert_eq!(std::fs::read(&local_path).unwrap(), &data[..1000]);

        let dir = tempfile::tempdir().unwrap();
        let config = TransferConfig {
            eof_policy: EofPolicy::ZeroRead,
            ..Default::default()
        };
        let (result, _, local_path) = download(script, config, dir.path()).await;
        assert_eq!(result.unwrap().reads, 11);
        assert_eq!(std::fs::read(&local_path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_would_block_retries_same_stage() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script::serving(fixture(100))
            .block("handshake", &[Direction::Read, Direction::Read])
            .block("authenticate", &[Direction::Write])
            .block("init_subsystem", &[Direction::Both])
            .block("open_file", &[Direction::Write])
            .block("read", &[Direction::Read]);
        let (result, journal, _) = download(script, TransferConfig::default(), dir.path()).await;

        assert_eq!(result.unwrap().bytes, 100);
        assert_eq!(
            calls(&journal),
            [
                "resolve",
                "connect",
                "new_session",
                "handshake",
                "wait:read",
                "handshake",
                "wait:read",
                "handshake",
                "authenticate",
                "wait:write",
                "authenticate",
                "init_subsystem",
                "wait:read|write",
                "init_subsystem",
                "open_file",
                "wait:write",
                "open_file",
                "read",
                "wait:read",
                "read",
                "close_file",
                "shutdown_subsystem",
                "terminate",
                "release_transport",
            ]
        );
    }

    #[tokio::test]
    async fn test_fault_in_each_stage_releases_created_handles() {
        let cases: [(FailAt, FaultCategory, &[&str]); 8] = [
            (FailAt::Resolve, FaultCategory::Resolve, &[]),
            (FailAt::Connect, FaultCategory::Connect, &[]),
            (
                FailAt::Handshake,
                FaultCategory::Handshake,
                &["terminate", "release_transport"],
            ),
            (
                FailAt::Auth,
                FaultCategory::Auth,
                &["terminate", "release_transport"],
            ),
            (
                FailAt::Subsystem,
                FaultCategory::SubsystemInit,
                &["terminate", "release_transport"],
            ),
            (
                FailAt::Open,
                FaultCategory::Open,
                &["shutdown_subsystem", "terminate", "release_transport"],
            ),
            (
                FailAt::Read(0),
                FaultCategory::Read,
                &["close_file", "shutdown_subsystem", "terminate", "release_transport"],
            ),
            (
                FailAt::Read(1),
                FaultCategory::Read,
                &["close_file", "shutdown_subsystem", "terminate", "release_transport"],
            ),
        ];

        for (fail_at, category, releases) in cases {
            let dir = tempfile::tempdir().unwrap();
            let script = Script::serving(fixture(10_000)).fail(fail_at);
            let (result, journal, local_path) =
                download(script, TransferConfig::default(), dir.path()).await;

            let err = result.unwrap_err();
            assert_eq!(err.category(), category, "{:?}", fail_at);
            assert_eq!(journal.borrow().releases(), releases, "{:?}", fail_at);
            // 不完整的本地文件已删除
            assert!(!local_path.exists(), "{:?}", fail_at);
        }
    }

    #[tokio::test]
    async fn test_empty_resolution_is_resolve_fault() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            empty_resolve: true,
            ..Script::serving(fixture(10))
        };
        let (result, journal, _) = download(script, TransferConfig::default(), dir.path()).await;

        assert_eq!(result.unwrap_err().category(), FaultCategory::Resolve);
        assert_eq!(calls(&journal), ["resolve"]);
    }

    #[tokio::test]
    async fn test_sink_failure_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, journal) = MockBackend::new(Script::serving(fixture(10)));
        let request = TransferRequest::new(
            "sftp.example.com",
            "/srv/export/data.bin",
            dir.path().join("missing").join("data.bin"),
            "alice",
            "s3cret",
        );
        let result = run_transfer(backend, session(request), CancellationToken::new()).await;

        assert_eq!(result.unwrap_err().category(), FaultCategory::Sink);
        assert_eq!(journal.borrow().count("read"), 0);
        assert_eq!(
            journal.borrow().releases(),
            ["close_file", "shutdown_subsystem", "terminate", "release_transport"]
        );
    }

    #[tokio::test]
    async fn test_invalid_request_fails_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, journal) = MockBackend::new(Script::serving(fixture(10)));
        let mut request = request(dir.path(), TransferConfig::default());
        request.host.clear();
        let result = run_transfer(backend, session(request), CancellationToken::new()).await;

        assert_eq!(result.unwrap_err().category(), FaultCategory::Config);
        assert!(calls(&journal).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, journal) = MockBackend::new(Script::serving(fixture(10)));
        let request = request(dir.path(), TransferConfig::default());
        let item = Rc::new(RefCell::new(TransferItem::new_download(
            request.remote_path.clone(),
            request.local_path.clone(),
        )));
        let cancel = item.borrow().cancel_token.clone();
        cancel.cancel();

        let result = run_transfer(backend, TransferSession::new(request, item.clone()), cancel).await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(calls(&journal).is_empty());
        assert_eq!(item.borrow().status, TransferStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_readiness_wait() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            stall: true,
            ..Script::serving(fixture(10)).block("handshake", &[Direction::Read])
        };
        let (backend, journal) = MockBackend::new(script);
        let cancel = CancellationToken::new();
        let run = run_transfer(
            backend,
            session(request(dir.path(), TransferConfig::default())),
            cancel.clone(),
        );

        let (result, ()) = tokio::join!(run, async {
            tokio::task::yield_now().await;
            cancel.cancel();
        });

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(journal.borrow().count("handshake"), 1);
        assert_eq!(
            journal.borrow().releases(),
            ["terminate", "release_transport"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_during_readiness_wait() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script {
            stall: true,
            ..Script::serving(fixture(10)).block("authenticate", &[Direction::Write])
        };
        let config = TransferConfig {
            timeout_secs: Some(5),
            ..Default::default()
        };
        let (result, journal, _) = download(script, config, dir.path()).await;

        assert!(matches!(result, Err(TransferError::Timeout(5))));
        assert_eq!(
            journal.borrow().releases(),
            ["terminate", "release_transport"]
        );
    }

    #[tokio::test]
    async fn test_dispatch_advances_one_stage_and_drops_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _) = MockBackend::new(Script::serving(fixture(10)));
        let mut session = session(request(dir.path(), TransferConfig::default()));

        session.connect(&backend).await.unwrap();
        session.enter(Stage::Handshaking);

        assert_eq!(session.dispatch(), Next::Continue);
        assert_eq!(session.stage(), Stage::Authenticating);
        assert!(session.credentials.is_some());

        assert_eq!(session.dispatch(), Next::Continue);
        assert_eq!(session.stage(), Stage::InitSubsystem);
        assert!(session.credentials.is_none());

        // 远程文件打开之前不创建本地文件
        assert_eq!(session.dispatch(), Next::Continue);
        assert!(!session.local_path.exists());
        assert_eq!(session.dispatch(), Next::Continue);
        assert_eq!(session.stage(), Stage::Streaming);
        assert!(session.local_path.exists());
    }

    #[test]
    #[should_panic(expected = "readiness wait is outstanding")]
    fn test_dispatch_while_waiting_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(request(dir.path(), TransferConfig::default()));
        session.enter(Stage::Handshaking);
        session.begin_wait(Direction::Read);
        session.dispatch();
    }
}
