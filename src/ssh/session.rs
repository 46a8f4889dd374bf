// 传输会话上下文
// 持有一次下载的全部可变状态与句柄，直到拆除完成

use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::backend::{Backend, ProtocolSession, Transport};
use super::config::{Credentials, TransferConfig, TransferRequest};
use super::error::TransferError;
use super::event::{Stage, TransferEvent};
use super::step::Direction;
use crate::models::transfer::{TransferItem, TransferReport, TransferStatus};

pub(crate) type SubsystemOf<B> = <<B as Backend>::Session as ProtocolSession>::Subsystem;
pub(crate) type FileOf<B> = <<B as Backend>::Session as ProtocolSession>::File;

/// 传输结果
pub type TransferResult = Result<TransferReport, TransferError>;

/// 传输会话
///
/// 句柄严格按 transport -> protocol -> subsystem -> file 的顺序创建，
/// 拆除时按相反顺序释放，只释放实际创建过的句柄。
pub struct TransferSession<B: Backend> {
    /// 会话 ID
    pub(super) id: String,
    /// 目标主机
    pub(super) host: String,
    /// 远程文件路径
    pub(super) remote_path: String,
    /// 本地保存路径
    pub(super) local_path: PathBuf,
    /// 传输配置
    pub(super) config: TransferConfig,
    /// 登录凭据（认证完成后清空）
    pub(super) credentials: Option<Credentials>,
    /// 本地目标文件（打开远程文件成功后才创建）
    pub(super) sink: Option<File>,
    /// 本地文件是否由本会话创建
    pub(super) sink_created: bool,
    /// 传输层连接
    pub(super) transport: Option<B::Transport>,
    /// 协议会话
    pub(super) protocol: Option<B::Session>,
    /// SFTP 子系统
    pub(super) subsystem: Option<SubsystemOf<B>>,
    /// 远程文件句柄
    pub(super) file: Option<FileOf<B>>,
    /// 当前阶段
    pub(super) stage: Stage,
    /// 正在等待的就绪方向（同一时刻最多一个）
    pub(super) pending: Option<Direction>,
    /// 请求校验失败的原因（启动后立即转入拆除）
    pub(super) rejected: Option<TransferError>,
    /// 导致拆除的错误
    pub(super) fault: Option<TransferError>,
    /// 主机密钥指纹
    pub(super) fingerprint: Vec<u8>,
    /// 读缓冲区
    pub(super) buffer: Vec<u8>,
    /// 完成的读取次数
    pub(super) reads: u64,
    /// 与句柄共享的传输项
    pub(super) item: Rc<RefCell<TransferItem>>,
    /// 事件发送器
    pub(super) events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl<B: Backend> TransferSession<B> {
    /// 创建会话，初始阶段为 Connecting
    pub fn new(request: TransferRequest, item: Rc<RefCell<TransferItem>>) -> Self {
        let id = item.borrow().id.clone();
        let rejected = request.validate().err();
        let buffer = vec![0u8; request.config.chunk_size];

        Self {
            id,
            host: request.host,
            remote_path: request.remote_path,
            local_path: request.local_path,
            config: request.config,
            credentials: Some(request.credentials),
            sink: None,
            sink_created: false,
            transport: None,
            protocol: None,
            subsystem: None,
            file: None,
            stage: Stage::Connecting,
            pending: None,
            rejected,
            fault: None,
            fingerprint: Vec::new(),
            buffer,
            reads: 0,
            item,
            events: None,
        }
    }

    /// 设置事件发送器
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// 获取会话 ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 当前阶段
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// 发送事件
    pub(super) fn emit(&self, event: TransferEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// 进入下一阶段
    pub(super) fn enter(&mut self, stage: Stage) {
        debug!(
            "[Transfer] [{}] {} -> {}",
            self.id,
            self.stage.label_en(),
            stage.label_en()
        );
        self.stage = stage;
        if !stage.is_terminal() {
            self.item.borrow_mut().status = TransferStatus::from_stage(stage);
        }
        self.emit(TransferEvent::StageChanged {
            id: self.id.clone(),
            stage,
        });
    }

    /// 记录错误并转入拆除
    /// 已经在拆除的会话保留第一个错误
    pub(super) fn fail(&mut self, err: TransferError) {
        if self.stage.is_terminal() {
            warn!(
                "[Transfer] [{}] Ignoring error after teardown started: {}",
                self.id, err
            );
            return;
        }

        error!(
            "[Transfer] [{}] {} failed: {}",
            self.id,
            self.stage.label_en(),
            err
        );
        self.fault = Some(err);
        self.enter(Stage::TearingDown);
    }

    /// 登记一次就绪等待
    pub(super) fn begin_wait(&mut self, direction: Direction) {
        assert!(
            self.pending.is_none(),
            "session {} registered a second readiness wait during {:?}",
            self.id,
            self.stage
        );
        self.pending = Some(direction);
    }

    /// 就绪等待结束
    pub(super) fn end_wait(&mut self) {
        self.pending = None;
    }

    /// 创建本地目标文件
    pub(super) fn open_sink(&mut self) -> Result<(), TransferError> {
        let file = File::create(&self.local_path).map_err(|e| {
            TransferError::Sink(format!(
                "Failed to create {}: {}",
                self.local_path.display(),
                e
            ))
        })?;
        self.sink = Some(file);
        self.sink_created = true;
        Ok(())
    }

    /// 写入一块数据
    pub(super) fn write_chunk(&mut self, len: usize) -> Result<(), TransferError> {
        let sink = self
            .sink
            .as_mut()
            .expect("sink is open while streaming");
        sink.write_all(&self.buffer[..len])
            .map_err(|e| TransferError::Sink(format!("Failed to write local file: {}", e)))?;

        let bytes_transferred = {
            let mut item = self.item.borrow_mut();
            item.progress.advance(len as u64);
            item.progress.bytes_transferred
        };
        self.emit(TransferEvent::Progress {
            id: self.id.clone(),
            bytes_transferred,
        });
        Ok(())
    }

    /// 关闭本地目标文件
    fn close_sink(&mut self) -> Result<(), TransferError> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush()
                .and_then(|_| sink.sync_all())
                .map_err(|e| TransferError::Sink(format!("Failed to sync local file: {}", e)))?;
        }
        Ok(())
    }

    /// 拆除：关闭本地文件，逆序释放远程句柄，最后释放连接
    /// 只会执行一次，之后阶段变为 Finished
    pub(super) fn teardown(&mut self) {
        if self.stage == Stage::Finished {
            return;
        }
        if self.stage != Stage::TearingDown {
            self.enter(Stage::TearingDown);
        }

        if let Err(e) = self.close_sink() {
            if self.fault.is_none() {
                self.fault = Some(e);
            }
        }

        if let Some(mut protocol) = self.protocol.take() {
            if let Some(file) = self.file.take() {
                debug!("[SFTP] [{}] Closing remote file", self.id);
                protocol.close_file(file);
            }
            if let Some(subsystem) = self.subsystem.take() {
                debug!("[SFTP] [{}] Shutting down SFTP subsystem", self.id);
                protocol.shutdown_subsystem(subsystem);
            }
            debug!("[SFTP] [{}] Terminating SSH session", self.id);
            protocol.terminate();
        }

        if let Some(transport) = self.transport.take() {
            debug!("[SFTP] [{}] Releasing connection", self.id);
            transport.close();
        }

        // 认证前失败时凭据仍在，这里一并丢弃
        self.credentials = None;

        if self.fault.is_some() && self.sink_created {
            // 删除不完整的文件
            if let Err(e) = std::fs::remove_file(&self.local_path) {
                warn!(
                    "[Transfer] [{}] Failed to remove partial file {}: {}",
                    self.id,
                    self.local_path.display(),
                    e
                );
            }
        }

        self.enter(Stage::Finished);
    }

    /// 生成最终结果（拆除之后调用）
    pub fn into_result(self) -> TransferResult {
        debug_assert_eq!(self.stage, Stage::Finished);

        let mut item = self.item.borrow_mut();
        match self.fault {
            Some(err) => {
                item.set_failed(err.to_string(), err.is_interrupted());
                if let Some(events) = &self.events {
                    let _ = events.send(TransferEvent::Failed {
                        id: self.id.clone(),
                        category: err.category(),
                        error: err.to_string(),
                    });
                }
                Err(err)
            }
            None => {
                item.set_completed();
                let report = TransferReport {
                    id: self.id.clone(),
                    bytes: item.progress.bytes_transferred,
                    reads: self.reads,
                    fingerprint: self.fingerprint,
                    elapsed: item.progress.elapsed(),
                };
                info!(
                    "[Transfer] [{}] Downloaded {} -> {} ({} bytes, {})",
                    self.id,
                    self.remote_path,
                    self.local_path.display(),
                    report.bytes,
                    item.progress.format_speed()
                );
                if let Some(events) = &self.events {
                    let _ = events.send(TransferEvent::Completed {
                        id: self.id.clone(),
                        bytes: report.bytes,
                    });
                }
                Ok(report)
            }
        }
    }
}
