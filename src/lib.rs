// sftp-fetch - 非阻塞 SFTP 单文件下载
// 库入口

pub mod models;
pub mod services;
pub mod ssh;

pub use models::transfer::{TransferItem, TransferProgress, TransferReport, TransferStatus};
pub use ssh::{
    begin_transfer, EventLoop, TransferConfig, TransferError, TransferHandle, TransferRequest,
    TransferResult,
};
