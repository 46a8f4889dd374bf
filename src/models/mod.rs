// 数据模型模块

pub mod transfer;

pub use transfer::{TransferItem, TransferProgress, TransferReport, TransferStatus};
