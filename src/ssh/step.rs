// 非阻塞操作的三态结果
//
// 每个协议原语只会返回三种结果之一：完成、需要等待套接字就绪、失败。
// 驱动层据此统一处理重试，不再按阶段各写一遍 EAGAIN 判断。

use tokio::io::Interest;

/// 等待的套接字就绪方向
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// 等待可读
    Read,
    /// 等待可写
    Write,
    /// 任一方向就绪即可
    Both,
}

impl Direction {
    /// 转换为 tokio 的 Interest
    pub fn interest(&self) -> Interest {
        match self {
            Self::Read => Interest::READABLE,
            Self::Write => Interest::WRITABLE,
            Self::Both => Interest::READABLE | Interest::WRITABLE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Both => "read|write",
        }
    }
}

/// 单次非阻塞尝试的结果
#[derive(Debug, PartialEq, Eq)]
pub enum Step<T> {
    /// 操作完成
    Complete(T),
    /// 尚未就绪，需在指定方向就绪后原样重试
    WouldBlock(Direction),
    /// 不可恢复的失败（附带底层库的错误信息）
    Fault(String),
}

impl<T> Step<T> {
    /// 对完成值做映射，保持另外两种状态不变
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Step::Complete(value) => Step::Complete(f(value)),
            Step::WouldBlock(direction) => Step::WouldBlock(direction),
            Step::Fault(message) => Step::Fault(message),
        }
    }
}
