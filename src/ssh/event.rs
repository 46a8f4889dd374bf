// 传输阶段与事件定义

use super::error::FaultCategory;

/// 传输阶段
/// 严格按声明顺序推进，任何阶段失败都直接进入 TearingDown
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// 解析主机并建立 TCP 连接
    Connecting = 0,
    /// SSH 握手（密钥交换）
    Handshaking = 1,
    /// 身份认证
    Authenticating = 2,
    /// 打开 SFTP 子系统
    InitSubsystem = 3,
    /// 打开远程文件
    OpeningFile = 4,
    /// 循环读取文件内容
    Streaming = 5,
    /// 按逆序释放句柄
    TearingDown = 6,
    /// 已结束（完成回调已触发）
    Finished = 7,
}

impl Stage {
    /// 获取阶段的本地化名称（英文）
    pub fn label_en(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Handshaking => "SSH handshake",
            Self::Authenticating => "Authenticating",
            Self::InitSubsystem => "Starting SFTP subsystem",
            Self::OpeningFile => "Opening remote file",
            Self::Streaming => "Receiving file",
            Self::TearingDown => "Tearing down",
            Self::Finished => "Finished",
        }
    }

    /// 成功路径上的下一阶段
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Connecting => Some(Self::Handshaking),
            Self::Handshaking => Some(Self::Authenticating),
            Self::Authenticating => Some(Self::InitSubsystem),
            Self::InitSubsystem => Some(Self::OpeningFile),
            Self::OpeningFile => Some(Self::Streaming),
            Self::Streaming => Some(Self::TearingDown),
            Self::TearingDown => Some(Self::Finished),
            Self::Finished => None,
        }
    }

    /// 是否已进入拆除或结束
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TearingDown | Self::Finished)
    }
}

/// 传输事件（供调用方展示进度）
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    /// 阶段变化
    StageChanged { id: String, stage: Stage },
    /// 握手完成后的主机指纹（仅供查看，不做校验）
    Fingerprint { id: String, fingerprint: String },
    /// 已写入本地的字节数
    Progress { id: String, bytes_transferred: u64 },
    /// 传输成功
    Completed { id: String, bytes: u64 },
    /// 传输失败
    Failed {
        id: String,
        category: FaultCategory,
        error: String,
    },
}
