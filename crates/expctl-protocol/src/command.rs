//! 命令目录（Command Catalog）
//!
//! 协议支持的全部逻辑操作。每个命令在远程帧的第 0 个字中以操作码形式出现。

use crate::ProtocolError;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 逻辑命令
///
/// 除 `SetSize`/`Setup` 外，每个命令只读或写一个逻辑量。
/// `Die` 在会话关闭时发送且仅发送一次，之后该会话不能再发出任何命令。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Command {
    /// 尺寸协商（只出现在尺寸消息中）
    SetSize = 1,
    /// 通知试验端初始化
    Setup = 2,
    /// 下发试验响应（trial）
    SetTrialResponse = 3,
    /// 当前步收敛，提交状态
    CommitState = 5,
    /// 读取完整的采集响应（daq）
    GetDaqResponse = 6,
    GetDisp = 7,
    GetVel = 8,
    GetAccel = 9,
    GetForce = 10,
    GetTime = 11,
    /// 释放对端资源
    Die = 99,
}

impl Command {
    /// 全部命令，按操作码排序
    pub const ALL: [Command; 11] = [
        Command::SetSize,
        Command::Setup,
        Command::SetTrialResponse,
        Command::CommitState,
        Command::GetDaqResponse,
        Command::GetDisp,
        Command::GetVel,
        Command::GetAccel,
        Command::GetForce,
        Command::GetTime,
        Command::Die,
    ];

    /// 操作码
    pub fn opcode(self) -> u8 {
        self.into()
    }

    /// 该命令是否期待一个应答帧
    pub fn has_reply(self) -> bool {
        matches!(
            self,
            Command::GetDaqResponse
                | Command::GetDisp
                | Command::GetVel
                | Command::GetAccel
                | Command::GetForce
                | Command::GetTime
        )
    }

    /// 该命令是否携带试验向量作为负载
    pub fn carries_trial(self) -> bool {
        matches!(self, Command::SetTrialResponse)
    }

    /// 单量查询命令对应的通道
    pub fn queried_channel(self) -> Option<Channel> {
        match self {
            Command::GetDisp => Some(Channel::Disp),
            Command::GetVel => Some(Channel::Vel),
            Command::GetAccel => Some(Channel::Accel),
            Command::GetForce => Some(Channel::Force),
            Command::GetTime => Some(Channel::Time),
            _ => None,
        }
    }

    /// 编码为帧中的字（远程帧使用 f64 字）
    pub fn to_word(self) -> f64 {
        f64::from(self.opcode())
    }

    /// 从帧中的字解析命令
    pub fn from_word(word: f64) -> Result<Self, ProtocolError> {
        if !word.is_finite() || word.fract() != 0.0 || !(0.0..=255.0).contains(&word) {
            return Err(ProtocolError::UnknownOpcode(word));
        }
        Command::try_from(word as u8).map_err(|_| ProtocolError::UnknownOpcode(word))
    }
}

/// 响应通道
///
/// 顺序即帧内顺序：disp, vel, accel, force, time。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Channel {
    Disp = 0,
    Vel = 1,
    Accel = 2,
    Force = 3,
    Time = 4,
}

impl Channel {
    pub const COUNT: usize = 5;

    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::Disp,
        Channel::Vel,
        Channel::Accel,
        Channel::Force,
        Channel::Time,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Disp => "disp",
            Channel::Vel => "vel",
            Channel::Accel => "accel",
            Channel::Force => "force",
            Channel::Time => "time",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        assert_eq!(Command::SetSize.opcode(), 1);
        assert_eq!(Command::SetTrialResponse.opcode(), 3);
        assert_eq!(Command::GetDaqResponse.opcode(), 6);
        assert_eq!(Command::GetTime.opcode(), 11);
        assert_eq!(Command::Die.opcode(), 99);
    }

    #[test]
    fn test_from_word_all_commands() {
        for command in Command::ALL {
            assert_eq!(Command::from_word(command.to_word()).unwrap(), command);
        }
    }

    #[test]
    fn test_from_word_rejects_garbage() {
        assert!(Command::from_word(4.0).is_err());
        assert!(Command::from_word(3.5).is_err());
        assert!(Command::from_word(-1.0).is_err());
        assert!(Command::from_word(f64::NAN).is_err());
        assert!(Command::from_word(1000.0).is_err());
    }

    #[test]
    fn test_reply_classification() {
        let with_reply: Vec<_> = Command::ALL.iter().filter(|c| c.has_reply()).collect();
        assert_eq!(with_reply.len(), 6);
        assert!(!Command::SetTrialResponse.has_reply());
        assert!(!Command::CommitState.has_reply());
        assert!(!Command::Die.has_reply());
        assert_eq!(Command::GetForce.queried_channel(), Some(Channel::Force));
        assert_eq!(Command::GetDaqResponse.queried_channel(), None);
    }
}
