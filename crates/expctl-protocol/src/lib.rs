//! # Experimental Control Protocol
//!
//! 试验控制协议的纯数据层（无 IO 依赖）
//!
//! ## 模块
//!
//! - `command`: 命令目录与响应通道
//! - `size`: 尺寸规格（SizeSpec）
//! - `response`: 试验响应 / 采集响应
//! - `frame`: 远程传输的字帧编解码
//!
//! ## 字节序
//!
//! 远程帧使用小端序：尺寸消息为 `i32` 字，数据帧为 `f64` 字。

pub mod command;
pub mod frame;
pub mod response;
pub mod size;

pub use command::{Channel, Command};
pub use response::{DaqResponse, TrialResponse};
pub use size::{ChannelSizes, SizeSpec};

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unknown opcode word: {0}")]
    UnknownOpcode(f64),

    #[error("Payload too small: {required} words required, {available} available")]
    PayloadTooSmall { required: usize, available: usize },

    #[error("Channel {channel} has length {actual}, expected {expected}")]
    ChannelLength {
        channel: Channel,
        expected: usize,
        actual: usize,
    },

    #[error("Size disagreement on {side}.{channel}: local {local}, remote {remote}")]
    SizeDisagreement {
        side: &'static str,
        channel: Channel,
        local: usize,
        remote: usize,
    },

    #[error("No channel sizes on the {side} side")]
    EmptySizes { side: &'static str },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: &'static str, value: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidLength {
            expected: 200,
            actual: 16,
        };
        assert_eq!(
            err.to_string(),
            "Invalid frame length: expected 200 bytes, got 16"
        );

        let err = ProtocolError::SizeDisagreement {
            side: "daq",
            channel: Channel::Force,
            local: 6,
            remote: 3,
        };
        assert!(err.to_string().contains("daq.force"));
    }
}
