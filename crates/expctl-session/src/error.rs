//! 会话错误类型
//!
//! 与传输层错误分层：连接失败、尺寸不一致、传输 I/O、协议违例、会话已关闭。
//! 传输错误通过 `From` 归类，致命与否由 [`TransportError::is_fatal`] 决定。

use expctl_protocol::{Channel, ProtocolError, SizeSpec};
use expctl_transport::TransportError;
use thiserror::Error;

/// 控制会话错误
#[derive(Debug, Error)]
pub enum SessionError {
    /// 无法建立传输
    #[error("Connect error: {0}")]
    Connect(#[source] TransportError),

    /// 双方尺寸不一致（setup 失败，会话保持 Unconfigured）
    #[error("Size mismatch: local {local:?}, remote {remote:?}")]
    SizeMismatch { local: SizeSpec, remote: SizeSpec },

    /// 连接建立后的发送/接收失败（会话已关闭）
    #[error("Transport I/O error: {0}")]
    TransportIo(#[source] TransportError),

    /// 调用顺序错误（编程错误）
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Session closed")]
    SessionClosed,

    /// 调用方提供的向量长度与协商尺寸不符
    #[error("Invalid {channel} vector: expected {expected} values, got {actual}")]
    InvalidVector {
        channel: Channel,
        expected: usize,
        actual: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// 该错误发生后会话是否已关闭
    pub fn closes_session(&self) -> bool {
        matches!(self, SessionError::TransportIo(_) | SessionError::SessionClosed)
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect { .. } => SessionError::Connect(err),
            TransportError::SizeMismatch { local, remote } => {
                SessionError::SizeMismatch { local, remote }
            },
            TransportError::ProtocolViolation(msg) => SessionError::ProtocolViolation(msg),
            TransportError::Config(msg) => SessionError::Config(msg),
            TransportError::Closed => SessionError::SessionClosed,
            TransportError::Protocol(ProtocolError::ChannelLength {
                channel,
                expected,
                actual,
            }) => SessionError::InvalidVector {
                channel,
                expected,
                actual,
            },
            other => SessionError::TransportIo(other),
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(err: ProtocolError) -> Self {
        SessionError::from(TransportError::Protocol(err))
    }
}
