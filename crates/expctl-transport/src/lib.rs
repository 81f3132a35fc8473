//! # Experimental Control Transport Layer
//!
//! 传输抽象层：控制会话只依赖 [`Transport`] trait，不关心具体通道。
//!
//! ## 后端
//!
//! - [`remote`]: 基于 TCP（可选 TLS）的请求/应答字帧通道
//! - [`shmem`]: 基于共享（反射）内存的三标志握手通道
//!
//! ## 单请求约束
//!
//! `send` 与匹配的 `recv` 构成一个原子请求。在 `recv` 完成之前再次 `send`
//! 是编程错误，立即返回 [`TransportError::ProtocolViolation`]，不会交错执行。

use expctl_protocol::{Command, DaqResponse, ProtocolError, SizeSpec, TrialResponse};
use thiserror::Error;
use tracing::debug;

pub mod remote;
pub mod shmem;

pub use remote::{RemoteConfig, RemoteTransport};
pub use shmem::{SharedMemoryConfig, SharedMemoryTransport};

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Size mismatch: local {local:?}, remote {remote:?}")]
    SizeMismatch { local: SizeSpec, remote: SizeSpec },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Operation timeout")]
    Timeout,
    #[error("Shared memory region error: {0}")]
    Region(String),
    #[error("Invalid transport configuration: {0}")]
    Config(String),
    #[error("Transport not connected")]
    NotConnected,
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// 连接建立后发生的、使会话无法继续的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_)
                | TransportError::Tls(_)
                | TransportError::Protocol(_)
                | TransportError::Timeout
                | TransportError::Region(_)
                | TransportError::NotConnected
                | TransportError::Closed
        )
    }

    /// IO 错误归类：读写超时单独报告为 `Timeout`
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                TransportError::Timeout
            },
            _ => TransportError::Io(err),
        }
    }
}

/// 传输种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Remote,
    SharedMemory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Remote => f.write_str("remote"),
            TransportKind::SharedMemory => f.write_str("shared-memory"),
        }
    }
}

/// 传输抽象
///
/// 所有方法都是阻塞的；协议本身不施加超时。
pub trait Transport {
    fn kind(&self) -> TransportKind;

    /// 建立通道
    fn connect(&mut self) -> Result<(), TransportError>;

    /// 协商尺寸，返回双方同意的 SizeSpec；对端拒绝时返回 `SizeMismatch`
    fn negotiate_size(&mut self, sizes: SizeSpec) -> Result<SizeSpec, TransportError>;

    /// 发出一个命令（`SetTrialResponse` 携带 `payload`）
    fn send(
        &mut self,
        command: Command,
        payload: Option<&TrialResponse>,
    ) -> Result<(), TransportError>;

    /// 接收与上一个 `send` 匹配的应答
    fn recv(&mut self, command: Command) -> Result<DaqResponse, TransportError>;

    /// 释放对端资源（远程发送 `Die`，共享内存复位标志）并关闭通道
    ///
    /// 重复调用是空操作。
    fn close(&mut self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        (**self).connect()
    }

    fn negotiate_size(&mut self, sizes: SizeSpec) -> Result<SizeSpec, TransportError> {
        (**self).negotiate_size(sizes)
    }

    fn send(
        &mut self,
        command: Command,
        payload: Option<&TrialResponse>,
    ) -> Result<(), TransportError> {
        (**self).send(command, payload)
    }

    fn recv(&mut self, command: Command) -> Result<DaqResponse, TransportError> {
        (**self).recv(command)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}

/// 借用的传输：关闭时不释放对端资源，由所有者负责
impl<T: Transport + ?Sized> Transport for &mut T {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        (**self).connect()
    }

    fn negotiate_size(&mut self, sizes: SizeSpec) -> Result<SizeSpec, TransportError> {
        (**self).negotiate_size(sizes)
    }

    fn send(
        &mut self,
        command: Command,
        payload: Option<&TrialResponse>,
    ) -> Result<(), TransportError> {
        (**self).send(command, payload)
    }

    fn recv(&mut self, command: Command) -> Result<DaqResponse, TransportError> {
        (**self).recv(command)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        debug!("Borrowed {} transport released without teardown", self.kind());
        Ok(())
    }
}

/// 单请求跟踪器
///
/// 记录正在等待应答的命令。只有带应答的命令会占用请求槽位，
/// 但槽位被占用时任何 `send` 都会被拒绝。
#[derive(Debug, Default)]
pub struct RequestTracker {
    outstanding: Option<Command>,
    closed: bool,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始一个请求
    pub fn begin(&mut self, command: Command) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if let Some(pending) = self.outstanding {
            return Err(TransportError::ProtocolViolation(format!(
                "{:?} issued while {:?} is still awaiting its reply",
                command, pending
            )));
        }
        if command.has_reply() {
            self.outstanding = Some(command);
        }
        Ok(())
    }

    /// 完成请求；`command` 必须与正在等待的命令一致
    pub fn complete(&mut self, command: Command) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.outstanding {
            Some(pending) if pending == command => {
                self.outstanding = None;
                Ok(())
            },
            Some(pending) => Err(TransportError::ProtocolViolation(format!(
                "recv({:?}) does not match outstanding {:?}",
                command, pending
            ))),
            None => Err(TransportError::ProtocolViolation(format!(
                "recv({:?}) without a matching send",
                command
            ))),
        }
    }

    pub fn outstanding(&self) -> Option<Command> {
        self.outstanding
    }

    /// IO 失败后丢弃未完成的请求
    pub fn abort(&mut self) {
        self.outstanding = None;
    }

    pub fn mark_closed(&mut self) {
        self.outstanding = None;
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
