//! 远程传输（socket 绑定）
//!
//! 通过 TCP（可选 TLS）连接到试验端，按定长字帧进行请求/应答。
//!
//! ## 流程
//!
//! 1. `connect`: 建立 TCP 连接（安全模式下完成 TLS 握手）
//! 2. `negotiate_size`: 发送尺寸消息，读取对端的尺寸消息并比对
//! 3. 每个请求：第 0 个字写操作码，其余字写试验向量，整帧发送；
//!    带应答的命令阻塞直到完整读取应答帧
//! 4. `close`: 发送 `Die`（失败只记录日志），释放 socket

pub mod site;
pub mod tls;

pub use site::{EchoRig, SiteConnection, SiteHandler, SiteListener, SiteStats};
pub use tls::{TlsOptions, TlsRoots};

use crate::{RequestTracker, Transport, TransportError, TransportKind};
use bytes::BytesMut;
use expctl_protocol::frame::{self, SIZE_MESSAGE_BYTES};
use expctl_protocol::{Command, DaqResponse, SizeSpec, TrialResponse};
use rustls::{ClientConnection, StreamOwned};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 未指定地址时使用的回环地址
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// 远程传输配置
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// 设置后使用安全通道
    pub tls: Option<TlsOptions>,
    /// 帧字数下限（实际字数不小于 `4 * numDOF + 1` 形式的最小值）
    pub data_size: usize,
    /// socket 读写超时；`None` 表示一直阻塞
    pub io_timeout: Option<Duration>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: 8090,
            tls: None,
            data_size: 0,
            io_timeout: None,
        }
    }
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_data_size(mut self, data_size: usize) -> Self {
        self.data_size = data_size;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn addr(&self) -> String {
        let host = if self.host.is_empty() {
            DEFAULT_HOST
        } else {
            &self.host
        };
        format!("{}:{}", host, self.port)
    }
}

/// 明文或加密的字节流
enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn shutdown(&mut self) {
        match self {
            Stream::Plain(tcp) => {
                let _ = tcp.shutdown(Shutdown::Both);
            },
            Stream::Tls(tls) => {
                tls.conn.send_close_notify();
                let _ = tls.flush();
                let _ = tls.sock.shutdown(Shutdown::Both);
            },
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.read(buf),
            Stream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.write(buf),
            Stream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(tcp) => tcp.flush(),
            Stream::Tls(tls) => tls.flush(),
        }
    }
}

/// 远程传输
///
/// 每个会话独占一个实例；发送和接收缓冲区归实例所有，按协商后的字数分配。
pub struct RemoteTransport {
    config: RemoteConfig,
    stream: Option<Stream>,
    /// 协商后的尺寸
    sizes: Option<SizeSpec>,
    /// 协商后的帧字数
    words: usize,
    /// 已发出的尺寸提议；协商失败时 `Die` 仍按它编码
    proposed: Option<(SizeSpec, usize)>,
    tx_buf: BytesMut,
    rx_buf: Vec<u8>,
    tracker: RequestTracker,
}

impl RemoteTransport {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            stream: None,
            sizes: None,
            words: 0,
            proposed: None,
            tx_buf: BytesMut::new(),
            rx_buf: Vec::new(),
            tracker: RequestTracker::new(),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// 协商后的帧字数（未协商时为 0）
    pub fn payload_words(&self) -> usize {
        self.words
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> Result<&mut Stream, TransportError> {
        if self.tracker.is_closed() {
            return Err(TransportError::Closed);
        }
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    fn negotiated(&self) -> Result<SizeSpec, TransportError> {
        self.sizes.ok_or_else(|| {
            TransportError::ProtocolViolation("request issued before size negotiation".into())
        })
    }

    fn open(&self, addr: &str) -> Result<Stream, TransportError> {
        let tcp = TcpStream::connect(addr).map_err(|source| TransportError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        let _ = tcp.set_nodelay(true);
        tcp.set_read_timeout(self.config.io_timeout)?;
        tcp.set_write_timeout(self.config.io_timeout)?;

        Ok(match &self.config.tls {
            None => Stream::Plain(tcp),
            Some(options) => Stream::Tls(Box::new(tls::connect(options, tcp)?)),
        })
    }

    fn write_frame(&mut self) -> Result<(), TransportError> {
        let Self {
            stream, tx_buf, ..
        } = self;
        let stream = stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream.write_all(tx_buf).map_err(TransportError::from_io)?;
        stream.flush().map_err(TransportError::from_io)
    }
}

impl Transport for RemoteTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.tracker.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.stream.is_some() {
            debug!("Remote transport already connected to {}", self.config.addr());
            return Ok(());
        }

        let addr = self.config.addr();
        // 握手或 socket 选项失败同样算作连接失败
        let stream = self.open(&addr).map_err(|e| match e {
            TransportError::Connect { .. } => e,
            other => TransportError::Connect {
                addr: addr.clone(),
                source: std::io::Error::other(other),
            },
        })?;
        self.stream = Some(stream);
        info!(
            "Connected to experimental site at {} ({})",
            addr,
            if self.config.tls.is_some() {
                "secure"
            } else {
                "plain"
            }
        );
        Ok(())
    }

    fn negotiate_size(&mut self, sizes: SizeSpec) -> Result<SizeSpec, TransportError> {
        sizes.validate()?;
        let words = sizes.payload_words(self.config.data_size);
        if words > frame::MAX_FRAME_WORDS {
            return Err(TransportError::Config(format!(
                "data_size {} exceeds {} words per frame",
                words,
                frame::MAX_FRAME_WORDS
            )));
        }
        let message = frame::encode_size_message(&sizes, words)?;

        self.proposed = Some((sizes, words));
        let stream = self.stream()?;
        stream.write_all(&message).map_err(TransportError::from_io)?;
        stream.flush().map_err(TransportError::from_io)?;

        let mut ack = [0u8; SIZE_MESSAGE_BYTES];
        stream.read_exact(&mut ack).map_err(TransportError::from_io)?;
        let (remote, remote_words) = frame::decode_size_message(&ack)?;

        if sizes.check_agrees(&remote).is_err() {
            warn!("Experimental site rejected sizes: local {:?}, remote {:?}", sizes, remote);
            return Err(TransportError::SizeMismatch {
                local: sizes,
                remote,
            });
        }

        let remote_words = frame::check_peer_words(&sizes, remote_words)?;

        self.words = words.max(remote_words);
        self.sizes = Some(sizes);
        self.proposed = Some((sizes, self.words));
        self.tx_buf = BytesMut::with_capacity(frame::frame_bytes(self.words));
        self.rx_buf = vec![0u8; frame::frame_bytes(self.words)];
        debug!("Negotiated sizes {:?} with {} words per frame", sizes, self.words);
        Ok(sizes)
    }

    fn send(
        &mut self,
        command: Command,
        payload: Option<&TrialResponse>,
    ) -> Result<(), TransportError> {
        if command == Command::Die {
            return self.close();
        }
        if command == Command::SetSize {
            return Err(TransportError::ProtocolViolation(
                "SetSize is carried by negotiate_size".into(),
            ));
        }
        self.stream()?;
        let sizes = self.negotiated()?;
        self.tracker.begin(command)?;

        let payload = if command.carries_trial() { payload } else { None };
        if let Err(e) =
            frame::encode_request(command, payload, &sizes.ctrl, self.words, &mut self.tx_buf)
        {
            self.tracker.abort();
            return Err(e.into());
        }
        trace!("Sending {:?} ({} words)", command, self.words);
        if let Err(e) = self.write_frame() {
            self.tracker.abort();
            return Err(e);
        }
        Ok(())
    }

    fn recv(&mut self, command: Command) -> Result<DaqResponse, TransportError> {
        self.stream()?;
        let sizes = self.negotiated()?;
        self.tracker.complete(command)?;

        let words = self.words;
        let Self {
            stream, rx_buf, ..
        } = self;
        let stream = stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream.read_exact(rx_buf).map_err(TransportError::from_io)?;
        let daq = frame::decode_reply(rx_buf, &sizes.daq, words)?;
        trace!("Received reply to {:?}", command);
        Ok(daq)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.tracker.is_closed() {
            return Ok(());
        }
        self.tracker.mark_closed();

        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        if let Some((sizes, words)) = self.proposed {
            let sent = frame::encode_request(Command::Die, None, &sizes.ctrl, words, &mut self.tx_buf)
                .map_err(TransportError::from)
                .and_then(|_| {
                    stream.write_all(&self.tx_buf)?;
                    stream.flush()?;
                    Ok(())
                });
            match sent {
                Ok(()) => debug!("Sent Die to experimental site {}", self.config.addr()),
                Err(e) => warn!("Failed to send Die to {}: {}", self.config.addr(), e),
            }
        }
        stream.shutdown();
        info!("Remote transport to {} closed", self.config.addr());
        Ok(())
    }
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        if self.stream.is_some() {
            let _ = self.close();
        }
    }
}
