//! 试验端（rig 侧）字帧端点
//!
//! 与 [`RemoteTransport`](super::RemoteTransport) 对称：接受一个仿真端连接，
//! 应答尺寸消息，然后逐个读取请求帧并分派给 [`SiteHandler`]。

use crate::TransportError;
use bytes::BytesMut;
use expctl_protocol::frame::{self, SIZE_MESSAGE_BYTES};
use expctl_protocol::{Channel, Command, DaqResponse, SizeSpec, TrialResponse};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// 监听仿真端连接
pub struct SiteListener {
    listener: TcpListener,
}

impl SiteListener {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// 非阻塞模式下 `try_accept` 在无连接时立即返回
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), TransportError> {
        Ok(self.listener.set_nonblocking(nonblocking)?)
    }

    /// 阻塞等待一个明文连接
    pub fn accept(&self) -> Result<SiteConnection<TcpStream>, TransportError> {
        let (stream, peer) = self.listener.accept()?;
        Self::prepare(&stream, peer)?;
        Ok(SiteConnection::new(stream))
    }

    /// 尝试接受一个明文连接；没有待处理连接时返回 `None`
    pub fn try_accept(&self) -> Result<Option<SiteConnection<TcpStream>>, TransportError> {
        Ok(self.try_accept_raw()?.map(SiteConnection::new))
    }

    /// 接受一个安全连接并完成服务端握手
    pub fn accept_tls(
        &self,
        config: Arc<ServerConfig>,
    ) -> Result<SiteConnection<StreamOwned<ServerConnection, TcpStream>>, TransportError> {
        let (stream, peer) = self.listener.accept()?;
        Self::prepare(&stream, peer)?;
        let stream = super::tls::accept(config, stream)?;
        Ok(SiteConnection::new(stream))
    }

    /// `try_accept` 的安全通道版本
    pub fn try_accept_tls(
        &self,
        config: Arc<ServerConfig>,
    ) -> Result<Option<SiteConnection<StreamOwned<ServerConnection, TcpStream>>>, TransportError>
    {
        match self.try_accept_raw()? {
            Some(stream) => {
                let stream = super::tls::accept(config, stream)?;
                Ok(Some(SiteConnection::new(stream)))
            },
            None => Ok(None),
        }
    }

    fn try_accept_raw(&self) -> Result<Option<TcpStream>, TransportError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                Self::prepare(&stream, peer)?;
                Ok(Some(stream))
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn prepare(stream: &TcpStream, peer: SocketAddr) -> Result<(), TransportError> {
        stream.set_nonblocking(false)?;
        let _ = stream.set_nodelay(true);
        info!("Simulation connected from {}", peer);
        Ok(())
    }
}

/// 单个仿真端连接
pub struct SiteConnection<S: Read + Write> {
    stream: S,
    sizes: Option<SizeSpec>,
    words: usize,
    rx_buf: Vec<u8>,
    tx_buf: BytesMut,
}

impl<S: Read + Write> SiteConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            sizes: None,
            words: 0,
            rx_buf: Vec::new(),
            tx_buf: BytesMut::new(),
        }
    }

    pub fn sizes(&self) -> Option<SizeSpec> {
        self.sizes
    }

    pub fn payload_words(&self) -> usize {
        self.words
    }

    /// 应答尺寸消息
    ///
    /// `accepted` 为 `None` 时回显仿真端的尺寸；否则回复 `accepted`，
    /// 两者不一致时返回 `SizeMismatch`（对端会从应答中看到差异）。
    pub fn negotiate(
        &mut self,
        accepted: Option<SizeSpec>,
        floor: usize,
    ) -> Result<SizeSpec, TransportError> {
        let mut message = [0u8; SIZE_MESSAGE_BYTES];
        self.stream.read_exact(&mut message)?;
        let (requested, requested_words) = frame::decode_size_message(&message)?;
        let requested_words = frame::check_peer_words(&requested, requested_words)?;

        let answer = accepted.unwrap_or(requested);
        let words = requested_words.max(answer.payload_words(floor));
        if words > frame::MAX_FRAME_WORDS {
            return Err(TransportError::Config(format!(
                "data_size {} exceeds {} words per frame",
                words,
                frame::MAX_FRAME_WORDS
            )));
        }
        let reply = frame::encode_size_message(&answer, words)?;
        self.stream.write_all(&reply)?;
        self.stream.flush()?;

        if answer.check_agrees(&requested).is_err() {
            warn!("Rejected simulation sizes {:?}, expected {:?}", requested, answer);
            return Err(TransportError::SizeMismatch {
                local: answer,
                remote: requested,
            });
        }

        self.sizes = Some(answer);
        self.words = words;
        self.rx_buf = vec![0u8; frame::frame_bytes(words)];
        self.tx_buf = BytesMut::with_capacity(frame::frame_bytes(words));
        debug!("Accepted sizes {:?} with {} words per frame", answer, words);
        Ok(answer)
    }

    fn negotiated(&self) -> Result<SizeSpec, TransportError> {
        self.sizes.ok_or_else(|| {
            TransportError::ProtocolViolation("frame exchanged before size negotiation".into())
        })
    }

    /// 读取下一个请求帧
    pub fn next_request(&mut self) -> Result<(Command, TrialResponse), TransportError> {
        let sizes = self.negotiated()?;
        self.stream.read_exact(&mut self.rx_buf)?;
        Ok(frame::decode_request(&self.rx_buf, &sizes.ctrl, self.words)?)
    }

    /// 发送应答帧
    pub fn reply(&mut self, daq: &DaqResponse) -> Result<(), TransportError> {
        let sizes = self.negotiated()?;
        frame::encode_reply(daq, &sizes.daq, self.words, &mut self.tx_buf)?;
        self.stream.write_all(&self.tx_buf)?;
        self.stream.flush()?;
        Ok(())
    }

    /// 服务循环，直到收到 `Die` 或对端断开
    pub fn serve<H: SiteHandler + ?Sized>(
        &mut self,
        handler: &mut H,
    ) -> Result<SiteStats, TransportError> {
        let sizes = self.negotiated()?;
        handler.configure(&sizes);

        let mut stats = SiteStats::default();
        loop {
            let (command, trial) = match self.next_request() {
                Ok(request) => request,
                Err(TransportError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    warn!("Simulation disconnected without Die");
                    return Ok(stats);
                },
                Err(e) => return Err(e),
            };
            trace!("Site received {:?}", command);

            match command {
                Command::SetSize => {
                    return Err(TransportError::ProtocolViolation(
                        "SetSize after negotiation".into(),
                    ));
                },
                Command::Setup => {
                    handler.setup();
                    stats.setups += 1;
                },
                Command::SetTrialResponse => {
                    handler.apply_trial(&trial);
                    stats.trials += 1;
                },
                Command::CommitState => {
                    handler.commit_state();
                    stats.commits += 1;
                },
                Command::GetDaqResponse
                | Command::GetDisp
                | Command::GetVel
                | Command::GetAccel
                | Command::GetForce
                | Command::GetTime => {
                    let daq = handler.measure();
                    self.reply(&daq)?;
                    stats.queries += 1;
                },
                Command::Die => {
                    stats.dies += 1;
                    info!(
                        "Simulation sent Die after {} trials and {} commits",
                        stats.trials, stats.commits
                    );
                    return Ok(stats);
                },
            }
        }
    }
}

/// 服务统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteStats {
    pub setups: usize,
    pub trials: usize,
    pub commits: usize,
    pub queries: usize,
    pub dies: usize,
}

/// 试验端行为
pub trait SiteHandler {
    /// 尺寸协商完成
    fn configure(&mut self, sizes: &SizeSpec);

    fn setup(&mut self) {}

    fn apply_trial(&mut self, trial: &TrialResponse);

    fn commit_state(&mut self) {}

    /// 当前测量状态（长度必须符合采集侧尺寸）
    fn measure(&mut self) -> DaqResponse;
}

/// 线弹性回显试验端：运动学原样返回，`force = stiffness * disp`
#[derive(Debug, Clone)]
pub struct EchoRig {
    stiffness: f64,
    daq: DaqResponse,
}

impl EchoRig {
    pub fn new(stiffness: f64) -> Self {
        Self {
            stiffness,
            daq: DaqResponse::default(),
        }
    }

    pub fn stiffness(&self) -> f64 {
        self.stiffness
    }
}

impl SiteHandler for EchoRig {
    fn configure(&mut self, sizes: &SizeSpec) {
        self.daq = DaqResponse::zeros(&sizes.daq);
    }

    fn setup(&mut self) {
        for channel in Channel::ALL {
            self.daq.channel_mut(channel).fill(0.0);
        }
    }

    fn apply_trial(&mut self, trial: &TrialResponse) {
        for channel in [Channel::Disp, Channel::Vel, Channel::Accel, Channel::Time] {
            let src = trial.channel(channel);
            for (i, slot) in self.daq.channel_mut(channel).iter_mut().enumerate() {
                *slot = src.get(i).copied().unwrap_or(0.0);
            }
        }
        let stiffness = self.stiffness;
        let disp = self.daq.disp.clone();
        for (i, force) in self.daq.force.iter_mut().enumerate() {
            *force = stiffness * disp.get(i).copied().unwrap_or(0.0);
        }
    }

    fn measure(&mut self) -> DaqResponse {
        self.daq.clone()
    }
}
