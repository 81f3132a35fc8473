//! 控制会话
//!
//! 持有一个 [`Transport`]，按步驱动命令目录：
//!
//! ```text
//! Unconfigured ──setup──▶ Configured ──set_trial_response──▶ Active
//!       │                     │                                 │
//!       └─────────────────────┴──── close / 致命传输错误 ────────┴──▶ Closed
//! ```
//!
//! # 单步约束
//!
//! `set_trial_response` 使一步进入挂起状态，任何带应答的查询
//! （`get_daq_response`、`get_disp` 等）完成这一步。挂起期间再次
//! `set_trial_response` 或 `commit_state` 返回 `ProtocolViolation`，
//! 且不修改任何缓冲区和偏移状态。
//!
//! # 示例
//!
//! ```rust,no_run
//! use expctl_protocol::{SizeSpec, TrialResponse};
//! use expctl_session::ControlSession;
//! use expctl_transport::{RemoteConfig, RemoteTransport};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RemoteTransport::new(RemoteConfig::new("127.0.0.1", 8090));
//! let mut session = ControlSession::new(transport, SizeSpec::for_dof(6));
//! session.setup()?;
//!
//! let trial = TrialResponse::new(vec![0.01; 6], vec![0.0; 6], vec![0.0; 6], vec![1.0]);
//! session.set_trial_response(&trial)?;
//! let daq = session.get_daq_response()?;
//! println!("force = {:?}", daq.force);
//! session.commit_state()?;
//! session.close()?;
//! # Ok(())
//! # }
//! ```

use crate::error::SessionError;
use crate::offset::{OffsetCorrector, OffsetState};
use expctl_protocol::{Channel, Command, DaqResponse, SizeSpec, TrialResponse};
use expctl_transport::{Transport, TransportError};
use tracing::{debug, error, info, trace, warn};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconfigured,
    Configured,
    Active,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Unconfigured => "unconfigured",
            SessionState::Configured => "configured",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 控制会话
///
/// 单线程、同步使用；多个会话之间互不共享状态，也不能共享传输实例。
pub struct ControlSession<T: Transport> {
    transport: T,
    state: SessionState,
    /// 本端请求的尺寸
    requested: SizeSpec,
    /// 协商结果（setup 之后不再改变）
    sizes: Option<SizeSpec>,
    offset: OffsetCorrector,
    skip_unchanged_trial: bool,
    step_pending: bool,
    /// 最近一次实际下发的（修正后）试验响应
    last_sent: Option<TrialResponse>,
    /// 最近一次原始测量（修正前）
    last_raw_daq: Option<DaqResponse>,
    /// 最近一次交给调用方的测量
    daq: DaqResponse,
}

impl<T: Transport> ControlSession<T> {
    pub fn new(transport: T, sizes: SizeSpec) -> Self {
        Self {
            transport,
            state: SessionState::Unconfigured,
            requested: sizes,
            sizes: None,
            offset: OffsetCorrector::new(false),
            skip_unchanged_trial: true,
            step_pending: false,
            last_sent: None,
            last_raw_daq: None,
            daq: DaqResponse::default(),
        }
    }

    /// 启用相对试验模式
    pub fn with_relative_trial(mut self, enabled: bool) -> Self {
        self.offset = OffsetCorrector::new(enabled);
        self
    }

    /// 位移与时间都未变化的试验响应不重复下发（默认开启）
    pub fn with_skip_unchanged_trial(mut self, enabled: bool) -> Self {
        self.skip_unchanged_trial = enabled;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 协商后的尺寸；setup 之前为 `None`
    pub fn sizes(&self) -> Option<SizeSpec> {
        self.sizes
    }

    pub fn requested_sizes(&self) -> SizeSpec {
        self.requested
    }

    pub fn offset_state(&self) -> &OffsetState {
        self.offset.state()
    }

    pub fn is_step_pending(&self) -> bool {
        self.step_pending
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// 最近一次测量（已做偏移修正）
    pub fn last_daq_response(&self) -> &DaqResponse {
        &self.daq
    }

    // ------------------------------------------------------------------
    // 操作
    // ------------------------------------------------------------------

    /// 建立传输并协商尺寸
    ///
    /// 连接失败返回 `Connect`，尺寸不一致返回 `SizeMismatch`，
    /// 两种情况下会话都保持 `Unconfigured`。
    pub fn setup(&mut self) -> Result<SizeSpec, SessionError> {
        match self.state {
            SessionState::Unconfigured => {},
            SessionState::Closed => return Err(SessionError::SessionClosed),
            state => {
                return Err(SessionError::ProtocolViolation(format!(
                    "setup called on a {} session",
                    state
                )));
            },
        }

        if let Err(e) = self.transport.connect() {
            warn!("Failed to connect {} transport: {}", self.transport.kind(), e);
            return Err(self.fail(e));
        }

        let sizes = match self.transport.negotiate_size(self.requested) {
            Ok(sizes) => sizes,
            Err(e) => return Err(self.fail(e)),
        };

        if let Err(e) = self.transport.send(Command::Setup, None) {
            return Err(self.fail(e));
        }

        self.sizes = Some(sizes);
        self.offset.reset();
        self.last_sent = None;
        self.last_raw_daq = None;
        self.daq = DaqResponse::zeros(&sizes.daq);
        self.state = SessionState::Configured;
        info!("Control session configured over {} transport", self.transport.kind());
        Ok(sizes)
    }

    /// 下发本步的试验响应
    pub fn set_trial_response(&mut self, trial: &TrialResponse) -> Result<(), SessionError> {
        let sizes = self.ensure_configured()?;
        if self.step_pending {
            return Err(SessionError::ProtocolViolation(
                "set_trial_response called while the previous step awaits get_daq_response"
                    .into(),
            ));
        }
        trial.validate(&sizes.ctrl)?;

        if self.offset.needs_capture() {
            let force = match &self.last_raw_daq {
                Some(daq) => daq.force.clone(),
                None => self.request(Command::GetForce)?.force,
            };
            self.offset.capture(&trial.disp, &force);
        }

        let outbound = self.offset.apply_outbound(trial);
        if self.skip_unchanged_trial && self.is_unchanged(&outbound) {
            debug!("Trial unchanged, not retransmitted");
        } else {
            if let Err(e) = self.transport.send(Command::SetTrialResponse, Some(&outbound)) {
                return Err(self.fail(e));
            }
            trace!("Trial posted: disp {:?}, time {:?}", outbound.disp, outbound.time);
            self.last_sent = Some(outbound);
        }

        self.step_pending = true;
        self.state = SessionState::Active;
        Ok(())
    }

    /// 读取测量响应，完成挂起的一步
    pub fn get_daq_response(&mut self) -> Result<DaqResponse, SessionError> {
        self.ensure_configured()?;
        self.query(Command::GetDaqResponse)?;
        Ok(self.daq.clone())
    }

    pub fn get_disp(&mut self) -> Result<Vec<f64>, SessionError> {
        self.query_channel(Command::GetDisp)
    }

    pub fn get_vel(&mut self) -> Result<Vec<f64>, SessionError> {
        self.query_channel(Command::GetVel)
    }

    pub fn get_accel(&mut self) -> Result<Vec<f64>, SessionError> {
        self.query_channel(Command::GetAccel)
    }

    pub fn get_force(&mut self) -> Result<Vec<f64>, SessionError> {
        self.query_channel(Command::GetForce)
    }

    pub fn get_time(&mut self) -> Result<Vec<f64>, SessionError> {
        self.query_channel(Command::GetTime)
    }

    /// 确认本步收敛
    ///
    /// 远程传输发送 `CommitState`（无应答），共享内存上为空操作。
    pub fn commit_state(&mut self) -> Result<(), SessionError> {
        self.ensure_configured()?;
        if self.step_pending {
            return Err(SessionError::ProtocolViolation(
                "commit_state called before the pending step was read back".into(),
            ));
        }
        if let Err(e) = self.transport.send(Command::CommitState, None) {
            return Err(self.fail(e));
        }
        debug!("State committed");
        Ok(())
    }

    /// 关闭会话
    ///
    /// 释放对端资源（远程发送 `Die`，共享内存复位标志）。之后的任何调用
    /// 包括再次 `close` 都返回 `SessionClosed`。
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::SessionClosed);
        }
        self.shutdown();
        Ok(())
    }

    // ------------------------------------------------------------------
    // 内部
    // ------------------------------------------------------------------

    fn ensure_configured(&self) -> Result<SizeSpec, SessionError> {
        match (self.state, self.sizes) {
            (SessionState::Closed, _) => Err(SessionError::SessionClosed),
            (SessionState::Unconfigured, _) | (_, None) => Err(SessionError::ProtocolViolation(
                "session used before setup".into(),
            )),
            (_, Some(sizes)) => Ok(sizes),
        }
    }

    fn query_channel(&mut self, command: Command) -> Result<Vec<f64>, SessionError> {
        self.ensure_configured()?;
        let channel = command.queried_channel().unwrap_or(Channel::Disp);
        self.query(command)?;
        Ok(self.daq.channel(channel).to_vec())
    }

    /// 带应答的请求：完成挂起的一步并更新测量缓冲
    fn query(&mut self, command: Command) -> Result<(), SessionError> {
        let raw = self.request(command)?;
        self.daq = self.offset.apply_inbound(&raw);
        self.last_raw_daq = Some(raw);
        self.step_pending = false;
        Ok(())
    }

    fn request(&mut self, command: Command) -> Result<DaqResponse, SessionError> {
        let result = self
            .transport
            .send(command, None)
            .and_then(|()| self.transport.recv(command));
        match result {
            Ok(daq) => {
                trace!("{:?} answered", command);
                Ok(daq)
            },
            Err(e) => Err(self.fail(e)),
        }
    }

    fn is_unchanged(&self, outbound: &TrialResponse) -> bool {
        self.last_sent
            .as_ref()
            .is_some_and(|last| last.disp == outbound.disp && last.time == outbound.time)
    }

    /// 归类传输错误；致命错误在尽力拆除后关闭会话
    fn fail(&mut self, err: TransportError) -> SessionError {
        if err.is_fatal() && self.state != SessionState::Closed {
            error!(
                "Fatal {} transport error, closing session: {}",
                self.transport.kind(),
                err
            );
            self.shutdown();
        }
        SessionError::from(err)
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.transport.close() {
            warn!("Transport teardown failed: {}", e);
        }
        self.state = SessionState::Closed;
        self.step_pending = false;
        info!("Control session closed");
    }
}

impl<T: Transport> Drop for ControlSession<T> {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.shutdown();
        }
    }
}
