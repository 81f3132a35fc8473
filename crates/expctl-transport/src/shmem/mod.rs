//! 共享内存传输（反射内存绑定）
//!
//! 仿真端与试验端映射同一段内存，通过三标志握手交换目标与测量值。
//! 物理映射由 [`SharedRegion`] 适配，握手顺序由 [`Handshake`] 状态机保证。
//!
//! ## 请求到握手的映射
//!
//! - `Setup`: 清零下发区并复位标志
//! - `SetTrialResponse`: 写下发区 → newTarget=1 → 等待 switchPC → 清 newTarget
//! - 带应答命令: 有目标在途时等待 atTarget → 读回读区 → 清 atTarget；
//!   否则直接读回读区
//! - `CommitState`: 空操作
//! - `Die` / `close`: 复位标志并清零下发区

pub mod handshake;
pub mod layout;
pub mod region;

#[cfg(any(test, feature = "mock"))]
pub mod emulator;

pub use handshake::{Handshake, HandshakeState, WaitStrategy};
pub use layout::{Flag, MemoryLayout};
pub use region::{HeapRegion, InterruptLine, MmapRegion, SharedRegion};

use crate::{RequestTracker, Transport, TransportError, TransportKind};
use crossbeam_channel::Receiver;
use expctl_protocol::{Channel, ChannelSizes, Command, DaqResponse, SizeSpec, TrialResponse};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 未配置时使用的节点号
pub const DEFAULT_NODE_ID: usize = 3;

/// 共享内存传输配置
#[derive(Debug, Clone, PartialEq)]
pub struct SharedMemoryConfig {
    /// 区域起始字节偏移（4 字节对齐）
    pub base_offset: usize,
    pub node_id: usize,
    /// 每个节点号对应的字节偏移
    pub node_stride: usize,
    /// 每个通道的槽位数
    pub num_dof: usize,
    /// 轮询间隔；为零时忙等
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            base_offset: 0,
            node_id: DEFAULT_NODE_ID,
            node_stride: 0,
            num_dof: 1,
            poll_interval: Duration::ZERO,
            timeout: None,
        }
    }
}

impl SharedMemoryConfig {
    pub fn new(num_dof: usize) -> Self {
        Self {
            num_dof,
            ..Self::default()
        }
    }

    pub fn layout(&self) -> Result<MemoryLayout, TransportError> {
        MemoryLayout::new(self.base_offset, self.node_id, self.node_stride, self.num_dof)
    }
}

/// 共享内存传输
pub struct SharedMemoryTransport {
    config: SharedMemoryConfig,
    handshake: Handshake,
    sizes: Option<SizeSpec>,
    tracker: RequestTracker,
    connected: bool,
}

impl SharedMemoryTransport {
    /// 在已有区域上创建传输（默认轮询等待）
    pub fn new(
        region: Arc<dyn SharedRegion>,
        config: SharedMemoryConfig,
    ) -> Result<Self, TransportError> {
        let layout = config.layout()?;
        let wait = WaitStrategy::Poll {
            interval: config.poll_interval,
        };
        let handshake = Handshake::new(region, layout, wait, config.timeout)?;
        Ok(Self {
            config,
            handshake,
            sizes: None,
            tracker: RequestTracker::new(),
            connected: false,
        })
    }

    /// 映射设备或文件
    pub fn open(path: impl AsRef<Path>, config: SharedMemoryConfig) -> Result<Self, TransportError> {
        let layout = config.layout()?;
        let region = MmapRegion::open(path, layout.required_bytes())?;
        Self::new(Arc::new(region), config)
    }

    /// 改为由中断源唤醒
    pub fn with_interrupts(mut self, source: Receiver<()>) -> Self {
        self.handshake.set_wait(WaitStrategy::Interrupt(source));
        self
    }

    pub fn config(&self) -> &SharedMemoryConfig {
        &self.config
    }

    pub fn layout(&self) -> &MemoryLayout {
        self.handshake.layout()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// 区域能承载的尺寸：非 time 通道为 0 或 num_dof，time 不超过 num_dof
    fn accepted_sizes(&self, requested: &SizeSpec) -> SizeSpec {
        let n = self.config.num_dof;
        let fit = |sizes: &ChannelSizes| {
            let mut fitted = *sizes;
            for channel in Channel::ALL {
                let size = sizes.get(channel);
                let accepted = match channel {
                    Channel::Time => size.min(n),
                    _ if size == 0 => 0,
                    _ => n,
                };
                fitted.set(channel, accepted);
            }
            fitted
        };
        SizeSpec::new(fit(&requested.ctrl), fit(&requested.daq))
    }

    fn ready(&self) -> Result<SizeSpec, TransportError> {
        if self.tracker.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.sizes.ok_or_else(|| {
            TransportError::ProtocolViolation("request issued before size negotiation".into())
        })
    }

    fn zero_outbound(&self) -> Result<(), TransportError> {
        let region = self.handshake.region();
        for index in self.layout().outbound() {
            region.store(index, 0)?;
        }
        Ok(())
    }

    fn write_outbound(&self, trial: &TrialResponse, sizes: &ChannelSizes) -> Result<(), TransportError> {
        let region = self.handshake.region();
        let layout = self.layout();
        for channel in Channel::ALL {
            let values = trial.channel(channel);
            let n = sizes.get(channel);
            for (i, index) in layout.ctrl(channel).enumerate() {
                let value = if i < n {
                    values.get(i).copied().unwrap_or(0.0)
                } else {
                    0.0
                };
                region.store_f32(index, value as f32)?;
            }
        }
        Ok(())
    }

    fn read_inbound(&self, sizes: &ChannelSizes) -> Result<DaqResponse, TransportError> {
        let region = self.handshake.region();
        let layout = self.layout();
        let mut daq = DaqResponse::default();
        for channel in Channel::ALL {
            let values = layout
                .daq(channel)
                .take(sizes.get(channel))
                .map(|index| region.load_f32(index).map(f64::from))
                .collect::<Result<Vec<_>, _>>()?;
            *daq.channel_mut(channel) = values;
        }
        Ok(daq)
    }

    fn post_trial(&mut self, trial: Option<&TrialResponse>, sizes: &SizeSpec) -> Result<(), TransportError> {
        if self.handshake.state() != HandshakeState::Idle {
            return Err(TransportError::ProtocolViolation(format!(
                "new target posted while handshake is {:?}",
                self.handshake.state()
            )));
        }
        match trial {
            Some(trial) => {
                trial.validate(&sizes.ctrl)?;
                self.write_outbound(trial, &sizes.ctrl)?;
            },
            None => self.zero_outbound()?,
        }
        self.handshake.post_target()?;
        self.handshake.await_switch()
    }

    fn teardown(&mut self) -> Result<(), TransportError> {
        self.handshake.idle()?;
        self.zero_outbound()
    }
}

impl Transport for SharedMemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SharedMemory
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.tracker.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.connected {
            self.connected = true;
            info!(
                "Shared memory transport attached (node {}, base word {}, {} dof)",
                self.config.node_id,
                self.layout().base_word(),
                self.config.num_dof
            );
        }
        Ok(())
    }

    fn negotiate_size(&mut self, sizes: SizeSpec) -> Result<SizeSpec, TransportError> {
        if self.tracker.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        sizes.validate()?;
        let accepted = self.accepted_sizes(&sizes);
        if accepted != sizes {
            warn!("Sizes {:?} do not fit the shared memory layout", sizes);
            return Err(TransportError::SizeMismatch {
                local: sizes,
                remote: accepted,
            });
        }
        self.sizes = Some(sizes);
        debug!("Shared memory sizes fixed to {:?}", sizes);
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
        let sizes = self.ready()?;
        self.tracker.begin(command)?;

        let result = match command {
            Command::Setup => self.teardown(),
            Command::SetTrialResponse => self.post_trial(payload, &sizes),
            // CommitState 与查询在共享内存上无需写入
            _ => Ok(()),
        };
        if result.is_err() {
            self.tracker.abort();
        }
        trace!("Posted {:?} to shared memory", command);
        result
    }

    fn recv(&mut self, command: Command) -> Result<DaqResponse, TransportError> {
        let sizes = self.ready()?;
        self.tracker.complete(command)?;

        match self.handshake.state() {
            HandshakeState::Consuming => {
                self.handshake.await_target()?;
                let daq = self.read_inbound(&sizes.daq)?;
                self.handshake.release()?;
                Ok(daq)
            },
            HandshakeState::Idle => self.read_inbound(&sizes.daq),
            state => Err(TransportError::ProtocolViolation(format!(
                "recv({:?}) while handshake is {:?}",
                command, state
            ))),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.tracker.is_closed() {
            return Ok(());
        }
        self.tracker.mark_closed();
        if self.connected {
            self.connected = false;
            if let Err(e) = self.teardown() {
                warn!("Failed to idle shared memory flags: {}", e);
            }
            info!("Shared memory transport (node {}) closed", self.config.node_id);
        }
        Ok(())
    }
}

impl Drop for SharedMemoryTransport {
    fn drop(&mut self) {
        if self.connected {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::emulator::{EmulatorConfig, RigEmulator, RigEvent};
    use super::*;
    use std::time::Instant;

    fn attach(num_dof: usize) -> (Arc<HeapRegion>, SharedMemoryTransport) {
        let config = SharedMemoryConfig {
            node_id: 0,
            timeout: Some(Duration::from_secs(2)),
            ..SharedMemoryConfig::new(num_dof)
        };
        let layout = config.layout().unwrap();
        let region = Arc::new(HeapRegion::new(layout.end_word()));
        let transport = SharedMemoryTransport::new(region.clone(), config).unwrap();
        (region, transport)
    }

    fn trial(n: usize, d0: f64, t: f64) -> TrialResponse {
        let mut disp = vec![0.0; n];
        disp[0] = d0;
        TrialResponse::new(disp, vec![0.0; n], vec![0.0; n], vec![t])
    }

    #[test]
    fn test_negotiate_local_fit() {
        let (_region, mut transport) = attach(3);
        transport.connect().unwrap();
        assert_eq!(
            transport.negotiate_size(SizeSpec::for_dof(3)).unwrap(),
            SizeSpec::for_dof(3)
        );

        let (_region, mut transport) = attach(3);
        transport.connect().unwrap();
        match transport.negotiate_size(SizeSpec::for_dof(2)).unwrap_err() {
            TransportError::SizeMismatch { local, remote } => {
                assert_eq!(local, SizeSpec::for_dof(2));
                assert_eq!(remote, SizeSpec::for_dof(3));
            },
            other => panic!("expected SizeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiate_requires_connect() {
        let (_region, mut transport) = attach(1);
        assert!(matches!(
            transport.negotiate_size(SizeSpec::for_dof(1)),
            Err(TransportError::NotConnected)
        ));
    }

    /// 试验端故意延迟 atTarget，回读必须在 atTarget 之后
    #[test]
    fn test_handshake_with_delayed_at_target() {
        let (region, mut transport) = attach(2);
        let layout = *transport.layout();
        let delay = Duration::from_millis(50);
        let rig = RigEmulator::spawn(
            region.clone(),
            layout,
            EmulatorConfig {
                at_target_delay: delay,
                stiffness: 100.0,
                ..EmulatorConfig::default()
            },
        );

        transport.connect().unwrap();
        transport.negotiate_size(SizeSpec::for_dof(2)).unwrap();

        let start = Instant::now();
        transport
            .send(Command::SetTrialResponse, Some(&trial(2, 0.5, 1.0)))
            .unwrap();
        assert_eq!(transport.handshake_state(), HandshakeState::Consuming);
        transport.send(Command::GetDaqResponse, None).unwrap();
        let daq = transport.recv(Command::GetDaqResponse).unwrap();
        assert!(start.elapsed() >= delay);
        assert_eq!(transport.handshake_state(), HandshakeState::Idle);

        assert_eq!(daq.disp, vec![0.5, 0.0]);
        assert_eq!(daq.force, vec![50.0, 0.0]);
        assert_eq!(daq.time, vec![1.0]);
        assert_eq!(region.load(layout.flag(Flag::AtTarget)).unwrap(), 0);

        let events = rig.stop();
        assert_eq!(
            events,
            vec![
                RigEvent::TargetSeen,
                RigEvent::SwitchPcRaised,
                RigEvent::TargetApplied,
                RigEvent::AtTargetRaised,
            ]
        );
    }

    #[test]
    fn test_second_trial_while_consuming() {
        let (region, mut transport) = attach(1);
        let layout = *transport.layout();
        let rig = RigEmulator::spawn(region.clone(), layout, EmulatorConfig::default());
        transport.connect().unwrap();
        transport.negotiate_size(SizeSpec::for_dof(1)).unwrap();

        transport
            .send(Command::SetTrialResponse, Some(&trial(1, 0.1, 1.0)))
            .unwrap();
        let before = region.load_f32(layout.ctrl(Channel::Disp).start).unwrap();
        let err = transport
            .send(Command::SetTrialResponse, Some(&trial(1, 0.9, 2.0)))
            .unwrap_err();
        assert!(matches!(err, TransportError::ProtocolViolation(_)));
        // 下发区未被覆盖
        assert_eq!(region.load_f32(layout.ctrl(Channel::Disp).start).unwrap(), before);
        rig.stop();
    }

    #[test]
    fn test_query_without_target_reads_directly() {
        let (region, mut transport) = attach(1);
        let layout = *transport.layout();
        region.store_f32(layout.daq(Channel::Force).start, 7.5).unwrap();
        transport.connect().unwrap();
        transport.negotiate_size(SizeSpec::for_dof(1)).unwrap();

        transport.send(Command::GetForce, None).unwrap();
        let daq = transport.recv(Command::GetForce).unwrap();
        assert_eq!(daq.force, vec![7.5]);
    }

    #[test]
    fn test_close_idles_flags_once() {
        let (region, mut transport) = attach(1);
        let layout = *transport.layout();
        transport.connect().unwrap();
        transport.negotiate_size(SizeSpec::for_dof(1)).unwrap();
        region.store(layout.flag(Flag::SwitchPc), 1).unwrap();
        region.store_f32(layout.ctrl(Channel::Disp).start, 3.0).unwrap();

        transport.send(Command::Die, None).unwrap();
        assert_eq!(region.load(layout.flag(Flag::SwitchPc)).unwrap(), 0);
        assert_eq!(region.load_f32(layout.ctrl(Channel::Disp).start).unwrap(), 0.0);

        // 之后的写入不会被再次清除
        region.store(layout.flag(Flag::SwitchPc), 1).unwrap();
        transport.close().unwrap();
        drop(transport);
        assert_eq!(region.load(layout.flag(Flag::SwitchPc)).unwrap(), 1);
    }

    #[test]
    fn test_timeout_without_rig() {
        let (region, _) = attach(1);
        let config = SharedMemoryConfig {
            node_id: 0,
            timeout: Some(Duration::from_millis(20)),
            poll_interval: Duration::from_millis(1),
            ..SharedMemoryConfig::new(1)
        };
        let mut transport = SharedMemoryTransport::new(region, config).unwrap();
        transport.connect().unwrap();
        transport.negotiate_size(SizeSpec::for_dof(1)).unwrap();
        let err = transport
            .send(Command::SetTrialResponse, Some(&trial(1, 0.1, 1.0)))
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(err.is_fatal());
    }
}
