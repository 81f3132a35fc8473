//! 三标志握手状态机（仿真端）
//!
//! ```text
//! Idle ──post_target──▶ TrialPosted ──await_switch──▶ Consuming
//!   ▲                                                     │
//!   └────────release──── AtTarget ◀────await_target───────┘
//! ```
//!
//! 每一步都对应一次标志写入或等待，跨进程的唯一同步手段就是这三个标志字。

use super::layout::{Flag, MemoryLayout};
use super::region::SharedRegion;
use crate::TransportError;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// 中断等待时重新检查标志的间隔（防止丢失的唤醒）
const INTERRUPT_RECHECK: Duration = Duration::from_millis(100);

/// 仿真端握手状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// 无目标在途
    Idle,
    /// 已写目标并置位 newTarget
    TrialPosted,
    /// 试验端已置位 switchPC，newTarget 已清除
    Consuming,
    /// atTarget 已置位，回读区可读
    AtTarget,
}

/// 等待标志的方式
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// 轮询；间隔为零时忙等
    Poll { interval: Duration },
    /// 由中断回调喂入的通道唤醒
    Interrupt(Receiver<()>),
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Poll {
            interval: Duration::ZERO,
        }
    }
}

pub struct Handshake {
    region: Arc<dyn SharedRegion>,
    layout: MemoryLayout,
    wait: WaitStrategy,
    timeout: Option<Duration>,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(
        region: Arc<dyn SharedRegion>,
        layout: MemoryLayout,
        wait: WaitStrategy,
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        region.ensure_len(layout.end_word())?;
        Ok(Self {
            region,
            layout,
            wait,
            timeout,
            state: HandshakeState::Idle,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn region(&self) -> &dyn SharedRegion {
        self.region.as_ref()
    }

    pub fn set_wait(&mut self, wait: WaitStrategy) {
        self.wait = wait;
    }

    /// 目标已写入下发区后置位 newTarget
    pub fn post_target(&mut self) -> Result<(), TransportError> {
        self.expect(HandshakeState::Idle, "post_target")?;
        self.set_flag(Flag::NewTarget, 1)?;
        self.state = HandshakeState::TrialPosted;
        trace!("newTarget raised");
        Ok(())
    }

    /// 等待 switchPC，然后清除 newTarget
    pub fn await_switch(&mut self) -> Result<(), TransportError> {
        self.expect(HandshakeState::TrialPosted, "await_switch")?;
        self.wait_for(Flag::SwitchPc, 1)?;
        self.set_flag(Flag::NewTarget, 0)?;
        self.state = HandshakeState::Consuming;
        trace!("switchPC seen, newTarget cleared");
        Ok(())
    }

    /// 等待 atTarget；之后才允许读回读区
    pub fn await_target(&mut self) -> Result<(), TransportError> {
        self.expect(HandshakeState::Consuming, "await_target")?;
        self.wait_for(Flag::AtTarget, 1)?;
        self.state = HandshakeState::AtTarget;
        trace!("atTarget seen");
        Ok(())
    }

    /// 回读完成后清除 atTarget
    pub fn release(&mut self) -> Result<(), TransportError> {
        self.expect(HandshakeState::AtTarget, "release")?;
        self.set_flag(Flag::AtTarget, 0)?;
        self.state = HandshakeState::Idle;
        Ok(())
    }

    /// 三个标志全部清零，回到 Idle
    pub fn idle(&mut self) -> Result<(), TransportError> {
        for flag in Flag::ALL {
            self.region.store(self.layout.flag(flag), 0)?;
        }
        self.region.raise();
        self.state = HandshakeState::Idle;
        Ok(())
    }

    fn expect(&self, state: HandshakeState, step: &str) -> Result<(), TransportError> {
        if self.state != state {
            return Err(TransportError::ProtocolViolation(format!(
                "{} requires {:?}, handshake is {:?}",
                step, state, self.state
            )));
        }
        Ok(())
    }

    fn set_flag(&self, flag: Flag, value: u32) -> Result<(), TransportError> {
        self.region.store(self.layout.flag(flag), value)?;
        self.region.raise();
        Ok(())
    }

    fn wait_for(&self, flag: Flag, value: u32) -> Result<(), TransportError> {
        let index = self.layout.flag(flag);
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            if self.region.load(index)? == value {
                return Ok(());
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                warn!("Timed out waiting for {:?} == {}", flag, value);
                return Err(TransportError::Timeout);
            }

            match &self.wait {
                WaitStrategy::Poll { interval } if interval.is_zero() => std::hint::spin_loop(),
                WaitStrategy::Poll { interval } => spin_sleep::sleep(*interval),
                WaitStrategy::Interrupt(rx) => {
                    let slice = deadline
                        .map(|d| d.saturating_duration_since(Instant::now()))
                        .map_or(INTERRUPT_RECHECK, |left| left.min(INTERRUPT_RECHECK));
                    match rx.recv_timeout(slice) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {},
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(TransportError::Region(
                                "interrupt source disconnected".into(),
                            ));
                        },
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shmem::region::HeapRegion;

    fn setup(timeout: Option<Duration>) -> (Arc<HeapRegion>, Handshake) {
        let layout = MemoryLayout::new(0, 0, 0, 2).unwrap();
        let region = Arc::new(HeapRegion::new(layout.end_word()));
        let handshake = Handshake::new(
            region.clone(),
            layout,
            WaitStrategy::default(),
            timeout,
        )
        .unwrap();
        (region, handshake)
    }

    #[test]
    fn test_steps_follow_flags() {
        let (region, mut hs) = setup(Some(Duration::from_secs(1)));
        let layout = *hs.layout();

        hs.post_target().unwrap();
        assert_eq!(hs.state(), HandshakeState::TrialPosted);
        assert_eq!(region.load(layout.flag(Flag::NewTarget)).unwrap(), 1);

        region.store(layout.flag(Flag::SwitchPc), 1).unwrap();
        hs.await_switch().unwrap();
        assert_eq!(hs.state(), HandshakeState::Consuming);
        assert_eq!(region.load(layout.flag(Flag::NewTarget)).unwrap(), 0);

        region.store(layout.flag(Flag::SwitchPc), 0).unwrap();
        region.store(layout.flag(Flag::AtTarget), 1).unwrap();
        hs.await_target().unwrap();
        hs.release().unwrap();
        assert_eq!(hs.state(), HandshakeState::Idle);
        assert_eq!(region.load(layout.flag(Flag::AtTarget)).unwrap(), 0);
    }

    #[test]
    fn test_out_of_order_step() {
        let (_region, mut hs) = setup(None);
        assert!(matches!(
            hs.await_target(),
            Err(TransportError::ProtocolViolation(_))
        ));
        hs.post_target().unwrap();
        assert!(hs.post_target().is_err());
    }

    #[test]
    fn test_wait_timeout() {
        let (_region, mut hs) = setup(Some(Duration::from_millis(20)));
        hs.set_wait(WaitStrategy::Poll {
            interval: Duration::from_millis(1),
        });
        hs.post_target().unwrap();
        assert!(matches!(hs.await_switch(), Err(TransportError::Timeout)));
        assert_eq!(hs.state(), HandshakeState::TrialPosted);
    }

    #[test]
    fn test_interrupt_wait_wakes() {
        let (region, mut hs) = setup(Some(Duration::from_secs(2)));
        hs.set_wait(WaitStrategy::Interrupt(region.subscribe()));
        let layout = *hs.layout();
        hs.post_target().unwrap();

        let rig = region.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            rig.store(layout.flag(Flag::SwitchPc), 1).unwrap();
            rig.raise();
        });
        hs.await_switch().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_interrupt_source_disconnected() {
        let (_region, mut hs) = setup(None);
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(tx);
        hs.set_wait(WaitStrategy::Interrupt(rx));
        hs.post_target().unwrap();
        assert!(matches!(hs.await_switch(), Err(TransportError::Region(_))));
    }

    #[test]
    fn test_idle_clears_all_flags() {
        let (region, mut hs) = setup(None);
        let layout = *hs.layout();
        for flag in Flag::ALL {
            region.store(layout.flag(flag), 1).unwrap();
        }
        hs.idle().unwrap();
        for flag in Flag::ALL {
            assert_eq!(region.load(layout.flag(flag)).unwrap(), 0);
        }
    }
}
