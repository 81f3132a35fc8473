//! 进程内试验端模拟器（测试替身）
//!
//! 在后台线程中扮演试验端的握手角色：
//! 看到 newTarget 后读取目标、置位 switchPC，等待 newTarget 清除，
//! 写回读区（`force = stiffness * disp + force_bias`），清除 switchPC，
//! 最后置位 atTarget。`at_target_delay` 用来验证仿真端不会提前回读。

use super::layout::{Flag, MemoryLayout};
use super::region::{HeapRegion, SharedRegion};
use crate::TransportError;
use expctl_protocol::Channel;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

/// 模拟器配置
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// 写完回读区后、置位 atTarget 前的等待
    pub at_target_delay: Duration,
    pub stiffness: f64,
    /// 初始（以及每步叠加的）测量力
    pub force_bias: f64,
    pub poll_interval: Duration,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            at_target_delay: Duration::ZERO,
            stiffness: 1.0,
            force_bias: 0.0,
            poll_interval: Duration::from_micros(50),
        }
    }
}

/// 模拟器观察到（或执行）的握手事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigEvent {
    TargetSeen,
    SwitchPcRaised,
    TargetApplied,
    AtTargetRaised,
}

struct Shared {
    stop: AtomicBool,
    steps: AtomicUsize,
    events: Mutex<Vec<RigEvent>>,
}

pub struct RigEmulator {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl RigEmulator {
    pub fn spawn(region: Arc<HeapRegion>, layout: MemoryLayout, config: EmulatorConfig) -> Self {
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            steps: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        });

        // 初始测量力为偏置
        for index in layout.daq(Channel::Force) {
            let _ = region.store_f32(index, config.force_bias as f32);
        }

        let worker = shared.clone();
        let handle = std::thread::spawn(move || {
            while !worker.stop.load(Ordering::Acquire) {
                match run_step(region.as_ref(), &layout, &config, &worker) {
                    Ok(true) => {
                        worker.steps.fetch_add(1, Ordering::AcqRel);
                    },
                    Ok(false) => spin_sleep::sleep(config.poll_interval),
                    Err(e) => {
                        warn!("Rig emulator stopped: {}", e);
                        break;
                    },
                }
            }
        });

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// 已完成的握手步数
    pub fn steps(&self) -> usize {
        self.shared.steps.load(Ordering::Acquire)
    }

    pub fn events(&self) -> Vec<RigEvent> {
        self.shared.events.lock().clone()
    }

    /// 停止线程并返回全部事件
    pub fn stop(mut self) -> Vec<RigEvent> {
        self.shutdown();
        self.events()
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RigEmulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 处理一个目标；没有新目标时返回 `Ok(false)`
fn run_step(
    region: &dyn SharedRegion,
    layout: &MemoryLayout,
    config: &EmulatorConfig,
    shared: &Shared,
) -> Result<bool, TransportError> {
    if region.load(layout.flag(Flag::NewTarget))? != 1 {
        return Ok(false);
    }
    let record = |event| shared.events.lock().push(event);
    record(RigEvent::TargetSeen);

    let mut target = Vec::with_capacity(Channel::COUNT);
    for channel in Channel::ALL {
        let values = layout
            .ctrl(channel)
            .map(|index| region.load_f32(index))
            .collect::<Result<Vec<_>, _>>()?;
        target.push(values);
    }

    region.store(layout.flag(Flag::SwitchPc), 1)?;
    region.raise();
    record(RigEvent::SwitchPcRaised);

    while region.load(layout.flag(Flag::NewTarget))? != 0 {
        if shared.stop.load(Ordering::Acquire) {
            return Ok(false);
        }
        std::hint::spin_loop();
    }

    for channel in [Channel::Disp, Channel::Vel, Channel::Accel, Channel::Time] {
        for (index, value) in layout.daq(channel).zip(&target[channel.index()]) {
            region.store_f32(index, *value)?;
        }
    }
    let disp = &target[Channel::Disp.index()];
    for (index, d) in layout.daq(Channel::Force).zip(disp) {
        let force = config.stiffness * f64::from(*d) + config.force_bias;
        region.store_f32(index, force as f32)?;
    }
    record(RigEvent::TargetApplied);

    if !config.at_target_delay.is_zero() {
        std::thread::sleep(config.at_target_delay);
    }
    region.store(layout.flag(Flag::SwitchPc), 0)?;
    region.store(layout.flag(Flag::AtTarget), 1)?;
    region.raise();
    record(RigEvent::AtTargetRaised);
    Ok(true)
}
