//! 相对试验偏移修正
//!
//! 相对试验模式下，在第一次 `set_trial_response` 时捕获：
//!
//! - `Δd`: 当时的绝对试验位移
//! - `Δf`: 当时的测量力
//!
//! 之后每次跨越边界都施加另一方向的加法逆：
//!
//! ```text
//! 下发: disp − Δd,  force + Δf
//! 回读: disp + Δd,  force − Δf
//! ```
//!
//! 未启用时为恒等变换。

use expctl_protocol::{DaqResponse, TrialResponse};
use tracing::info;

/// 捕获的偏移（每个会话至多捕获一次）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffsetState {
    pub trial_disp_offset: Vec<f64>,
    pub trial_force_offset: Vec<f64>,
    pub got_relative_trial: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OffsetCorrector {
    enabled: bool,
    state: OffsetState,
}

impl OffsetCorrector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: OffsetState::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_captured(&self) -> bool {
        self.state.got_relative_trial
    }

    pub fn state(&self) -> &OffsetState {
        &self.state
    }

    /// 启用且尚未捕获
    pub fn needs_capture(&self) -> bool {
        self.enabled && !self.state.got_relative_trial
    }

    /// 捕获偏移；已捕获或未启用时不做任何事，返回 `false`
    pub fn capture(&mut self, disp: &[f64], force: &[f64]) -> bool {
        if !self.needs_capture() {
            return false;
        }
        self.state = OffsetState {
            trial_disp_offset: disp.to_vec(),
            trial_force_offset: force.to_vec(),
            got_relative_trial: true,
        };
        info!(
            "Captured relative trial offset: disp {:?}, force {:?}",
            self.state.trial_disp_offset, self.state.trial_force_offset
        );
        true
    }

    /// 会话重新配置时清除
    pub fn reset(&mut self) {
        self.state = OffsetState::default();
    }

    /// 下发前修正
    pub fn apply_outbound(&self, trial: &TrialResponse) -> TrialResponse {
        if !self.is_captured() {
            return trial.clone();
        }
        let mut out = trial.clone();
        shift(&mut out.disp, &self.state.trial_disp_offset, -1.0);
        if let Some(force) = out.force.as_mut() {
            shift(force, &self.state.trial_force_offset, 1.0);
        }
        out
    }

    /// 回读后修正
    pub fn apply_inbound(&self, daq: &DaqResponse) -> DaqResponse {
        if !self.is_captured() {
            return daq.clone();
        }
        let mut out = daq.clone();
        shift(&mut out.disp, &self.state.trial_disp_offset, 1.0);
        shift(&mut out.force, &self.state.trial_force_offset, -1.0);
        out
    }
}

fn shift(values: &mut [f64], offset: &[f64], sign: f64) {
    for (value, delta) in values.iter_mut().zip(offset) {
        *value += sign * delta;
    }
}
