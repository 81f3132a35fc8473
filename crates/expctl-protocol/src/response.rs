//! 试验响应与采集响应

use crate::{Channel, ChannelSizes, ProtocolError};

/// 试验响应（trial）：下发给试验端的运动学状态
///
/// `force` 可选：并非所有传输在控制侧都携带力。
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrialResponse {
    pub disp: Vec<f64>,
    pub vel: Vec<f64>,
    pub accel: Vec<f64>,
    pub force: Option<Vec<f64>>,
    pub time: Vec<f64>,
}

impl TrialResponse {
    pub fn new(disp: Vec<f64>, vel: Vec<f64>, accel: Vec<f64>, time: Vec<f64>) -> Self {
        Self {
            disp,
            vel,
            accel,
            force: None,
            time,
        }
    }

    pub fn with_force(mut self, force: Vec<f64>) -> Self {
        self.force = Some(force);
        self
    }

    /// 按控制侧尺寸创建全零响应
    pub fn zeros(sizes: &ChannelSizes) -> Self {
        let force = match sizes.get(Channel::Force) {
            0 => None,
            n => Some(vec![0.0; n]),
        };
        Self {
            disp: vec![0.0; sizes.get(Channel::Disp)],
            vel: vec![0.0; sizes.get(Channel::Vel)],
            accel: vec![0.0; sizes.get(Channel::Accel)],
            force,
            time: vec![0.0; sizes.get(Channel::Time)],
        }
    }

    /// 通道数据；未提供的 force 返回空切片
    pub fn channel(&self, channel: Channel) -> &[f64] {
        match channel {
            Channel::Disp => &self.disp,
            Channel::Vel => &self.vel,
            Channel::Accel => &self.accel,
            Channel::Force => self.force.as_deref().unwrap_or(&[]),
            Channel::Time => &self.time,
        }
    }

    /// 检查各通道长度与协商尺寸一致
    ///
    /// 缺省的 force 视为全零，不参与检查。
    pub fn validate(&self, sizes: &ChannelSizes) -> Result<(), ProtocolError> {
        for channel in Channel::ALL {
            if channel == Channel::Force && self.force.is_none() {
                continue;
            }
            check_len(channel, sizes.get(channel), self.channel(channel).len())?;
        }
        Ok(())
    }
}

/// 采集响应（daq）：试验端测得的状态，始终包含 force
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DaqResponse {
    pub disp: Vec<f64>,
    pub vel: Vec<f64>,
    pub accel: Vec<f64>,
    pub force: Vec<f64>,
    pub time: Vec<f64>,
}

impl DaqResponse {
    /// 按采集侧尺寸创建全零响应
    pub fn zeros(sizes: &ChannelSizes) -> Self {
        Self {
            disp: vec![0.0; sizes.get(Channel::Disp)],
            vel: vec![0.0; sizes.get(Channel::Vel)],
            accel: vec![0.0; sizes.get(Channel::Accel)],
            force: vec![0.0; sizes.get(Channel::Force)],
            time: vec![0.0; sizes.get(Channel::Time)],
        }
    }

    pub fn channel(&self, channel: Channel) -> &[f64] {
        match channel {
            Channel::Disp => &self.disp,
            Channel::Vel => &self.vel,
            Channel::Accel => &self.accel,
            Channel::Force => &self.force,
            Channel::Time => &self.time,
        }
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut Vec<f64> {
        match channel {
            Channel::Disp => &mut self.disp,
            Channel::Vel => &mut self.vel,
            Channel::Accel => &mut self.accel,
            Channel::Force => &mut self.force,
            Channel::Time => &mut self.time,
        }
    }

    pub fn validate(&self, sizes: &ChannelSizes) -> Result<(), ProtocolError> {
        for channel in Channel::ALL {
            check_len(channel, sizes.get(channel), self.channel(channel).len())?;
        }
        Ok(())
    }
}

fn check_len(channel: Channel, expected: usize, actual: usize) -> Result<(), ProtocolError> {
    if expected != actual {
        return Err(ProtocolError::ChannelLength {
            channel,
            expected,
            actual,
        });
    }
    Ok(())
}
