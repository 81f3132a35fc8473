//! 尺寸规格（SizeSpec）
//!
//! 每个响应通道的向量长度，在 `setup` 时协商一次，之后不再改变。

use crate::{Channel, ProtocolError};

/// 五个通道的向量长度（disp, vel, accel, force, time）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelSizes(pub [usize; Channel::COUNT]);

impl ChannelSizes {
    pub fn new(disp: usize, vel: usize, accel: usize, force: usize, time: usize) -> Self {
        Self([disp, vel, accel, force, time])
    }

    pub fn get(&self, channel: Channel) -> usize {
        self.0[channel.index()]
    }

    pub fn set(&mut self, channel: Channel, size: usize) {
        self.0[channel.index()] = size;
    }

    /// 所有通道的字数之和
    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    /// 通道在紧凑排列中的起始字（相对偏移）
    pub fn offset_of(&self, channel: Channel) -> usize {
        self.0[..channel.index()].iter().sum()
    }

    /// 第一个不一致的通道
    pub fn first_difference(&self, other: &ChannelSizes) -> Option<Channel> {
        Channel::ALL
            .into_iter()
            .find(|c| self.get(*c) != other.get(*c))
    }
}

/// 控制侧与采集侧的尺寸对 `(sizeCtrl, sizeDaq)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SizeSpec {
    pub ctrl: ChannelSizes,
    pub daq: ChannelSizes,
}

impl SizeSpec {
    pub fn new(ctrl: ChannelSizes, daq: ChannelSizes) -> Self {
        Self { ctrl, daq }
    }

    /// 两节点连接单元的标准形状
    ///
    /// 控制侧：disp/vel/accel 各 `num_dof`，time 1，不带 force；
    /// 采集侧：disp/vel/accel/force 各 `num_dof`，time 1。
    pub fn for_dof(num_dof: usize) -> Self {
        Self {
            ctrl: ChannelSizes::new(num_dof, num_dof, num_dof, 0, 1),
            daq: ChannelSizes::new(num_dof, num_dof, num_dof, num_dof, 1),
        }
    }

    /// 远程帧的字数：至少容纳 `1 + ctrl` 与 `daq`，且不小于 `floor`
    pub fn payload_words(&self, floor: usize) -> usize {
        floor.max(1 + self.ctrl.total()).max(self.daq.total())
    }

    /// 校验两侧尺寸完全一致
    pub fn check_agrees(&self, peer: &SizeSpec) -> Result<(), ProtocolError> {
        if let Some(channel) = self.ctrl.first_difference(&peer.ctrl) {
            return Err(ProtocolError::SizeDisagreement {
                side: "ctrl",
                channel,
                local: self.ctrl.get(channel),
                remote: peer.ctrl.get(channel),
            });
        }
        if let Some(channel) = self.daq.first_difference(&peer.daq) {
            return Err(ProtocolError::SizeDisagreement {
                side: "daq",
                channel,
                local: self.daq.get(channel),
                remote: peer.daq.get(channel),
            });
        }
        Ok(())
    }

    /// 协商前的基本合法性检查
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.ctrl.total() == 0 {
            return Err(ProtocolError::EmptySizes { side: "ctrl" });
        }
        if self.daq.total() == 0 {
            return Err(ProtocolError::EmptySizes { side: "daq" });
        }
        Ok(())
    }
}
