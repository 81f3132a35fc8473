//! 共享内存布局
//!
//! ```text
//! base = base_offset + node_id * node_stride（字节，4 字节对齐）
//!
//! word base+0          newTarget
//! word base+1          switchPC
//! word base+2          atTarget
//! word base+3 ..       ctrl: disp, vel, accel, force, time（各 num_dof 个 f32）
//! word base+3+5n ..    daq:  disp, vel, accel, force, time（各 num_dof 个 f32）
//! ```

use crate::TransportError;
use expctl_protocol::Channel;
use std::ops::Range;

/// 共享内存字长（字节）
pub const WORD_BYTES: usize = 4;

/// 握手标志字数
pub const FLAG_WORDS: usize = 3;

/// 握手标志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// 仿真端已写入新目标
    NewTarget,
    /// 试验端已取走目标
    SwitchPc,
    /// 试验端已到达目标
    AtTarget,
}

impl Flag {
    pub const ALL: [Flag; FLAG_WORDS] = [Flag::NewTarget, Flag::SwitchPc, Flag::AtTarget];

    fn slot(self) -> usize {
        match self {
            Flag::NewTarget => 0,
            Flag::SwitchPc => 1,
            Flag::AtTarget => 2,
        }
    }
}

/// 单个节点的字布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    base: usize,
    num_dof: usize,
}

impl MemoryLayout {
    /// 由字节偏移计算布局
    pub fn new(
        base_offset: usize,
        node_id: usize,
        node_stride: usize,
        num_dof: usize,
    ) -> Result<Self, TransportError> {
        if num_dof == 0 {
            return Err(TransportError::Config("num_dof must be positive".into()));
        }
        let base_bytes = node_id
            .checked_mul(node_stride)
            .and_then(|bias| bias.checked_add(base_offset))
            .ok_or_else(|| TransportError::Config("node offset overflows".into()))?;
        if base_bytes % WORD_BYTES != 0 {
            return Err(TransportError::Config(format!(
                "node base offset {} is not a multiple of {} bytes",
                base_bytes, WORD_BYTES
            )));
        }
        Ok(Self {
            base: base_bytes / WORD_BYTES,
            num_dof,
        })
    }

    pub fn num_dof(&self) -> usize {
        self.num_dof
    }

    /// 节点起始字
    pub fn base_word(&self) -> usize {
        self.base
    }

    pub fn flag(&self, flag: Flag) -> usize {
        self.base + flag.slot()
    }

    /// 下发（ctrl）通道的字范围
    pub fn ctrl(&self, channel: Channel) -> Range<usize> {
        let start = self.base + FLAG_WORDS + channel.index() * self.num_dof;
        start..start + self.num_dof
    }

    /// 回读（daq）通道的字范围
    pub fn daq(&self, channel: Channel) -> Range<usize> {
        let start = self.inbound().start + channel.index() * self.num_dof;
        start..start + self.num_dof
    }

    /// 整个下发区
    pub fn outbound(&self) -> Range<usize> {
        let start = self.base + FLAG_WORDS;
        start..start + Channel::COUNT * self.num_dof
    }

    /// 整个回读区
    pub fn inbound(&self) -> Range<usize> {
        let start = self.outbound().end;
        start..start + Channel::COUNT * self.num_dof
    }

    /// 布局结束字（不含）
    pub fn end_word(&self) -> usize {
        self.inbound().end
    }

    /// 区域至少需要的字节数
    pub fn required_bytes(&self) -> usize {
        self.end_word() * WORD_BYTES
    }
}
