//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use expctl_sdk::prelude::*;
//! ```

// 会话层（推荐入口）
pub use crate::session::{ControlSession, SessionBuilder, SessionConfig, SessionError, SessionState};

// 数据类型
pub use crate::protocol::{Channel, ChannelSizes, Command, DaqResponse, SizeSpec, TrialResponse};

// 传输
pub use crate::transport::{
    RemoteConfig, RemoteTransport, SharedMemoryConfig, SharedMemoryTransport, Transport,
    TransportError,
};
