//! expctl SDK - 混合试验的试验控制协议
//!
//! 在每个仿真时间步，把试验响应（位移/速度/加速度/时间）发送到试验端，
//! 并取回测量响应（位移/速度/加速度/力/时间）。
//!
//! # 架构设计
//!
//! 从底层到高层：
//!
//! - **协议层** (`protocol`): 命令目录、尺寸规格、响应向量、字帧编解码
//! - **传输层** (`transport`): `Transport` trait，远程（TCP/TLS）与共享内存两种实现
//! - **会话层** (`session`): 会话状态机、单步约束、相对试验偏移、配置
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use expctl_sdk::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! expctl_sdk::logging::init();
//!
//! let mut session = SessionBuilder::new()
//!     .num_dof(6)
//!     .remote(RemoteConfig::new("127.0.0.1", 8090))
//!     .build()?;
//! session.setup()?;
//!
//! let trial = TrialResponse::new(vec![0.0; 6], vec![0.0; 6], vec![0.0; 6], vec![0.0]);
//! session.set_trial_response(&trial)?;
//! let daq = session.get_daq_response()?;
//! session.commit_state()?;
//! println!("{:?}", daq.force);
//! # Ok(())
//! # }
//! ```

pub mod logging;
pub mod prelude;

pub use expctl_protocol as protocol;
pub use expctl_session as session;
pub use expctl_transport as transport;

// 常用类型
pub use expctl_protocol::{Command, DaqResponse, ProtocolError, SizeSpec, TrialResponse};
pub use expctl_session::{ControlSession, SessionBuilder, SessionConfig, SessionError, SessionState};
pub use expctl_transport::{Transport, TransportError};
