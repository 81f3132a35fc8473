//! # Experimental Control Session
//!
//! 控制会话层：在 [`Transport`](expctl_transport::Transport) 之上实现
//! `setup → set_trial_response → get_daq_response → commit_state` 的单步循环。
//!
//! ## 模块
//!
//! - `session`: 会话状态机与单步约束
//! - `offset`: 相对试验偏移修正
//! - `config`: TOML 配置
//! - `builder`: 运行时选择传输的 Builder
//! - `error`: 会话错误类型

pub mod builder;
pub mod config;
pub mod error;
pub mod offset;
pub mod session;

pub use builder::{DynTransport, SessionBuilder};
pub use config::{SessionConfig, TransportConfig, WaitMode};
pub use error::SessionError;
pub use offset::{OffsetCorrector, OffsetState};
pub use session::{ControlSession, SessionState};

/// 会话层 Result 别名
pub type Result<T> = std::result::Result<T, SessionError>;
