//! 会话 Builder
//!
//! 提供链式 API 创建 `ControlSession`，传输种类在运行时选择。

use crate::config::{SessionConfig, TransportConfig, WaitMode};
use crate::error::SessionError;
use crate::session::ControlSession;
use crossbeam_channel::Receiver;
use expctl_protocol::SizeSpec;
use expctl_transport::shmem::SharedRegion;
use expctl_transport::{
    RemoteConfig, RemoteTransport, SharedMemoryConfig, SharedMemoryTransport, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;

/// 运行时选择的传输
pub type DynTransport = Box<dyn Transport + Send>;

enum TransportChoice {
    Remote(RemoteConfig),
    SharedMemoryFile(PathBuf, SharedMemoryConfig),
    SharedMemoryRegion(Arc<dyn SharedRegion>, SharedMemoryConfig),
}

/// 会话 Builder
///
/// # 示例
///
/// ```rust,no_run
/// use expctl_session::SessionBuilder;
/// use expctl_transport::RemoteConfig;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut session = SessionBuilder::new()
///     .num_dof(6)
///     .remote(RemoteConfig::new("192.168.1.20", 8090))
///     .relative_trial(true)
///     .build()?;
/// session.setup()?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    sizes: Option<SizeSpec>,
    num_dof: usize,
    relative_trial: bool,
    skip_unchanged_trial: bool,
    transport: Option<TransportChoice>,
    /// 配置要求中断等待
    wants_interrupts: bool,
    interrupts: Option<Receiver<()>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从配置文件内容创建
    pub fn from_config(config: &SessionConfig) -> Self {
        let mut builder = Self::new()
            .num_dof(config.num_dof)
            .sizes(config.size_spec())
            .relative_trial(config.relative_trial)
            .skip_unchanged_trial(config.skip_unchanged_trial);
        match &config.transport {
            TransportConfig::Remote(remote) => {
                builder = builder.remote(config.remote_config(remote));
            },
            TransportConfig::SharedMemory(shm) => {
                builder = builder.shared_memory(shm.path.clone(), config.shared_memory_config(shm));
                builder.wants_interrupts = shm.wait == WaitMode::Interrupt;
            },
        }
        builder
    }

    /// 按两节点连接单元的标准形状设置尺寸
    pub fn num_dof(mut self, num_dof: usize) -> Self {
        self.num_dof = num_dof;
        self
    }

    /// 显式尺寸（优先于 `num_dof`）
    pub fn sizes(mut self, sizes: SizeSpec) -> Self {
        self.sizes = Some(sizes);
        self
    }

    pub fn relative_trial(mut self, enabled: bool) -> Self {
        self.relative_trial = enabled;
        self
    }

    pub fn skip_unchanged_trial(mut self, enabled: bool) -> Self {
        self.skip_unchanged_trial = enabled;
        self
    }

    pub fn remote(mut self, config: RemoteConfig) -> Self {
        self.transport = Some(TransportChoice::Remote(config));
        self
    }

    /// 映射设备或文件作为共享内存
    pub fn shared_memory(mut self, path: impl Into<PathBuf>, config: SharedMemoryConfig) -> Self {
        self.transport = Some(TransportChoice::SharedMemoryFile(path.into(), config));
        self
    }

    /// 使用已有的共享区域
    pub fn shared_region(mut self, region: Arc<dyn SharedRegion>, config: SharedMemoryConfig) -> Self {
        self.transport = Some(TransportChoice::SharedMemoryRegion(region, config));
        self
    }

    /// 由中断回调喂入的唤醒通道（仅共享内存）
    pub fn interrupts(mut self, source: Receiver<()>) -> Self {
        self.interrupts = Some(source);
        self
    }

    /// 构建未配置的会话；调用方随后执行 `setup`
    pub fn build(self) -> Result<ControlSession<DynTransport>, SessionError> {
        let sizes = match self.sizes {
            Some(sizes) => sizes,
            None if self.num_dof > 0 => SizeSpec::for_dof(self.num_dof),
            None => return Err(SessionError::Config("num_dof must be positive".into())),
        };

        let transport: DynTransport = match self.transport {
            None => return Err(SessionError::Config("no transport configured".into())),
            Some(TransportChoice::Remote(config)) => {
                if self.interrupts.is_some() {
                    return Err(SessionError::Config(
                        "interrupt source given for a remote transport".into(),
                    ));
                }
                Box::new(RemoteTransport::new(config))
            },
            Some(TransportChoice::SharedMemoryFile(path, config)) => {
                let transport = SharedMemoryTransport::open(path, config)?;
                Box::new(Self::attach_interrupts(
                    transport,
                    self.interrupts,
                    self.wants_interrupts,
                )?)
            },
            Some(TransportChoice::SharedMemoryRegion(region, config)) => {
                let transport = SharedMemoryTransport::new(region, config)?;
                Box::new(Self::attach_interrupts(
                    transport,
                    self.interrupts,
                    self.wants_interrupts,
                )?)
            },
        };

        Ok(ControlSession::new(transport, sizes)
            .with_relative_trial(self.relative_trial)
            .with_skip_unchanged_trial(self.skip_unchanged_trial))
    }

    fn attach_interrupts(
        transport: SharedMemoryTransport,
        source: Option<Receiver<()>>,
        required: bool,
    ) -> Result<SharedMemoryTransport, SessionError> {
        match source {
            Some(source) => Ok(transport.with_interrupts(source)),
            None if required => Err(SessionError::Config(
                "interrupt wait mode requires an interrupt source".into(),
            )),
            None => Ok(transport),
        }
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            sizes: None,
            num_dof: 1,
            relative_trial: false,
            skip_unchanged_trial: true,
            transport: None,
            wants_interrupts: false,
            interrupts: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use expctl_transport::TransportKind;
    use expctl_transport::shmem::HeapRegion;

    #[test]
    fn test_builder_requires_transport() {
        assert!(matches!(
            SessionBuilder::new().build(),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_builder_remote() {
        let session = SessionBuilder::new()
            .num_dof(6)
            .remote(RemoteConfig::default())
            .build()
            .unwrap();
        assert_eq!(session.state(), SessionState::Unconfigured);
        assert_eq!(session.requested_sizes(), SizeSpec::for_dof(6));
        assert_eq!(session.transport().kind(), TransportKind::Remote);
    }

    #[test]
    fn test_builder_shared_region() {
        let config = SharedMemoryConfig {
            node_id: 0,
            ..SharedMemoryConfig::new(2)
        };
        let region = Arc::new(HeapRegion::new(config.layout().unwrap().end_word()));
        let mut session = SessionBuilder::new()
            .num_dof(2)
            .shared_region(region, config)
            .build()
            .unwrap();
        assert_eq!(session.transport().kind(), TransportKind::SharedMemory);
        session.setup().unwrap();
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn test_interrupt_mode_needs_source() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let toml = format!(
            r#"
            num_dof = 2
            [transport]
            kind = "shared_memory"
            path = "{}"
            node_id = 0
            wait = "interrupt"
            "#,
            file.path().display()
        );
        let config = SessionConfig::from_toml_str(&toml).unwrap();
        assert!(matches!(
            SessionBuilder::from_config(&config).build(),
            Err(SessionError::Config(_))
        ));

        let (_tx, rx) = crossbeam_channel::bounded(1);
        let session = SessionBuilder::from_config(&config)
            .interrupts(rx)
            .build()
            .unwrap();
        assert_eq!(session.transport().kind(), TransportKind::SharedMemory);
    }
}
