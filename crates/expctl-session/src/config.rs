//! 会话配置（TOML）
//!
//! ```toml
//! num_dof = 6
//! relative_trial = false
//! skip_unchanged_trial = true
//!
//! [transport]
//! kind = "remote"
//! host = "127.0.0.1"
//! port = 8090
//! ```
//!
//! `[sizes]` 缺省时按 `num_dof` 生成两节点连接单元的标准尺寸。

use crate::error::SessionError;
use expctl_protocol::{ChannelSizes, SizeSpec};
use expctl_transport::remote::{DEFAULT_HOST, TlsOptions, TlsRoots};
use expctl_transport::shmem::DEFAULT_NODE_ID;
use expctl_transport::{RemoteConfig, SharedMemoryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_num_dof() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_node_id() -> usize {
    DEFAULT_NODE_ID
}

/// 会话配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// `[sizes]` 缺省时使用
    #[serde(default = "default_num_dof")]
    pub num_dof: usize,

    #[serde(default)]
    pub sizes: Option<SizesConfig>,

    #[serde(default)]
    pub relative_trial: bool,

    #[serde(default = "default_true")]
    pub skip_unchanged_trial: bool,

    pub transport: TransportConfig,
}

/// 显式尺寸（disp, vel, accel, force, time）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizesConfig {
    pub ctrl: [usize; 5],
    pub daq: [usize; 5],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Remote(RemoteSettings),
    SharedMemory(SharedMemorySettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    /// PEM 格式的信任根（secure 时必需）
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// 帧字数下限
    #[serde(default)]
    pub data_size: usize,
    /// 0 表示不设超时
    #[serde(default)]
    pub io_timeout_ms: u64,
}

/// 等待标志的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    #[default]
    Poll,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMemorySettings {
    /// 设备或 `/dev/shm` 文件
    pub path: PathBuf,
    #[serde(default)]
    pub base_offset: usize,
    #[serde(default = "default_node_id")]
    pub node_id: usize,
    #[serde(default)]
    pub node_stride: usize,
    /// 每通道槽位数；缺省时取会话的 `num_dof`
    #[serde(default)]
    pub num_dof: Option<usize>,
    #[serde(default)]
    pub wait: WaitMode,
    #[serde(default)]
    pub poll_interval_us: u64,
    #[serde(default)]
    pub timeout_ms: u64,
}

impl SessionConfig {
    /// 远程传输的默认配置
    pub fn remote(num_dof: usize) -> Self {
        Self {
            num_dof,
            sizes: None,
            relative_trial: false,
            skip_unchanged_trial: true,
            transport: TransportConfig::Remote(RemoteSettings {
                host: default_host(),
                port: default_port(),
                secure: false,
                ca_cert: None,
                server_name: default_server_name(),
                data_size: 0,
                io_timeout_ms: 0,
            }),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SessionError> {
        let config: SessionConfig = toml::from_str(content)
            .map_err(|e| SessionError::Config(format!("Invalid session config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, SessionError> {
        toml::to_string(self).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// 检查各项取值是否自洽
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.num_dof == 0 {
            return Err(SessionError::Config("num_dof must be positive".into()));
        }
        self.size_spec()
            .validate()
            .map_err(|e| SessionError::Config(e.to_string()))?;

        match &self.transport {
            TransportConfig::Remote(remote) => {
                if remote.port == 0 {
                    return Err(SessionError::Config("remote port must be non-zero".into()));
                }
                if remote.secure && remote.ca_cert.is_none() {
                    return Err(SessionError::Config(
                        "secure remote transport requires ca_cert".into(),
                    ));
                }
            },
            TransportConfig::SharedMemory(shm) => {
                self.shared_memory_config(shm).layout()?;
            },
        }
        Ok(())
    }

    /// 本端请求的尺寸
    pub fn size_spec(&self) -> SizeSpec {
        match self.sizes {
            Some(sizes) => SizeSpec::new(ChannelSizes(sizes.ctrl), ChannelSizes(sizes.daq)),
            None => SizeSpec::for_dof(self.num_dof),
        }
    }

    pub fn remote_config(&self, remote: &RemoteSettings) -> RemoteConfig {
        let mut config = RemoteConfig::new(remote.host.clone(), remote.port)
            .with_data_size(remote.data_size);
        if remote.io_timeout_ms > 0 {
            config = config.with_io_timeout(Duration::from_millis(remote.io_timeout_ms));
        }
        if remote.secure
            && let Some(ca_cert) = &remote.ca_cert
        {
            config = config.with_tls(TlsOptions::new(
                remote.server_name.clone(),
                TlsRoots::PemFile(ca_cert.clone()),
            ));
        }
        config
    }

    pub fn shared_memory_config(&self, shm: &SharedMemorySettings) -> SharedMemoryConfig {
        SharedMemoryConfig {
            base_offset: shm.base_offset,
            node_id: shm.node_id,
            node_stride: shm.node_stride,
            num_dof: shm.num_dof.unwrap_or(self.num_dof),
            poll_interval: Duration::from_micros(shm.poll_interval_us),
            timeout: (shm.timeout_ms > 0).then(|| Duration::from_millis(shm.timeout_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_remote_defaults() {
        let config = SessionConfig::from_toml_str(
            r#"
            num_dof = 6

            [transport]
            kind = "remote"
            "#,
        )
        .unwrap();
        assert!(config.skip_unchanged_trial);
        assert!(!config.relative_trial);
        assert_eq!(config.size_spec(), SizeSpec::for_dof(6));

        let TransportConfig::Remote(remote) = &config.transport else {
            panic!("expected remote transport");
        };
        let rc = config.remote_config(remote);
        assert_eq!(rc.addr(), "127.0.0.1:8090");
        assert!(rc.tls.is_none());
        assert!(rc.io_timeout.is_none());
    }

    #[test]
    fn test_shared_memory_config() {
        let config = SessionConfig::from_toml_str(
            r#"
            num_dof = 3
            relative_trial = true

            [transport]
            kind = "shared_memory"
            path = "/dev/shm/expctl"
            base_offset = 64
            node_stride = 4096
            wait = "interrupt"
            timeout_ms = 500
            "#,
        )
        .unwrap();
        let TransportConfig::SharedMemory(shm) = &config.transport else {
            panic!("expected shared memory transport");
        };
        assert_eq!(shm.node_id, 3);
        assert_eq!(shm.wait, WaitMode::Interrupt);

        let smc = config.shared_memory_config(shm);
        assert_eq!(smc.num_dof, 3);
        assert_eq!(smc.timeout, Some(Duration::from_millis(500)));
        assert_eq!(smc.layout().unwrap().base_word(), (64 + 3 * 4096) / 4);
    }

    #[test]
    fn test_explicit_sizes() {
        let config = SessionConfig::from_toml_str(
            r#"
            [sizes]
            ctrl = [2, 2, 2, 2, 1]
            daq = [2, 2, 2, 2, 1]

            [transport]
            kind = "remote"
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.size_spec().ctrl, ChannelSizes::new(2, 2, 2, 2, 1));
    }

    #[test]
    fn test_invalid_configs() {
        let secure_without_ca = r#"
            [transport]
            kind = "remote"
            secure = true
        "#;
        assert!(matches!(
            SessionConfig::from_toml_str(secure_without_ca),
            Err(SessionError::Config(_))
        ));

        let misaligned = r#"
            [transport]
            kind = "shared_memory"
            path = "/tmp/x"
            base_offset = 2
        "#;
        assert!(SessionConfig::from_toml_str(misaligned).is_err());

        let unknown_kind = r#"
            [transport]
            kind = "carrier_pigeon"
        "#;
        assert!(SessionConfig::from_toml_str(unknown_kind).is_err());

        assert!(SessionConfig::from_toml_str("num_dof = 0\n[transport]\nkind = \"remote\"").is_err());
    }

    #[test]
    fn test_load_from_file_and_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let original = SessionConfig::remote(4);
        file.write_all(original.to_toml_string().unwrap().as_bytes())
            .unwrap();
        let loaded = SessionConfig::load(file.path()).unwrap();
        assert_eq!(loaded, original);

        assert!(matches!(
            SessionConfig::load("/nonexistent/session.toml"),
            Err(SessionError::Config(_))
        ));
    }
}
