//! 安全通道（rustls）
//!
//! 客户端在 `connect` 阶段完成握手，之后的字帧在 TLS 记录层内传输。

use crate::TransportError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};
use std::fs::File;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 信任根来源
#[derive(Debug, Clone)]
pub enum TlsRoots {
    /// PEM 文件（可包含多个证书）
    PemFile(PathBuf),
    /// 直接提供的 DER 证书
    Certificates(Vec<CertificateDer<'static>>),
}

/// 安全通道选项
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// 用于证书校验的服务器名
    pub server_name: String,
    pub roots: TlsRoots,
}

impl TlsOptions {
    pub fn new(server_name: impl Into<String>, roots: TlsRoots) -> Self {
        Self {
            server_name: server_name.into(),
            roots,
        }
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(roots: &TlsRoots) -> Result<RootCertStore, TransportError> {
    let mut store = RootCertStore::empty();
    match roots {
        TlsRoots::PemFile(path) => {
            let file = File::open(path).map_err(|e| {
                TransportError::Config(format!("Cannot open CA file {}: {}", path.display(), e))
            })?;
            let mut reader = BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                store.add(cert?)?;
            }
        },
        TlsRoots::Certificates(certs) => {
            for cert in certs {
                store.add(cert.clone())?;
            }
        },
    }
    if store.is_empty() {
        return Err(TransportError::Config(
            "No trusted certificates for secure channel".into(),
        ));
    }
    Ok(store)
}

/// 在已建立的 TCP 连接上完成客户端握手
pub(crate) fn connect(
    options: &TlsOptions,
    mut tcp: TcpStream,
) -> Result<StreamOwned<ClientConnection, TcpStream>, TransportError> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store(&options.roots)?)
        .with_no_client_auth();
    let name = ServerName::try_from(options.server_name.clone()).map_err(|e| {
        TransportError::Config(format!("Invalid server name '{}': {}", options.server_name, e))
    })?;

    let mut conn = ClientConnection::new(Arc::new(config), name)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp)?;
    }
    Ok(StreamOwned::new(conn, tcp))
}

/// 试验端的服务器配置
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TransportError> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

/// 从 PEM 证书链与私钥文件创建服务器配置
pub fn server_config_from_pem(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Arc<ServerConfig>, TransportError> {
    let open = |path: &Path| {
        File::open(path).map(BufReader::new).map_err(|e| {
            TransportError::Config(format!("Cannot open {}: {}", path.display(), e))
        })
    };
    let certs = rustls_pemfile::certs(&mut open(cert_path.as_ref())?)
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut open(key_path.as_ref())?)?.ok_or_else(|| {
        TransportError::Config(format!(
            "No private key in {}",
            key_path.as_ref().display()
        ))
    })?;
    server_config(certs, key)
}

/// 试验端接受一个安全连接
pub fn accept(
    config: Arc<ServerConfig>,
    mut tcp: TcpStream,
) -> Result<StreamOwned<ServerConnection, TcpStream>, TransportError> {
    let mut conn = ServerConnection::new(config)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp)?;
    }
    Ok(StreamOwned::new(conn, tcp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_roots_rejected() {
        let err = root_store(&TlsRoots::Certificates(Vec::new())).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn test_missing_pem_file() {
        let err = root_store(&TlsRoots::PemFile("/nonexistent/ca.pem".into())).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn test_generated_root_accepted() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let store = root_store(&TlsRoots::Certificates(vec![certified.cert.der().clone()])).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_server_config_from_pem() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("site.pem");
        let key_path = dir.path().join("site.key");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        assert!(server_config_from_pem(&cert_path, &key_path).is_ok());

        // 证书文件里没有私钥
        let err = server_config_from_pem(&cert_path, &cert_path).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }
}
