//! DNS-over-TLS client settings for upstream transports.
//!
//! One rustls `ClientConfig` is built per forwarder and shared by every
//! upstream; each transport only carries its own server name.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};

use crate::config::TlsConfig;

#[derive(Clone, Debug)]
pub struct TlsSettings {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsSettings {
    pub fn new(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            config,
            server_name,
        }
    }

    /// 未配置 server_name 时使用上游 IP 进行证书校验
    pub fn for_upstream(
        config: Arc<ClientConfig>,
        server_name: Option<&str>,
        upstream: SocketAddr,
    ) -> anyhow::Result<Self> {
        let name = match server_name {
            Some(name) => ServerName::try_from(name.to_string())
                .with_context(|| format!("invalid tls server name: {}", name))?,
            None => ServerName::IpAddress(upstream.ip().into()),
        };
        Ok(Self::new(config, name))
    }

    pub fn connector(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(Arc::clone(&self.config))
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }
}

/// Build the shared client config: the configured CA bundle if any, the
/// webpki roots otherwise.
pub fn client_config(cfg: &TlsConfig) -> anyhow::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    match &cfg.ca_file {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("open tls ca file: {}", path.display()))?;
            let mut reader = BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.with_context(|| format!("parse tls ca file: {}", path.display()))?;
                roots
                    .add(cert)
                    .with_context(|| format!("add ca certificate from {}", path.display()))?;
            }
            if roots.is_empty() {
                anyhow::bail!("tls ca file {} holds no certificates", path.display());
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
