use axum_server::tls_rustls::RustlsConfig;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Certificate and key that can be swapped in place while the listener runs.
#[derive(Clone)]
pub struct TlsConfig {
    rustls: RustlsConfig,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl TlsConfig {
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let cert_path = cert_path.as_ref().to_path_buf();
        let key_path = key_path.as_ref().to_path_buf();

        let config = load_config(&cert_path, &key_path)?;

        Ok(Self {
            rustls: RustlsConfig::from_config(Arc::new(config)),
            cert_path,
            key_path,
        })
    }

    pub fn rustls(&self) -> RustlsConfig {
        self.rustls.clone()
    }

    pub fn reload(&self) -> anyhow::Result<()> {
        info!(cert = %self.cert_path.display(), "reloading TLS certificate and key");
        match load_config(&self.cert_path, &self.key_path) {
            Ok(config) => {
                self.rustls.reload_from_config(Arc::new(config));
                info!("TLS certificate reloaded");
                Ok(())
            }
            Err(e) => {
                error!("failed to reload TLS certificate: {}", e);
                Err(e)
            }
        }
    }
}

pub fn load_config(cert_path: &Path, key_path: &Path) -> anyhow::Result<ServerConfig> {
    let cert_file = File::open(cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", cert_path.display(), e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate: {}", e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in certificate file");
    }

    let key_file = File::open(key_path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", key_path.display(), e))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?
        .ok_or_else(|| anyhow::anyhow!("No private keys found in key file"))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("Failed to select TLS versions: {}", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("Failed to build TLS config: {}", e))?;

    // Websocket upgrades need HTTP/1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

/// Reload the certificate pair whenever the process receives SIGHUP.
pub fn setup_tls_reload_handler(tls_config: TlsConfig) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to register SIGHUP handler: {}", e);
                return;
            }
        };

        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                if let Err(e) = tls_config.reload() {
                    error!("Failed to reload TLS certificate on SIGHUP: {}", e);
                }
            }
        });
    }
    #[cfg(not(unix))]
    drop(tls_config);
}
