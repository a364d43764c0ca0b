use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::{self, AppState};
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::tls::{setup_tls_reload_handler, TlsConfig};

pub struct SignalingServer {
    config: ServerConfig,
    state: AppState,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SignalingServer {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = AppState::new(config.clone(), shutdown_rx)?;

        Ok(Self {
            config,
            state,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let app = api::router(self.state.clone());
        let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
        let addr = self.config.bind_addr;

        tokio::spawn(Self::eviction_task(
            self.state.rate_limiter.clone(),
            self.shutdown_tx.subscribe(),
        ));

        if let Some((cert_path, key_path)) = self.config.tls_paths() {
            let tls_config = TlsConfig::new(cert_path, key_path)?;
            setup_tls_reload_handler(tls_config.clone());

            let handle = axum_server::Handle::new();
            let signal = Self::shutdown_signal(self.shutdown_tx.subscribe());
            let shutdown_tx = Arc::clone(&self.shutdown_tx);
            let shutdown_handle = handle.clone();
            let grace = self.config.shutdown_timeout();
            tokio::spawn(async move {
                signal.await;
                let _ = shutdown_tx.send(true);
                shutdown_handle.graceful_shutdown(Some(grace));
            });

            info!("tivi-signaling listening on {} (HTTPS)", addr);
            axum_server::bind_rustls(addr, tls_config.rustls())
                .handle(handle)
                .serve(make_service)
                .await?;
        } else {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("tivi-signaling listening on {} (HTTP)", addr);

            let signal = Self::shutdown_signal(self.shutdown_tx.subscribe());
            let shutdown_tx = Arc::clone(&self.shutdown_tx);
            axum::serve(listener, make_service)
                .with_graceful_shutdown(async move {
                    signal.await;
                    // Open websockets watch this and run their normal cleanup.
                    let _ = shutdown_tx.send(true);
                })
                .await?;
        }

        info!("tivi-signaling stopped");
        Ok(())
    }

    /// Forget rate-limit buckets for addresses that have gone quiet.
    async fn eviction_task(rate_limiter: RateLimiter, mut shutdown: watch::Receiver<bool>) {
        let window = rate_limiter.window();
        let mut interval = tokio::time::interval(window);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = rate_limiter.evict_idle(window);
                    if evicted > 0 {
                        debug!(evicted, remaining = rate_limiter.bucket_count(), "evicted idle rate-limit buckets");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    match sigterm.as_mut() {
                        Some(sigterm) => { sigterm.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = async {
                if *shutdown.borrow_and_update() {
                    return;
                }
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                std::future::pending::<()>().await
            } => {
                info!("Shutdown requested");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
