//! The surveyor service: collector plus HTTP listener, with a start/stop
//! lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use surveyor_core::{ConfigError, SurveyScope, SurveyorConfig};
use surveyor_engine::SurveyEngine;
use surveyor_metrics::{CollectorSettings, SurveyCollector};
use surveyor_transport::Transport;

use crate::auth::BasicAuth;
use crate::build_router;
use crate::tls::load_server_config;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Result type alias for surveyor lifecycle operations.
pub type SurveyorResult<T> = Result<T, SurveyorError>;

#[derive(Debug, Error)]
pub enum SurveyorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("tls setup failed: {0:#}")]
    Tls(anyhow::Error),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("surveyor is already running")]
    AlreadyRunning,
}

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Surveys a cluster and serves the result on `/metrics`.
pub struct Surveyor {
    config: SurveyorConfig,
    collector: SurveyCollector,
    transport: Arc<dyn Transport>,
    tls: Option<Arc<rustls::ServerConfig>>,
    running: Option<Running>,
}

impl Surveyor {
    /// Validate the config, load TLS material, and wire the collector to
    /// `transport`. Fails if the transport is not connected.
    pub fn new(config: SurveyorConfig, transport: Arc<dyn Transport>) -> SurveyorResult<Self> {
        config.validate()?;

        if !transport.is_connected() {
            return Err(SurveyorError::Startup(
                "no connection to the messaging fabric".to_string(),
            ));
        }

        let tls = match &config.http.tls {
            Some(tls) => Some(
                load_server_config(&tls.cert_file, &tls.key_file, tls.ca_file.as_deref())
                    .map_err(SurveyorError::Tls)?,
            ),
            None => None,
        };

        let scope = if config.system_account.is_some() {
            SurveyScope::Full
        } else {
            warn!("no system account configured, core stats will not be exported");
            SurveyScope::Basic
        };
        let engine = SurveyEngine::new(Arc::clone(&transport), config.survey_subject(), scope);

        let settings = CollectorSettings {
            namespace: config.namespace.clone(),
            survey_timeout: config.survey.timeout()?,
            min_interval: config.survey.min_interval()?,
            scrape_timeout: config.survey.scrape_timeout()?,
            expected_servers: config.survey.expected_servers,
            expected_members: config.survey.expected_members.clone(),
        };

        Ok(Self {
            collector: SurveyCollector::new(engine, settings),
            config,
            transport,
            tls,
            running: None,
        })
    }

    pub fn collector(&self) -> &SurveyCollector {
        &self.collector
    }

    pub fn config(&self) -> &SurveyorConfig {
        &self.config
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Run the first survey, then start serving. Fails if that survey
    /// cannot reach the transport.
    pub async fn start(&mut self) -> SurveyorResult<SocketAddr> {
        if self.running.is_some() {
            return Err(SurveyorError::AlreadyRunning);
        }
        if !self.transport.is_connected() {
            return Err(SurveyorError::Startup(
                "no connection to the messaging fabric".to_string(),
            ));
        }

        let samples = self
            .collector
            .prime()
            .await
            .map_err(|e| SurveyorError::Startup(e.to_string()))?;
        debug!(samples = samples.len(), "initial survey complete");

        let addr = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| SurveyorError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| SurveyorError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let auth = self
            .config
            .http_credentials()
            .map(|(user, password)| BasicAuth::new(user, password));
        let router = build_router(self.collector.clone(), auth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = match &self.tls {
            Some(tls) => {
                info!(%local_addr, "serving metrics over https");
                let acceptor = TlsAcceptor::from(Arc::clone(tls));
                tokio::spawn(serve_tls(listener, router, acceptor, shutdown_rx))
            }
            None => {
                info!(%local_addr, "serving metrics over http");
                tokio::spawn(serve_plain(listener, router, shutdown_rx))
            }
        };

        self.running = Some(Running {
            local_addr,
            shutdown_tx,
            handle,
        });
        Ok(local_addr)
    }

    /// Stop serving. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            error!(error = %e, "listener task failed");
        }
        info!(addr = %running.local_addr, "surveyor stopped");
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn serve_plain(listener: TcpListener, router: Router, shutdown: watch::Receiver<bool>) {
    let server = axum::serve(listener, router).with_graceful_shutdown(wait_for_shutdown(shutdown));
    if let Err(e) = server.await {
        error!(error = %e, "http server error");
    }
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    acceptor: TlsAcceptor,
    shutdown: watch::Receiver<bool>,
) {
    let stop = wait_for_shutdown(shutdown);
    tokio::pin!(stop);

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(router.clone());
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%peer, error = %e, "tls handshake failed");
                    return;
                }
            };
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%peer, error = %e, "connection error");
            }
        });
    }
}

impl Drop for Surveyor {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(true);
            running.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_errors_back_off() {
        assert!(ACCEPT_BACKOFF >= Duration::from_millis(10));
        assert!(ACCEPT_BACKOFF <= Duration::from_secs(1));
    }
}
