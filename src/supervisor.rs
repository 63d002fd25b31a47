//! Component lifetime management.
//!
//! The supervisor builds every component in dependency order, spawns the
//! long-lived tasks, and owns the root shutdown scope. The first fatal
//! error (or a termination signal) cancels that scope; the listeners stop
//! accepting, and the store is closed last.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{listen_addr, Config};
use crate::dns_server::DnsServer;
use crate::http_status;
use crate::idprov;
use crate::intake::IntakeServer;
use crate::signer::Signer;
use crate::store::{Store, StoreError};

/// Errors that take the whole process down.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to bind {surface} listener: {source}")]
    NetworkBind {
        surface: &'static str,
        source: std::io::Error,
    },

    #[error("{surface} listener failed: {source}")]
    Listener {
        surface: &'static str,
        source: std::io::Error,
    },
}

pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    errors: mpsc::Receiver<FatalError>,
    tasks: Vec<JoinHandle<()>>,
    store: Store,
}

/// Construct every component and spawn the listeners. Components are wired
/// with plain constructors in dependency order; nothing global.
pub async fn start(config: Config) -> anyhow::Result<Supervisor> {
    let (errors_tx, errors_rx) = mpsc::channel::<FatalError>(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let providers = idprov::from_config(&config.provider)?;
    let store = Store::open(
        &config.store.file,
        config.ttl,
        &config.parent_zone,
        providers,
        config.store.sweep_interval,
        errors_tx.clone(),
    )
    .await?;

    let first_ns = &config.dns.ns[0];
    let signer = match &config.dns.dnssec_key {
        Some(blob) => Signer::load(
            blob,
            &config.parent_zone,
            &config.dns.mname,
            first_ns,
            store.clone(),
        )?,
        None => {
            let (signer, blob) = Signer::generate(
                &config.parent_zone,
                &config.dns.mname,
                first_ns,
                store.clone(),
            )?;
            info!(
                "no dnssec key configured; generated one. Persist it as dns.dnssec_key: {blob}"
            );
            signer
        }
    };
    info!(
        key_tag = signer.key_tag(),
        ds = %signer.ds_presentation(),
        "dnssec signer ready"
    );
    let signer = Arc::new(signer);

    let mut tasks = Vec::new();

    let dns = Arc::new(DnsServer::new(&config, store.clone(), signer)?);
    let dns_addr = listen_addr(&config.dns.address, config.dns.port)?;
    tasks.push(spawn_component(
        dns.run(dns_addr, shutdown_rx.clone()),
        errors_tx.clone(),
    ));

    let intake = IntakeServer::new(store.clone(), config.ttl);
    let intake_addr = listen_addr(&config.net.address, config.net.port)?;
    tasks.push(spawn_component(
        intake.run(intake_addr, shutdown_rx.clone()),
        errors_tx.clone(),
    ));

    let http_addr = listen_addr(&config.http.address, config.http.port)?;
    tasks.push(spawn_component(
        http_status::run(store.clone(), http_addr, shutdown_rx),
        errors_tx,
    ));

    info!(
        zone = config.parent_zone,
        ttl = %crate::config::format_go_duration(config.ttl),
        "claimdns started"
    );

    Ok(Supervisor {
        shutdown: shutdown_tx,
        errors: errors_rx,
        tasks,
        store,
    })
}

impl Supervisor {
    /// Block until a termination signal or the first fatal error, then
    /// shut everything down.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tokio::select! {
            _ = wait_for_signal() => info!("termination signal received"),
            err = self.errors.recv() => {
                if let Some(err) = err {
                    error!(error = %err, "fatal component error");
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Cancel the root scope, wait for the tasks, close the store. Errors
    /// that arrive during teardown are logged, nothing more.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        while let Ok(err) = self.errors.try_recv() {
            warn!(error = %err, "error during shutdown");
        }
        self.store.close().await;
        info!("shutdown complete");
    }

    /// Shared store handle, mainly for the integration tests.
    pub fn store(&self) -> &Store {
        &self.store
    }
}

fn spawn_component(
    component: impl Future<Output = Result<(), FatalError>> + Send + 'static,
    errors: mpsc::Sender<FatalError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = component.await {
            let _ = errors.send(e).await;
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
