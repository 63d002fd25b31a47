//! Claim intake endpoint.
//!
//! A client claims (or refreshes) its name simply by connecting: the peer
//! address of the TCP connection is the claim. The endpoint writes a short
//! textual confirmation and closes; it never reads from the socket.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use chrono::SecondsFormat;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::format_go_duration;
use crate::store::{Entry, Store};
use crate::supervisor::FatalError;

const IPV4_REJECTED: &str = "IPv4 not supported\n";
const UPSERT_FAILED: &str = "Failed to add entry.\n";

pub struct IntakeServer {
    store: Store,
    ttl: Duration,
}

impl IntakeServer {
    pub fn new(store: Store, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn run(
        self,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), FatalError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FatalError::NetworkBind {
                surface: "intake",
                source,
            })?;
        info!(%addr, "intake endpoint listening");
        self.run_on_listener(listener, shutdown).await
    }

    /// Accept loop over an already-bound listener (the tests hand in one
    /// bound to an ephemeral port).
    pub async fn run_on_listener(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), FatalError> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                res = listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(e) if *shutdown.borrow() => {
                        debug!(error = %e, "intake accept interrupted by shutdown");
                        return Ok(());
                    }
                    Err(source) => {
                        return Err(FatalError::Listener {
                            surface: "intake",
                            source,
                        })
                    }
                },
            };

            let store = self.store.clone();
            let ttl = self.ttl;
            tokio::spawn(async move {
                handle_connection(stream, peer, store, ttl).await;
            });
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, store: Store, ttl: Duration) {
    let response = match claimable_address(peer.ip()) {
        None => IPV4_REJECTED.to_string(),
        Some(addr) => match store.upsert(addr).await {
            Ok((entry, fqdn)) => {
                info!(%addr, fqdn, "new claim via intake");
                success_message(addr, &fqdn, ttl, &entry)
            }
            Err(e) => {
                warn!(%addr, error = %e, "intake upsert failed");
                UPSERT_FAILED.to_string()
            }
        },
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(%peer, error = %e, "failed to write intake response");
    }
    // Dropping the stream closes the connection.
}

/// The usable IPv6 address behind a peer, if any. IPv4 peers and
/// IPv4-mapped IPv6 peers cannot claim.
fn claimable_address(ip: IpAddr) -> Option<Ipv6Addr> {
    match ip {
        IpAddr::V4(_) => None,
        IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => None,
        IpAddr::V6(v6) => Some(v6),
    }
}

fn success_message(addr: Ipv6Addr, fqdn: &str, ttl: Duration, entry: &Entry) -> String {
    format!(
        "Address: {addr}\nDNS Name: {fqdn}\nValid for {}\nExpires {}\n",
        format_go_duration(ttl),
        entry.expires.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}
