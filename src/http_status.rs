//! HTTP status surface.
//!
//! Shows whether the caller currently holds a claim and lets it create one
//! with a POST. Runs beside the intake endpoint mainly for humans behind
//! browsers and for monitoring.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, SecondsFormat, Utc};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::store::Store;
use crate::supervisor::FatalError;

const FAILED_TO_GET_INFO: &str = "Failed to get information about client";
const FAILED_TO_ADD_ENTRY: &str = "Failed to add entry";

#[derive(Serialize)]
struct StatusReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    res: Option<StatusInfo>,
}

#[derive(Serialize)]
struct StatusInfo {
    has_dns: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires: Option<DateTime<Utc>>,
    address: IpAddr,
}

pub async fn run(
    store: Store,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), FatalError> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let store = store.clone();
        let peer = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(req, store.clone(), peer)))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| FatalError::NetworkBind {
            surface: "http",
            source: std::io::Error::other(e),
        })?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });

    info!(%addr, "http status listening");
    server.await.map_err(|e| FatalError::Listener {
        surface: "http",
        source: std::io::Error::other(e),
    })
}

async fn handle(
    req: Request<Body>,
    store: Store,
    peer: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    let ip = caller_ip(&req, peer);

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => match status_info(&store, ip).await {
            Ok(info) => html_response(StatusCode::OK, &render_html(&info)),
            Err(e) => {
                warn!(%peer, error = %e, "status lookup failed");
                html_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &render_error_html(FAILED_TO_GET_INFO),
                )
            }
        },
        (&Method::GET, "/json") => match status_info(&store, ip).await {
            Ok(info) => json_response(
                StatusCode::OK,
                &StatusReply {
                    ok: true,
                    error: None,
                    res: Some(info),
                },
            ),
            Err(e) => {
                warn!(%peer, error = %e, "status lookup failed");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &StatusReply {
                        ok: false,
                        error: Some(FAILED_TO_GET_INFO.to_string()),
                        res: None,
                    },
                )
            }
        },
        (&Method::POST, path @ ("/" | "/json")) => match claim(&store, ip).await {
            // Redirect to the matching GET so a refresh does not re-claim.
            Ok(()) => Response::builder()
                .status(StatusCode::SEE_OTHER)
                .header("Location", path)
                .body(Body::empty())
                .unwrap_or_default(),
            Err(e) => {
                warn!(%peer, error = %e, "claim via http failed");
                if path == "/json" {
                    json_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &StatusReply {
                            ok: false,
                            error: Some(FAILED_TO_ADD_ENTRY.to_string()),
                            res: None,
                        },
                    )
                } else {
                    html_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &render_error_html(FAILED_TO_ADD_ENTRY),
                    )
                }
            }
        },
        _ => Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::empty())
            .unwrap_or_default(),
    };

    Ok(response)
}

/// The address the status applies to: the first X-Forwarded-For entry when
/// a proxy put one there, otherwise the socket peer.
fn caller_ip(req: &Request<Body>, peer: SocketAddr) -> IpAddr {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|list| list.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or_else(|| peer.ip())
}

async fn status_info(store: &Store, ip: IpAddr) -> Result<StatusInfo, crate::store::StoreError> {
    let mut info = StatusInfo {
        has_dns: false,
        dns_name: None,
        expires: None,
        address: ip,
    };

    if let IpAddr::V6(v6) = ip {
        if v6.to_ipv4_mapped().is_none() {
            if let Some((entry, label)) = store.resolve_by_address(v6).await? {
                info.has_dns = true;
                info.dns_name = Some(format!("{label}.{}", store.parent_zone()));
                info.expires = Some(entry.expires);
            }
        }
    }

    Ok(info)
}

async fn claim(store: &Store, ip: IpAddr) -> Result<(), crate::store::StoreError> {
    match ip {
        IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => {
            store.upsert(v6).await?;
            Ok(())
        }
        _ => Err(crate::store::StoreError::Unavailable(
            "caller has no usable IPv6 address".into(),
        )),
    }
}

fn render_html(info: &StatusInfo) -> String {
    let body = if info.has_dns {
        format!(
            "<p>Your address <code>{}</code> is reachable as \
             <code>{}</code> until {}.</p>",
            info.address,
            info.dns_name.as_deref().unwrap_or_default(),
            info.expires
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
        )
    } else {
        format!(
            "<p>Your address <code>{}</code> has no DNS name yet.</p>\
             <form method=\"post\" action=\"/\"><button>Claim one</button></form>",
            info.address,
        )
    };
    page(&body)
}

fn render_error_html(message: &str) -> String {
    page(&format!("<p>{message}</p>"))
}

fn page(body: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
         <title>claimdns</title></head><body><h1>claimdns</h1>{body}</body></html>"
    )
}

fn html_response(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

fn json_response(status: StatusCode, reply: &StatusReply) -> Response<Body> {
    let body = serde_json::to_string(reply).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idprov::RandomId;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn test_store() -> Store {
        let (tx, _rx) = mpsc::channel(4);
        Store::open_in_memory(
            Duration::from_secs(48 * 3600),
            "example.net",
            vec![Box::new(RandomId::new(5).unwrap())],
            Duration::from_secs(3600),
            tx,
        )
        .await
        .unwrap()
    }

    fn request(method: Method, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn caller_ip_prefers_forwarded_header() {
        let peer: SocketAddr = "[2001:db8::1]:443".parse().unwrap();

        let req = request(Method::GET, "/");
        assert_eq!(caller_ip(&req, peer), "2001:db8::1".parse::<IpAddr>().unwrap());

        let req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "2001:db8::9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(caller_ip(&req, peer), "2001:db8::9".parse::<IpAddr>().unwrap());

        // Garbage header falls back to the peer.
        let req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "not-an-ip")
            .body(Body::empty())
            .unwrap();
        assert_eq!(caller_ip(&req, peer), peer.ip());
    }

    #[tokio::test]
    async fn status_reports_claims() {
        let store = test_store().await;
        let addr: IpAddr = "2001:db8::5".parse().unwrap();

        let info = status_info(&store, addr).await.unwrap();
        assert!(!info.has_dns);
        assert!(info.dns_name.is_none());

        let IpAddr::V6(v6) = addr else { unreachable!() };
        store.upsert(v6).await.unwrap();

        let info = status_info(&store, addr).await.unwrap();
        assert!(info.has_dns);
        assert!(info.dns_name.unwrap().ends_with(".example.net"));
        assert!(info.expires.is_some());
    }

    #[tokio::test]
    async fn ipv4_callers_have_no_claim_and_cannot_claim() {
        let store = test_store().await;
        let addr: IpAddr = "192.0.2.1".parse().unwrap();

        let info = status_info(&store, addr).await.unwrap();
        assert!(!info.has_dns);

        assert!(claim(&store, addr).await.is_err());
        assert!(claim(&store, "::ffff:192.0.2.1".parse().unwrap()).await.is_err());
        assert!(claim(&store, "2001:db8::1".parse().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn post_redirects_to_get() {
        let store = test_store().await;
        let peer: SocketAddr = "[2001:db8::7]:55555".parse().unwrap();

        let response = handle(request(Method::POST, "/json"), store.clone(), peer)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()["location"], "/json");

        // And the claim is visible afterwards.
        let info = status_info(&store, peer.ip()).await.unwrap();
        assert!(info.has_dns);
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let store = test_store().await;
        let peer: SocketAddr = "[::1]:1".parse().unwrap();
        let response = handle(request(Method::DELETE, "/"), store, peer)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
