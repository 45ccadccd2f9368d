use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Scheme, Uri};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, warn};

use crate::common::types::empty;
use crate::common::{LoadBalancerError, ProxyBody};

pub type HttpClient = Client<HttpConnector, ProxyBody>;

/// Headers that only describe a single transport hop and must not be relayed.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// An upstream server requests can be routed to.
///
/// `is_live` is the only signal consulted by selection; implementations that
/// track health plug in there.
pub trait Upstream: Send + Sync + 'static {
    fn address(&self) -> &str;

    fn is_live(&self) -> bool;

    /// Proxy `req` to this upstream and return its response. Failures are
    /// returned to the caller, never retried here.
    fn forward(
        &self,
        req: Request<ProxyBody>,
    ) -> impl Future<Output = Result<Response<ProxyBody>, LoadBalancerError>> + Send;
}

pub fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// A plain HTTP backend reached through a shared pooled client.
#[derive(Debug)]
pub struct Backend {
    addr: String,
    uri: Uri,
    live: AtomicBool,
    client: HttpClient,
    timeout: Duration,
}

impl Backend {
    /// Parses `addr` as an `http://host[:port][/path]` URL. Malformed
    /// addresses are rejected here so they never reach request time.
    pub fn new(
        addr: &str,
        client: HttpClient,
        timeout: Duration,
    ) -> Result<Self, LoadBalancerError> {
        let invalid = |reason: String| LoadBalancerError::InvalidAddress {
            addr: addr.to_string(),
            reason,
        };

        if addr.trim().is_empty() {
            return Err(invalid("address is empty".into()));
        }

        let uri: Uri = addr
            .parse()
            .map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
        match uri.scheme() {
            Some(scheme) if *scheme == Scheme::HTTP => {}
            Some(scheme) => return Err(invalid(format!("unsupported scheme {scheme}"))),
            None => return Err(invalid("missing scheme".into())),
        }
        if uri.authority().is_none() {
            return Err(invalid("missing host".into()));
        }

        Ok(Self {
            addr: addr.to_string(),
            uri,
            live: AtomicBool::new(true),
            client,
            timeout,
        })
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    /// Rewrites an inbound request URI so it points at this backend.
    fn upstream_uri(&self, inbound: &Uri) -> Result<Uri, LoadBalancerError> {
        let path = join_paths(self.uri.path(), inbound.path());
        let path_and_query = match (self.uri.query(), inbound.query()) {
            (Some(a), Some(b)) => format!("{path}?{a}&{b}"),
            (Some(q), None) | (None, Some(q)) => format!("{path}?{q}"),
            (None, None) => path,
        };

        let mut builder = Uri::builder().path_and_query(path_and_query);
        if let Some(scheme) = self.uri.scheme() {
            builder = builder.scheme(scheme.clone());
        }
        if let Some(authority) = self.uri.authority() {
            builder = builder.authority(authority.clone());
        }
        Ok(builder.build()?)
    }
}

impl Upstream for Backend {
    fn address(&self) -> &str {
        &self.addr
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    async fn forward(
        &self,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, LoadBalancerError> {
        let upgrade = upgrade_type(req.headers());
        let client_upgrade = upgrade
            .as_ref()
            .and_then(|_| req.extensions_mut().remove::<OnUpgrade>());

        let uri = self.upstream_uri(req.uri())?;
        *req.uri_mut() = uri;
        remove_hop_headers(req.headers_mut());
        if let Some(protocol) = &upgrade {
            set_upgrade_headers(req.headers_mut(), protocol.clone());
        }

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| LoadBalancerError::UpstreamTimeout {
                addr: self.addr.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| LoadBalancerError::Upstream {
                addr: self.addr.clone(),
                source,
            })?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return switch_protocols(response, client_upgrade, &self.addr);
        }

        let mut response = response.map(|body| body.boxed());
        remove_hop_headers(response.headers_mut());
        Ok(response)
    }
}

/// Hands a `101 Switching Protocols` reply back to the client and splices the
/// two upgraded connections once both sides have switched.
fn switch_protocols(
    mut response: Response<hyper::body::Incoming>,
    client_upgrade: Option<OnUpgrade>,
    addr: &str,
) -> Result<Response<ProxyBody>, LoadBalancerError> {
    let Some(client_upgrade) = client_upgrade else {
        warn!(upstream = addr, "Upstream switched protocols without an upgrade request");
        let mut resp = Response::new(empty());
        *resp.status_mut() = StatusCode::BAD_GATEWAY;
        return Ok(resp);
    };

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    let protocol = upgrade_type(response.headers());
    let addr = addr.to_string();

    tokio::task::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(upstream = %addr, error = %e, "Upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);

        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((from_client, from_upstream)) => debug!(
                upstream = %addr,
                from_client,
                from_upstream,
                "Upgraded connection closed"
            ),
            Err(e) => warn!(upstream = %addr, error = %e, "Upgraded connection error"),
        }
    });

    let mut response = response.map(|body| body.boxed());
    remove_hop_headers(response.headers_mut());
    if let Some(protocol) = protocol {
        set_upgrade_headers(response.headers_mut(), protocol);
    }
    Ok(response)
}

/// Joins two paths with exactly one slash between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Protocol named by `Upgrade` when `Connection` asks for an upgrade.
fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

fn set_upgrade_headers(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, protocol);
}

/// Strips hop-by-hop headers, including any listed in `Connection`.
fn remove_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
