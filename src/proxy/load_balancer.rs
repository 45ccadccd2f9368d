use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderValue};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::common::types::empty;
use crate::common::{LoadBalancerError, ProxyBody};
use crate::configuration::Settings;
use crate::proxy::backend::{http_client, Backend, Upstream};
use crate::proxy::dispatcher::Dispatcher;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// HTTP front end: accepts connections on `listen_addr` and hands every
/// request to the dispatcher.
#[derive(Debug)]
pub struct LoadBalancer<U = Backend> {
    pub listen_addr: SocketAddr,
    dispatcher: Arc<Dispatcher<U>>,
}

impl LoadBalancer<Backend> {
    /// Builds every backend from `settings`. Any malformed address or an empty
    /// backend list fails here, before anything is bound.
    pub fn new(settings: Settings) -> Result<Self, LoadBalancerError> {
        let client = http_client();
        let backends = settings
            .backends
            .iter()
            .map(|addr| Backend::new(addr, client.clone(), settings.upstream_timeout))
            .collect::<Result<Vec<_>, _>>()?;

        for backend in &backends {
            info!(upstream = backend.address(), "Registered upstream");
        }

        Ok(Self::with_dispatcher(settings.listen_addr, Dispatcher::new(backends)?))
    }
}

impl<U: Upstream> LoadBalancer<U> {
    pub fn with_dispatcher(listen_addr: SocketAddr, dispatcher: Dispatcher<U>) -> Self {
        Self {
            listen_addr,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<U> {
        &self.dispatcher
    }

    pub async fn run(&self) -> Result<(), LoadBalancerError> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        self.serve(listener).await;
        Ok(())
    }

    /// Serves connections from an already bound listener. Accept errors are
    /// logged and retried after an exponential backoff.
    pub async fn serve(&self, listener: TcpListener) {
        let mut backoff = None;
        loop {
            let (stream, client_addr) = match listener.accept().await {
                Ok(conn) => {
                    backoff = None;
                    conn
                }
                Err(e) => {
                    let delay = next_backoff(backoff);
                    warn!(error = %e, retry_in = ?delay, "Failed to accept connection");
                    backoff = Some(delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            let dispatcher = Arc::clone(&self.dispatcher);

            tokio::task::spawn(async move {
                if let Err(err) = http1::Builder::new()
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(move |req| handle(req, client_addr, Arc::clone(&dispatcher))),
                    )
                    .with_upgrades()
                    .await
                {
                    warn!(client = %client_addr, error = ?err, "Error serving connection");
                }
            });
        }
    }
}

/// Delay before the next accept attempt: starts at 5ms and doubles up to 1s.
fn next_backoff(previous: Option<Duration>) -> Duration {
    match previous {
        None => ACCEPT_BACKOFF_MIN,
        Some(delay) => (delay * 2).min(ACCEPT_BACKOFF_MAX),
    }
}

async fn handle<U: Upstream>(
    mut req: Request<Incoming>,
    client_addr: SocketAddr,
    dispatcher: Arc<Dispatcher<U>>,
) -> Result<Response<ProxyBody>, Infallible> {
    append_forwarded_for(req.headers_mut(), client_addr.ip());

    match dispatcher.dispatch(req.map(|body| body.boxed())).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(client = %client_addr, error = %e, "Forwarding failed");
            let mut response = Response::new(empty());
            *response.status_mut() = e.status_code();
            Ok(response)
        }
    }
}

/// Appends `ip` to any `X-Forwarded-For` chain the client already sent.
fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
