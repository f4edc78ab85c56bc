//! Egress proxy server.
//!
//! The proxy is the only path to the outside world for a payload. It runs on
//! the host and terminates plain HTTP (absolute-form requests) and tunnels
//! HTTPS via CONNECT.
//!
//! ```text
//! Container ──► HTTPS_PROXY=host:PORT ──► EgressProxy ──► Internet
//!                                             │
//!                                             ├─► request hooks (policy / mock / block)
//!                                             ├─► audit log (arrival order)
//!                                             └─► header redaction (audit copies only)
//! ```
//!
//! One proxy instance serves exactly one execution; its audit log is that
//! execution's network log. The active policy is swapped atomically and read
//! once per request at arrival, so in-flight requests never observe a swap.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::policy::{Policy, extract_host, extract_path};
use crate::proxy::audit::{AuditEntry, AuditLog};
use crate::proxy::headers::{HeaderFilter, is_hop_by_hop_header};
use crate::proxy::hooks::{
    MockResponse, RequestContext, RequestDecision, RequestHook, ResponseDecision, ResponseHook,
};

/// State shared across proxy connections.
pub(crate) struct ProxyState {
    pub(crate) request_hooks: Vec<Arc<dyn RequestHook>>,
    pub(crate) response_hooks: Vec<Arc<dyn ResponseHook>>,
    pub(crate) header_filter: HeaderFilter,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) policy: RwLock<Arc<Policy>>,
    /// Upstream client. Redirects are disabled: the payload sees 3xx
    /// responses and decides for itself.
    pub(crate) client: reqwest::Client,
    pub(crate) request_count: AtomicU64,
    pub(crate) running: AtomicBool,
}

/// Policy-enforcing forward proxy for one execution.
pub struct EgressProxy {
    state: Arc<ProxyState>,
    addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: RwLock<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl EgressProxy {
    pub(crate) fn from_state(state: ProxyState) -> Self {
        Self {
            state: Arc::new(state),
            addr: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
        }
    }

    /// Start the proxy on the given port (0 = auto-assign). Idempotent:
    /// calling start on a running proxy returns the bound address.
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        if self.state.running.load(Ordering::SeqCst) {
            if let Some(addr) = *self.addr.read().await {
                return Ok(addr);
            }
        }

        // Bound on all interfaces so bridged containers can reach it.
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::StartFailed {
                reason: format!("proxy failed to bind port {}: {}", port, e),
            })?;

        let addr = listener.local_addr().map_err(|e| Error::StartFailed {
            reason: format!("proxy local addr: {}", e),
        })?;

        *self.addr.write().await = Some(addr);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        self.state.running.store(true, Ordering::SeqCst);

        let state = self.state.clone();

        tokio::spawn(async move {
            tracing::debug!(%addr, "egress proxy started");

            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let state = state.clone();

                                tokio::spawn(async move {
                                    let service = service_fn(move |req| {
                                        let state = state.clone();
                                        async move { handle_request(req, state).await }
                                    });

                                    if let Err(e) = http1::Builder::new()
                                        .preserve_header_case(true)
                                        .title_case_headers(true)
                                        .serve_connection(io, service)
                                        .with_upgrades()
                                        .await
                                    {
                                        tracing::debug!(error = %e, "proxy connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "proxy accept error");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::debug!("egress proxy shutting down");
                        break;
                    }
                }
            }

            state.running.store(false, Ordering::SeqCst);
        });

        Ok(addr)
    }

    /// Stop the proxy. Connections already accepted are allowed to finish.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }

    /// Atomically swap the active policy. In-flight requests keep the policy
    /// they captured at arrival.
    pub async fn set_policy(&self, policy: Arc<Policy>) {
        *self.state.policy.write().await = policy;
    }

    pub async fn current_policy(&self) -> Arc<Policy> {
        self.state.policy.read().await.clone()
    }

    /// Copy of this execution's audit log, in arrival order.
    pub fn audit_snapshot(&self) -> Vec<AuditEntry> {
        self.state.audit.snapshot()
    }

    pub async fn addr(&self) -> Option<SocketAddr> {
        *self.addr.read().await
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u64 {
        self.state.request_count.load(Ordering::SeqCst)
    }
}

/// Handle one incoming proxy request.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ProxyState>,
) -> std::result::Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    state.request_count.fetch_add(1, Ordering::SeqCst);

    if req.method() == Method::CONNECT {
        return Ok(handle_connect(req, state).await);
    }

    let url = req.uri().to_string();
    let method = req.method().to_string();

    let host = match extract_host(&url) {
        Some(h) => h,
        None => {
            tracing::warn!(%url, "proxy: request without absolute-form URL");
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                "proxy requests must use an absolute URL".to_string(),
            ));
        }
    };
    let path = extract_path(&url);

    let policy = state.policy.read().await.clone();

    let request_headers = state.header_filter.audit_copy(
        req.headers()
            .iter()
            .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.as_str(), v))),
    );

    let slot = state.audit.begin(AuditEntry::pending(
        &method,
        &url,
        &host,
        request_headers,
    ));

    let ctx = RequestContext {
        method: method.clone(),
        url: url.clone(),
        host,
        path,
        policy,
    };

    match run_request_hooks(&state, &ctx).await {
        RequestDecision::Block {
            status,
            body,
            reason,
        } => {
            tracing::info!(%method, %url, %reason, "proxy: blocked");
            let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
            state.audit.complete(slot, |entry| {
                entry.blocked = true;
                entry.reason = Some(reason);
                entry.status_code = Some(status_code.as_u16());
            });
            Ok(json_response(status_code, &body))
        }
        RequestDecision::Mock(mock) => {
            tracing::debug!(%method, %url, status = mock.status, "proxy: mocked");
            state.audit.complete(slot, |entry| {
                entry.status_code = Some(mock.status);
            });
            Ok(mock_response(mock))
        }
        RequestDecision::Forward { header_overrides } => {
            forward_request(req, ctx, header_overrides, slot, state).await
        }
    }
}

/// Run the request hook chain. The first Block or Mock wins; Forward
/// decisions accumulate header rewrites. A failing hook contributes nothing.
async fn run_request_hooks(state: &ProxyState, ctx: &RequestContext) -> RequestDecision {
    let mut overrides = Vec::new();

    for hook in &state.request_hooks {
        match hook.on_request(ctx).await {
            Ok(RequestDecision::Forward { header_overrides }) => {
                overrides.extend(header_overrides);
            }
            Ok(decision) => return decision,
            Err(e) => {
                tracing::warn!(error = %e, "proxy: request hook failed, proceeding without it");
            }
        }
    }

    RequestDecision::Forward {
        header_overrides: overrides,
    }
}

/// Handle CONNECT: decide on the domain, then splice the sockets.
async fn handle_connect(
    req: Request<hyper::body::Incoming>,
    state: Arc<ProxyState>,
) -> Response<BoxBody<Bytes, Infallible>> {
    let authority = match req.uri().authority() {
        Some(a) => a.clone(),
        None => {
            return error_response(StatusCode::BAD_REQUEST, "missing CONNECT host".to_string());
        }
    };

    let host = authority.host().to_lowercase();
    let port = authority.port_u16().unwrap_or(443);

    let policy = state.policy.read().await.clone();

    let slot = state.audit.begin(AuditEntry::pending(
        "CONNECT",
        format!("https://{}:{}", host, port),
        &host,
        BTreeMap::new(),
    ));

    let ctx = RequestContext {
        method: "CONNECT".to_string(),
        url: format!("https://{}", host),
        host: host.clone(),
        path: "/".to_string(),
        policy,
    };

    match run_request_hooks(&state, &ctx).await {
        RequestDecision::Block {
            status,
            body,
            reason,
        } => {
            tracing::info!(%host, %reason, "proxy: blocked CONNECT");
            let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
            state.audit.complete(slot, |entry| {
                entry.blocked = true;
                entry.reason = Some(reason);
                entry.status_code = Some(status_code.as_u16());
            });
            json_response(status_code, &body)
        }
        // Mocking a tunnel is not meaningful; treat it like a forward.
        RequestDecision::Mock(_) | RequestDecision::Forward { .. } => {
            // Open the upstream connection before confirming the tunnel so a
            // refused upstream yields 502 instead of a dead tunnel.
            let upstream = match TcpStream::connect((host.as_str(), port)).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(%host, port, error = %e, "proxy: CONNECT upstream failed");
                    state.audit.complete(slot, |entry| {
                        entry.error = Some(format!("upstream connect failed: {}", e));
                    });
                    return error_response(
                        StatusCode::BAD_GATEWAY,
                        format!("upstream connect failed: {}", e),
                    );
                }
            };

            state.audit.complete(slot, |entry| {
                entry.status_code = Some(200);
            });

            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        let mut client = TokioIo::new(upgraded);
                        let mut upstream = upstream;
                        if let Err(e) =
                            tokio::io::copy_bidirectional(&mut client, &mut upstream).await
                        {
                            tracing::debug!(error = %e, "proxy: tunnel closed with error");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "proxy: CONNECT upgrade failed");
                    }
                }
            });

            Response::builder()
                .status(StatusCode::OK)
                .body(empty_body())
                .unwrap()
        }
    }
}

/// Forward a request upstream and shape the response.
async fn forward_request(
    req: Request<hyper::body::Incoming>,
    ctx: RequestContext,
    header_overrides: Vec<(String, String)>,
    slot: usize,
    state: Arc<ProxyState>,
) -> std::result::Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    let method = reqwest::Method::from_bytes(ctx.method.as_bytes()).unwrap_or(reqwest::Method::GET);

    // Forwarded headers: originals minus hop-by-hop, then hook rewrites.
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in req.headers() {
        if is_hop_by_hop_header(name.as_str()) {
            continue;
        }
        if let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()) {
            if let Ok(value) = reqwest::header::HeaderValue::from_bytes(value.as_bytes()) {
                headers.append(name, value);
            }
        }
    }
    for (name, value) in header_overrides {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }

    let body_bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::error!(error = %e, "proxy: failed to read request body");
            state.audit.complete(slot, |entry| {
                entry.error = Some(format!("failed to read request body: {}", e));
            });
            return Ok(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to read request body".to_string(),
            ));
        }
    };

    let mut builder = state.client.request(method, &ctx.url).headers(headers);
    if !body_bytes.is_empty() {
        builder = builder.body(body_bytes.to_vec());
    }

    let response = match builder.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(url = %ctx.url, error = %e, "proxy: upstream request failed");
            state.audit.complete(slot, |entry| {
                entry.error = Some(format!("upstream request failed: {}", e));
            });
            return Ok(error_response(
                StatusCode::BAD_GATEWAY,
                format!("upstream request failed: {}", e),
            ));
        }
    };

    let mut status = response.status().as_u16();
    let mut response_headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter(|(n, _)| !is_hop_by_hop_header(n.as_str()))
        .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.to_string(), v.to_string())))
        .collect();

    let mut body = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "proxy: failed to read upstream response");
            state.audit.complete(slot, |entry| {
                entry.error = Some(format!("failed to read upstream response: {}", e));
            });
            return Ok(error_response(
                StatusCode::BAD_GATEWAY,
                "failed to read upstream response".to_string(),
            ));
        }
    };

    // Response hooks may override pieces of a real response, never erase it.
    for hook in &state.response_hooks {
        match hook.on_response(&ctx, status).await {
            Ok(ResponseDecision::PassThrough) => {}
            Ok(ResponseDecision::Override {
                status: new_status,
                headers: new_headers,
                body: new_body,
            }) => {
                if let Some(s) = new_status {
                    status = s;
                }
                for (name, value) in new_headers {
                    response_headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
                    response_headers.push((name, value));
                }
                if let Some(b) = new_body {
                    body = b;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "proxy: response hook failed, proceeding without it");
            }
        }
    }

    let audit_headers = state
        .header_filter
        .audit_copy(response_headers.iter().map(|(n, v)| (n.as_str(), v.as_str())));
    state.audit.complete(slot, |entry| {
        entry.status_code = Some(status);
        entry.response_headers = Some(audit_headers);
    });

    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
    for (name, value) in &response_headers {
        builder = builder.header(name, value);
    }

    Ok(builder
        .body(full_body(body))
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "malformed response".into())))
}

pub(crate) fn mock_response(mock: MockResponse) -> Response<BoxBody<Bytes, Infallible>> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(mock.status).unwrap_or(StatusCode::OK));
    for (name, value) in &mock.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(full_body(mock.body))
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "malformed mock".into()))
}

fn json_response(
    status: StatusCode,
    body: &serde_json::Value,
) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}

fn error_response(status: StatusCode, message: String) -> Response<BoxBody<Bytes, Infallible>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(Bytes::from(message)))
        .unwrap()
}

fn empty_body() -> BoxBody<Bytes, Infallible> {
    Empty::<Bytes>::new().map_err(|_| unreachable!()).boxed()
}

fn full_body(bytes: Bytes) -> BoxBody<Bytes, Infallible> {
    Full::new(bytes).map_err(|_| unreachable!()).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyBuilder;

    #[tokio::test]
    async fn test_proxy_starts_and_stops() {
        let proxy = ProxyBuilder::new().build();

        let addr = proxy.start(0).await.unwrap();
        assert!(proxy.is_running());
        assert!(addr.port() > 0);

        // start is idempotent while running.
        let again = proxy.start(0).await.unwrap();
        assert_eq!(addr, again);

        proxy.stop().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!proxy.is_running());
    }

    #[tokio::test]
    async fn test_policy_swap_is_atomic() {
        let proxy = ProxyBuilder::new().build();

        let before = proxy.current_policy().await;
        assert!(before.allowed_domains.is_empty());

        proxy.set_policy(Arc::new(Policy::permissive())).await;
        let after = proxy.current_policy().await;
        assert!(!after.allowed_domains.is_empty());
    }
}
