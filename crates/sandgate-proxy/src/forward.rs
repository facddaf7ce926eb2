//! Plain HTTP forwarding to the backend.
//!
//! Bodies stream in both directions; nothing is buffered.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::response::Response;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Uri, Version};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use sandgate_auth::TokenLocator;

use crate::error::ProxyError;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Headers that describe one connection and never cross a proxy.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// The backend's loopback address plus a pooled HTTP client.
#[derive(Clone)]
pub struct Upstream {
    authority: String,
    client: Client<HttpConnector, Body>,
}

impl Upstream {
    /// `authority` is `host:port`, e.g. `127.0.0.1:18789`.
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub(crate) fn url(&self, scheme: &str, path_and_query: &str) -> String {
        format!("{scheme}://{}{path_and_query}", self.authority)
    }
}

/// Forward one request and stream the response back.
pub(crate) async fn forward_http(
    upstream: &Upstream,
    locator: &TokenLocator,
    mut req: Request,
) -> Result<Response, ProxyError> {
    let uri: Uri = upstream
        .url("http", path_and_query(req.uri()))
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProxyError::UpstreamUnavailable(e.to_string()))?;

    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let headers = req.headers_mut();
    let original_host = headers.remove(header::HOST);
    prepare_upstream_headers(headers, locator);
    add_forwarded_headers(headers, client_ip.as_deref(), original_host);

    debug!(method = %req.method(), %uri, "forwarding request");
    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;

    let resp = upstream.client.request(req).await.map_err(|e| {
        if e.is_connect() {
            ProxyError::UpstreamUnavailable(e.to_string())
        } else {
            ProxyError::UpstreamReset(e.to_string())
        }
    })?;

    let mut resp = resp.map(Body::new);
    strip_hop_by_hop(resp.headers_mut());
    Ok(resp)
}

pub(crate) fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map_or("/", |pq| pq.as_str())
}

/// Drop hop-by-hop headers and the credential owned by the gate.
pub(crate) fn prepare_upstream_headers(headers: &mut HeaderMap, locator: &TokenLocator) {
    strip_hop_by_hop(headers);
    locator.strip(headers);
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn add_forwarded_headers(
    headers: &mut HeaderMap,
    client_ip: Option<&str>,
    original_host: Option<HeaderValue>,
) {
    if let Some(ip) = client_ip {
        let chain = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if !headers.contains_key(&X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
    if let Some(host) = original_host {
        headers.entry(X_FORWARDED_HOST).or_insert(host);
    }
}
