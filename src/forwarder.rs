//! Transparent reverse proxy for configured path prefixes.

use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    path::Path as FsPath,
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    body::{self, Body},
    extract::{Path, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri,
        header::{CONTENT_TYPE, TRANSFER_ENCODING},
    },
    response::IntoResponse,
    routing::any,
};
use bytes::Bytes;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};
use url::form_urlencoded;

use crate::auth::ApiKeyVerifier;

pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound bodies are buffered up to this size before forwarding.
pub const BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Connection-specific headers that must not reach the next hop.
pub const STRIPPED_HEADERS: &[&str] = &["host", "content-length", "x-real-ip", "x-forwarded-for"];

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const WILDCARD_PARAM: &str = "proxy_path";

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid upstream endpoint '{endpoint}': {source}")]
    InvalidUpstream {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error(
        "invalid proxy prefix '{0}': must start with '/', not be the root, and use only \
         ':name' segments as parameters"
    )]
    InvalidPrefix(String),
    #[error("proxy prefix '{prefix}' overlaps already registered prefix '{existing}'")]
    DuplicatePrefix { prefix: String, existing: String },
    #[error("invalid additional header '{0}'")]
    InvalidHeader(String),
    #[error("proxy route '{0}' requires auth but no api key verifier is configured")]
    MissingVerifier(String),
    #[error("failed to read proxy routes from {path}: {source}")]
    RouteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse proxy routes in {path}: {source}")]
    RouteConfig {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ForwardError::Http(err) => err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// On-disk form of a proxy route.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRouteConfig {
    pub upstream: String,
    pub prefix: String,
    #[serde(default)]
    pub rewrite_prefix: Option<String>,
    #[serde(default)]
    pub additional_headers: BTreeMap<String, String>,
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,
}

fn default_require_auth() -> bool {
    true
}

impl ProxyRouteConfig {
    /// Reads a JSON array of route configs.
    pub fn load_file(path: &FsPath) -> Result<Vec<Self>, ForwardError> {
        let display = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|source| ForwardError::RouteFile {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ForwardError::RouteConfig {
            path: display,
            source,
        })
    }
}

/// One validated proxy route.
#[derive(Clone)]
pub struct ProxyRoute {
    pub upstream: Url,
    pub prefix: String,
    pub rewrite_prefix: Option<String>,
    pub additional_headers: HeaderMap,
    pub require_auth: bool,
}

impl fmt::Debug for ProxyRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Header values often carry upstream credentials.
        let header_names: Vec<&str> = self
            .additional_headers
            .keys()
            .map(HeaderName::as_str)
            .collect();
        f.debug_struct("ProxyRoute")
            .field("upstream", &self.upstream.as_str())
            .field("prefix", &self.prefix)
            .field("rewrite_prefix", &self.rewrite_prefix)
            .field("additional_headers", &header_names)
            .field("require_auth", &self.require_auth)
            .finish()
    }
}

impl ProxyRoute {
    pub fn new(upstream: &str, prefix: &str) -> Result<Self, ForwardError> {
        let upstream = Url::parse(upstream).map_err(|source| ForwardError::InvalidUpstream {
            endpoint: upstream.to_owned(),
            source,
        })?;
        if !is_valid_prefix(prefix) {
            return Err(ForwardError::InvalidPrefix(prefix.to_owned()));
        }
        Ok(Self {
            upstream,
            prefix: prefix.to_owned(),
            rewrite_prefix: None,
            additional_headers: HeaderMap::new(),
            require_auth: true,
        })
    }

    pub fn rewrite_prefix(mut self, template: impl Into<String>) -> Self {
        self.rewrite_prefix = Some(template.into());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, ForwardError> {
        let invalid = || ForwardError::InvalidHeader(name.to_owned());
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        self.additional_headers.insert(name, value);
        Ok(self)
    }

    pub fn require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    fn axum_paths(&self) -> (String, String) {
        let base = self.prefix.trim_end_matches('/');
        (format!("{base}/"), format!("{base}/*{WILDCARD_PARAM}"))
    }

    /// Prefix segments with every `:param` reduced to a bare `:`.
    fn segments(&self) -> Vec<&str> {
        self.prefix
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| if segment.starts_with(':') { ":" } else { segment })
            .collect()
    }

    /// Whether both routes would claim some common request path.
    fn overlaps(&self, other: &ProxyRoute) -> bool {
        self.segments()
            .iter()
            .zip(other.segments())
            .all(|(a, b)| *a == b || *a == ":" || b == ":")
    }

    /// Builds the outbound request for one inbound request on this route.
    pub fn request_context(
        &self,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        params: &HashMap<String, String>,
        remainder: &str,
        body: Bytes,
    ) -> ProxyRequestContext {
        let mut url = compose_upstream_url(
            &self.upstream,
            self.rewrite_prefix.as_deref(),
            params,
            remainder,
        );
        url.set_query(uri.query());

        let headers = forwarded_headers(headers, &self.additional_headers);
        let is_form = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains(FORM_CONTENT_TYPE));

        let body = if is_form && method == Method::GET {
            let encoded = reencode_query(url.query().unwrap_or_default());
            url.set_query(None);
            Bytes::from(encoded)
        } else if is_form {
            encode_form_body(&body).map(Bytes::from).unwrap_or(body)
        } else {
            body
        };

        ProxyRequestContext {
            method,
            url,
            headers,
            body,
        }
    }
}

impl TryFrom<ProxyRouteConfig> for ProxyRoute {
    type Error = ForwardError;

    fn try_from(config: ProxyRouteConfig) -> Result<Self, Self::Error> {
        let mut route = ProxyRoute::new(&config.upstream, &config.prefix)?
            .require_auth(config.require_auth);
        if let Some(template) = config.rewrite_prefix {
            route = route.rewrite_prefix(template);
        }
        for (name, value) in &config.additional_headers {
            route = route.header(name, value)?;
        }
        Ok(route)
    }
}

/// A prefix is a rooted, non-root path whose segments are either literal or a
/// whole `:name` parameter. Router syntax (`*`, `{`, `}`) is refused.
fn is_valid_prefix(prefix: &str) -> bool {
    if !prefix.starts_with('/') || prefix.trim_end_matches('/').is_empty() {
        return false;
    }
    if prefix.contains(['*', '{', '}']) {
        return false;
    }
    prefix.split('/').all(|segment| match segment.find(':') {
        None => true,
        Some(0) => {
            let name = &segment[1..];
            !name.is_empty()
                && name != WILDCARD_PARAM
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        Some(_) => false,
    })
}

/// Everything needed to issue one outbound request.
#[derive(Debug, Clone)]
pub struct ProxyRequestContext {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Replaces `:param` placeholders with URL-encoded route parameter values.
/// Unknown parameters become empty.
pub fn substitute_params(template: &str, params: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(':') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if name_len == 0 {
            out.push(':');
        } else if let Some(value) = params.get(&after[..name_len]) {
            out.push_str(&urlencoding::encode(value));
        }
        rest = &after[name_len..];
    }
    out.push_str(rest);
    out
}

pub fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for ch in path.chars() {
        if ch == '/' && out.ends_with('/') {
            continue;
        }
        out.push(ch);
    }
    out
}

/// Appends the rewritten prefix and the wildcard remainder onto the
/// upstream's own path.
pub fn compose_upstream_url(
    upstream: &Url,
    rewrite_prefix: Option<&str>,
    params: &HashMap<String, String>,
    remainder: &str,
) -> Url {
    let rewritten = rewrite_prefix
        .map(|template| substitute_params(template, params))
        .unwrap_or_default();
    let combined = [rewritten.as_str(), remainder]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/");

    let mut url = upstream.clone();
    let path = collapse_slashes(&format!("{}/{}", upstream.path(), combined));
    url.set_path(&path);
    url
}

/// Inbound headers overlaid with the route's extra headers, minus
/// [`STRIPPED_HEADERS`].
pub fn forwarded_headers(inbound: &HeaderMap, additional: &HeaderMap) -> HeaderMap {
    let mut headers = inbound.clone();
    for (name, value) in additional {
        headers.insert(name.clone(), value.clone());
    }
    for name in STRIPPED_HEADERS {
        headers.remove(*name);
    }
    headers
}

fn reencode_query(query: &str) -> String {
    encode_pairs(form_urlencoded::parse(query.as_bytes()))
}

/// Joins `key=value` pairs with RFC 3986 percent-encoding, so a space is sent
/// as `%20` rather than `+`.
fn encode_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    pairs
        .into_iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key.as_ref()),
                urlencoding::encode(value.as_ref())
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Encodes a JSON object body as a form with bracketed nested keys
/// (`a[b]=c`, `list[0]=x`). Returns `None` for anything that is not a JSON
/// object, which is then forwarded as is.
pub fn encode_form_body(body: &[u8]) -> Option<String> {
    let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(body) else {
        return None;
    };
    let mut pairs = Vec::new();
    for (key, value) in &fields {
        flatten_form_value(key, value, &mut pairs);
    }
    Some(encode_pairs(pairs))
}

fn flatten_form_value(key: &str, value: &Value, pairs: &mut Vec<(String, String)>) {
    match value {
        Value::Object(fields) => {
            for (child, value) in fields {
                flatten_form_value(&format!("{key}[{child}]"), value, pairs);
            }
        }
        Value::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                flatten_form_value(&format!("{key}[{index}]"), value, pairs);
            }
        }
        Value::Null => pairs.push((key.to_owned(), String::new())),
        Value::String(text) => pairs.push((key.to_owned(), text.clone())),
        other => pairs.push((key.to_owned(), other.to_string())),
    }
}

/// Stateless forwarder sharing one HTTP connection pool.
#[derive(Clone, Debug)]
pub struct ReverseProxyForwarder {
    client: Client,
    timeout: Duration,
}

impl ReverseProxyForwarder {
    /// `timeout` bounds the wait for upstream response headers; the body is
    /// streamed afterwards without a deadline.
    pub fn new(timeout: Duration) -> Result<Self, ForwardError> {
        let client = Client::builder().build()?;
        Ok(Self { client, timeout })
    }

    pub async fn forward(&self, ctx: ProxyRequestContext) -> Response<Body> {
        let method = ctx.method.clone();
        let url = ctx.url.clone();
        match self.send(ctx).await {
            Ok(upstream) => {
                let status = upstream.status();
                if !status.is_success() {
                    warn!(
                        %method,
                        %url,
                        status = status.as_u16(),
                        "upstream returned non-success status"
                    );
                }
                relay(upstream)
            }
            Err(err) => {
                error!(%method, %url, error = %err, "proxy request failed");
                err.into_response()
            }
        }
    }

    async fn send(&self, ctx: ProxyRequestContext) -> Result<reqwest::Response, ForwardError> {
        let mut builder = self
            .client
            .request(ctx.method, ctx.url)
            .headers(ctx.headers);
        if !ctx.body.is_empty() {
            builder = builder.body(ctx.body);
        }
        match tokio::time::timeout(self.timeout, builder.send()).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(ForwardError::Timeout(self.timeout)),
        }
    }
}

fn relay(upstream: reqwest::Response) -> Response<Body> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    headers.remove(TRANSFER_ENCODING);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

struct RouteState {
    route: ProxyRoute,
    forwarder: ReverseProxyForwarder,
    verifier: Option<Arc<dyn ApiKeyVerifier>>,
}

/// Installs `route` on `router` for every method under its prefix.
pub fn register_proxy_route<S>(
    router: Router<S>,
    route: ProxyRoute,
    forwarder: ReverseProxyForwarder,
    verifier: Option<Arc<dyn ApiKeyVerifier>>,
) -> Result<Router<S>, ForwardError>
where
    S: Clone + Send + Sync + 'static,
{
    if route.require_auth && verifier.is_none() {
        return Err(ForwardError::MissingVerifier(route.prefix.clone()));
    }

    let (root_path, wildcard_path) = route.axum_paths();
    info!(
        prefix = %route.prefix,
        upstream = %route.upstream,
        require_auth = route.require_auth,
        "registering proxy route"
    );
    let state = Arc::new(RouteState {
        route,
        forwarder,
        verifier,
    });

    Ok(router
        .route(&root_path, any(proxy_handler).with_state(state.clone()))
        .route(&wildcard_path, any(proxy_handler).with_state(state)))
}

/// Installs every route in order, refusing a prefix that overlaps one
/// registered before it.
pub fn register_proxy_routes<S>(
    mut router: Router<S>,
    routes: Vec<ProxyRoute>,
    forwarder: ReverseProxyForwarder,
    verifier: Option<Arc<dyn ApiKeyVerifier>>,
) -> Result<Router<S>, ForwardError>
where
    S: Clone + Send + Sync + 'static,
{
    let mut registered: Vec<ProxyRoute> = Vec::with_capacity(routes.len());
    for route in routes {
        if let Some(existing) = registered.iter().find(|existing| existing.overlaps(&route)) {
            return Err(ForwardError::DuplicatePrefix {
                prefix: route.prefix,
                existing: existing.prefix.clone(),
            });
        }
        registered.push(route.clone());
        router = register_proxy_route(router, route, forwarder.clone(), verifier.clone())?;
    }
    Ok(router)
}

async fn proxy_handler(
    State(state): State<Arc<RouteState>>,
    params: Option<Path<HashMap<String, String>>>,
    req: Request<Body>,
) -> Response<Body> {
    let (parts, body) = req.into_parts();

    if state.route.require_auth {
        if let Some(verifier) = state.verifier.as_ref() {
            if let Err(rejection) = verifier.verify(&parts.headers).await {
                warn!(prefix = %state.route.prefix, error = %rejection, "proxy request rejected");
                return rejection.into_response();
            }
        }
    }

    let body_bytes = match body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to read proxy request body");
            return (StatusCode::BAD_REQUEST, "request body too large or unreadable")
                .into_response();
        }
    };

    let mut params = params.map(|Path(params)| params).unwrap_or_default();
    let remainder = params.remove(WILDCARD_PARAM).unwrap_or_default();
    let ctx = state.route.request_context(
        parts.method,
        &parts.uri,
        &parts.headers,
        &params,
        &remainder,
        body_bytes,
    );
    state.forwarder.forward(ctx).await
}
