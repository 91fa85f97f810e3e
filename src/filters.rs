//! Pre-dispatch request filters
//!
//! Filters run in order over a per-request [`RequestContext`]. The route
//! decoration filter resolves the route; the others only rewrite headers.
//! A filter that cannot apply returns [`FilterOutcome::NotFound`], which ends
//! the chain before anything is sent upstream.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::headers::HeaderProvider;
use crate::instance::InstanceId;
use crate::locator::RouteLocator;
use crate::route::Route;
use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::http::request::Parts;
use hyper::{HeaderMap, Method, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Header name for the stripped path prefix
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

const HEALTH_ENDPOINT: &str = "health";

/// State of one proxied request, owned by that request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub client_addr: SocketAddr,
    pub is_tls: bool,
    pub request_id: String,
    pub route: Option<Arc<Route>>,
    pub target: Option<Uri>,
}

impl RequestContext {
    pub fn from_parts(parts: &Parts, client_addr: SocketAddr, is_tls: bool) -> Self {
        // Generate or propagate request ID
        let request_id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(String::from),
            headers: parts.headers.clone(),
            client_addr,
            is_tls,
            request_id,
            route: None,
            target: None,
        }
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        self.route.as_ref().map(|r| &r.instance_id)
    }
}

#[derive(Debug)]
pub enum FilterOutcome {
    Continue(RequestContext),
    NotFound { route_id: String },
}

#[async_trait]
pub trait RequestFilter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, ctx: RequestContext) -> FilterOutcome;
}

/// Resolves `{prefix}/{route_id}/{rest}` against the route table
pub struct RouteDecorationFilter {
    prefix: String,
    locator: Arc<RouteLocator>,
    endpoints: Vec<String>,
}

impl RouteDecorationFilter {
    /// `endpoints` limits the first segment of `rest`; empty allows all.
    pub fn new(prefix: impl Into<String>, locator: Arc<RouteLocator>, endpoints: Vec<String>) -> Self {
        Self {
            prefix: prefix.into(),
            locator,
            endpoints,
        }
    }

    /// Split a request path into route id and the remainder (with leading slash)
    fn split<'a>(&self, path: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = path.strip_prefix(self.prefix.as_str())?;
        let rest = rest.strip_prefix('/')?;
        let (route_id, remainder) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        (!route_id.is_empty()).then_some((route_id, remainder))
    }

    fn endpoint_allowed(&self, endpoint: &str) -> bool {
        self.endpoints.is_empty() || self.endpoints.iter().any(|e| e == endpoint)
    }
}

#[async_trait]
impl RequestFilter for RouteDecorationFilter {
    fn name(&self) -> &'static str {
        "route-decoration"
    }

    async fn apply(&self, mut ctx: RequestContext) -> FilterOutcome {
        let Some((route_id, remainder)) = self.split(&ctx.path) else {
            return FilterOutcome::NotFound {
                route_id: String::new(),
            };
        };
        let route_id = route_id.to_string();
        let remainder = remainder.to_string();

        let Some(route) = self.locator.find(&route_id).await else {
            return FilterOutcome::NotFound { route_id };
        };

        let endpoint = remainder
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default();
        if !self.endpoint_allowed(endpoint) {
            debug!(%route_id, endpoint, "Endpoint not exposed");
            return FilterOutcome::NotFound { route_id };
        }

        let query = ctx.query.as_deref();
        let target = if endpoint == HEALTH_ENDPOINT && route.health_url.is_some() {
            let below = remainder
                .trim_start_matches('/')
                .strip_prefix(HEALTH_ENDPOINT)
                .unwrap_or_default();
            route.health_target_for(below, query)
        } else {
            route.target_for(&remainder, query)
        };

        ctx.target = target;
        ctx.route = Some(route);
        FilterOutcome::Continue(ctx)
    }
}

/// Drops credentials before they reach sensitive instances
pub struct SensitiveHeadersFilter {
    headers: Vec<HeaderName>,
    all_routes: bool,
}

impl SensitiveHeadersFilter {
    pub fn new(headers: &[String], all_routes: bool) -> Self {
        let headers = headers
            .iter()
            .filter_map(|h| match HeaderName::from_bytes(h.trim().as_bytes()) {
                Ok(name) => Some(name),
                Err(_) => {
                    warn!(header = %h, "Ignoring invalid sensitive header name");
                    None
                }
            })
            .collect();
        Self { headers, all_routes }
    }
}

#[async_trait]
impl RequestFilter for SensitiveHeadersFilter {
    fn name(&self) -> &'static str {
        "sensitive-headers"
    }

    async fn apply(&self, mut ctx: RequestContext) -> FilterOutcome {
        let sensitive = self.all_routes || ctx.route.as_ref().map(|r| r.sensitive).unwrap_or(false);
        if sensitive {
            for name in &self.headers {
                ctx.headers.remove(name);
            }
        }
        FilterOutcome::Continue(ctx)
    }
}

/// Sets X-Forwarded-* and X-Request-ID
pub struct ForwardedHeadersFilter {
    prefix: String,
}

impl ForwardedHeadersFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

#[async_trait]
impl RequestFilter for ForwardedHeadersFilter {
    fn name(&self) -> &'static str {
        "forwarded-headers"
    }

    async fn apply(&self, mut ctx: RequestContext) -> FilterOutcome {
        // Overwrite rather than append: this proxy is the first trusted hop.
        let headers = &mut ctx.headers;

        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            headers.insert(X_REQUEST_ID, value);
        }

        if let Ok(value) = HeaderValue::from_str(&ctx.client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        if let Some(host) = headers.get(HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }

        let proto = if ctx.is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

        if let Some(route) = &ctx.route {
            let prefix = format!("{}/{}", self.prefix, route.id);
            if let Ok(value) = HeaderValue::from_str(&prefix) {
                headers.insert(X_FORWARDED_PREFIX, value);
            }
        }

        FilterOutcome::Continue(ctx)
    }
}

/// Adds headers from a [`HeaderProvider`]
pub struct ProviderHeadersFilter {
    provider: Arc<dyn HeaderProvider>,
}

impl ProviderHeadersFilter {
    pub fn new(provider: Arc<dyn HeaderProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl RequestFilter for ProviderHeadersFilter {
    fn name(&self) -> &'static str {
        "provider-headers"
    }

    async fn apply(&self, mut ctx: RequestContext) -> FilterOutcome {
        let Some(instance_id) = ctx.instance_id().cloned() else {
            return FilterOutcome::Continue(ctx);
        };

        match self.provider.headers_for(&instance_id).await {
            Ok(extra) => {
                for (name, value) in extra {
                    match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                        (Ok(name), Ok(value)) => {
                            ctx.headers.insert(name, value);
                        }
                        _ => debug!(%instance_id, header = %name, "Skipping invalid provided header"),
                    }
                }
            }
            Err(e) => warn!(%instance_id, error = %e, "Header provider failed, forwarding without extra headers"),
        }
        FilterOutcome::Continue(ctx)
    }
}

/// Ordered filters applied to every proxied request
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn RequestFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl RequestFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Route decoration, sensitive headers, forwarded headers, provider headers
    pub fn standard(
        config: &ProxyConfig,
        locator: Arc<RouteLocator>,
        provider: Arc<dyn HeaderProvider>,
    ) -> Self {
        let prefix = config.normalized_prefix();
        Self::new()
            .with(RouteDecorationFilter::new(prefix.clone(), locator, config.endpoints.clone()))
            .with(SensitiveHeadersFilter::new(&config.sensitive_headers, config.sensitive_all))
            .with(ForwardedHeadersFilter::new(prefix))
            .with(ProviderHeadersFilter::new(provider))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub async fn run(&self, mut ctx: RequestContext) -> Result<RequestContext, ProxyError> {
        for filter in &self.filters {
            ctx = match filter.apply(ctx).await {
                FilterOutcome::Continue(ctx) => ctx,
                FilterOutcome::NotFound { route_id } => {
                    debug!(filter = filter.name(), %route_id, "Request matched no route");
                    return Err(ProxyError::RouteNotFound { route_id });
                }
            };
        }
        Ok(ctx)
    }
}
