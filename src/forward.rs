//! Forwards routed requests to instances
//!
//! The request timeout covers waiting for a per-target slot and receiving
//! the response head. The body is streamed back afterwards; the target slot
//! stays taken until the caller drops the body.

use crate::error::ProxyError;
use crate::filters::RequestContext;
use crate::pool::{ConnectionPool, PoolError};
use crate::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{HeaderMap, Request, Response};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, warn};

/// Never forwarded in either direction
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    // Recomputed by hyper from the body
    "content-length",
    // Set from the target
    "host",
];

pub struct ProxyDispatcher {
    pool: Arc<ConnectionPool>,
    timeout: Duration,
    ignored: Vec<HeaderName>,
}

impl ProxyDispatcher {
    /// `extra_ignored` adds to [`HOP_BY_HOP_HEADERS`]; invalid names are skipped.
    pub fn new(pool: Arc<ConnectionPool>, timeout: Duration, extra_ignored: &[String]) -> Self {
        let ignored = HOP_BY_HOP_HEADERS
            .iter()
            .map(|h| h.to_string())
            .chain(extra_ignored.iter().map(|h| h.trim().to_ascii_lowercase()))
            .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok())
            .collect();

        Self { pool, timeout, ignored }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Copy of `headers` without ignored headers and those named in `Connection`
    fn filter_headers(&self, headers: &HeaderMap) -> HeaderMap {
        let listed: Vec<HeaderName> = headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
            .collect();

        let mut filtered = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if self.ignored.contains(name) || listed.contains(name) {
                continue;
            }
            filtered.append(name.clone(), value.clone());
        }
        filtered
    }

    pub async fn forward(&self, ctx: &RequestContext, body: ProxyBody) -> Result<Response<ProxyBody>, ProxyError> {
        let route = ctx
            .route
            .as_ref()
            .ok_or_else(|| ProxyError::Internal("request reached dispatcher without a route".to_string()))?;
        let target = ctx
            .target
            .clone()
            .ok_or_else(|| ProxyError::InvalidRequest("cannot build target URL for request".to_string()))?;
        let authority = target
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| ProxyError::Internal(format!("target {} has no authority", target)))?;

        let mut headers = self.filter_headers(&ctx.headers);
        if let Ok(host) = HeaderValue::from_str(&authority) {
            headers.insert(HOST, host);
        }

        let mut outbound = Request::builder()
            .method(ctx.method.clone())
            .uri(target.clone())
            .body(body)
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        *outbound.headers_mut() = headers;

        debug!(
            request_id = %ctx.request_id,
            route_id = %route.id,
            method = %ctx.method,
            %target,
            "Forwarding request"
        );

        let exchange = async {
            let permit = self.pool.acquire(&authority).await?;
            let response = self.pool.send(outbound).await?;
            Ok::<_, PoolError>((permit, response))
        };

        let (permit, response) = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(
                    request_id = %ctx.request_id,
                    instance_id = %route.instance_id,
                    %target,
                    error = %e,
                    "Failed to forward request"
                );
                return Err(ProxyError::UpstreamUnavailable {
                    instance_id: route.instance_id.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(
                    request_id = %ctx.request_id,
                    instance_id = %route.instance_id,
                    %target,
                    timeout_secs = self.timeout.as_secs(),
                    "Request timed out"
                );
                return Err(ProxyError::UpstreamTimeout {
                    instance_id: route.instance_id.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let (mut parts, body) = response.into_parts();
        parts.headers = self.filter_headers(&parts.headers);
        let body = PermitBody {
            inner: body,
            _permit: permit,
        };
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Response body that holds the target slot until it is dropped
struct PermitBody {
    inner: Incoming,
    _permit: OwnedSemaphorePermit,
}

impl Body for PermitBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
