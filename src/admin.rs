use crate::instance::{InstanceId, Registration, StatusInfo};
use crate::locator::RouteLocator;
use crate::notifications::NotificationDispatcher;
use crate::registry::{InMemoryRegistry, InstanceRegistry, RegistryError};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body accepted by the admin API
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": message.to_string() }).to_string())
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    registration: Registration,
}

/// Everything the admin handlers need
pub struct AdminState {
    pub locator: Arc<RouteLocator>,
    pub registry: Arc<InMemoryRegistry>,
    pub notifications: Arc<NotificationDispatcher>,
}

/// Admin API server: route table, instance registry and notification counters
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        state: AdminState,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let auth_token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: Arc<AdminState>, auth_token: Arc<String>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, state, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn read_json<T: serde::de::DeserializeOwned>(body: Incoming) -> Result<T, Response<Full<Bytes>>> {
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| json_error(StatusCode::PAYLOAD_TOO_LARGE, e))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| json_error(StatusCode::BAD_REQUEST, e))
}

async fn handle_admin_request(
    req: Request<Incoming>,
    state: Arc<AdminState>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let method = parts.method;

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        _ if !check_auth(&parts.headers, &auth_token) => {
            warn!(%path, "Unauthorized admin API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::GET, "/routes") => {
            let table = state.locator.get_routes().await;
            let body = serde_json::json!({
                "generation": table.generation(),
                "routes": table.summary(),
                "count": table.len(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::POST, "/routes/refresh") => match state.locator.refresh().await {
            Ok(table) => {
                info!(generation = table.generation(), "Routes refreshed via admin API");
                let body = serde_json::json!({
                    "generation": table.generation(),
                    "count": table.len(),
                });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Forced route refresh failed");
                json_error(StatusCode::SERVICE_UNAVAILABLE, e)
            }
        },

        (&Method::GET, "/instances") => match state.registry.list_instances().await {
            Ok(mut instances) => {
                instances.sort_by(|a, b| a.id.cmp(&b.id));
                let body = serde_json::json!({
                    "count": instances.len(),
                    "instances": instances,
                });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, e),
        },

        (&Method::POST, "/instances") => match read_json::<RegisterRequest>(body).await {
            Ok(request) => match state
                .registry
                .register(request.id.map(InstanceId::new), request.registration)
            {
                Ok(id) => json_response(StatusCode::CREATED, serde_json::json!({ "id": id }).to_string()),
                Err(e) => json_error(StatusCode::BAD_REQUEST, e),
            },
            Err(response) => response,
        },

        (m, p) if p.starts_with("/instances/") => {
            let rest = &p["/instances/".len()..];
            match (m, rest.split_once('/')) {
                (&Method::DELETE, None) if !rest.is_empty() => {
                    if state.registry.deregister(&InstanceId::new(rest)) {
                        response(StatusCode::NO_CONTENT, "")
                    } else {
                        json_error(StatusCode::NOT_FOUND, format!("instance not found: {}", rest))
                    }
                }
                (&Method::PUT, Some((id, "status"))) if !id.is_empty() => {
                    match read_json::<StatusInfo>(body).await {
                        Ok(status) => match state.registry.update_status(&InstanceId::new(id), status) {
                            Ok(changed) => {
                                json_response(StatusCode::OK, serde_json::json!({ "changed": changed }).to_string())
                            }
                            Err(e @ RegistryError::NotFound(_)) => json_error(StatusCode::NOT_FOUND, e),
                            Err(e) => json_error(StatusCode::BAD_REQUEST, e),
                        },
                        Err(response) => response,
                    }
                }
                _ => response(StatusCode::NOT_FOUND, "not found"),
            }
        }

        (&Method::GET, "/notifications") => {
            let body = serde_json::json!({
                "notifiers": state.notifications.notifiers(),
                "stats": state.notifications.stats(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
