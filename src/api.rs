//! Route API server
//!
//! Speaks the configurable-http-proxy REST API so JupyterHub can manage
//! routes without knowing they end up in a VirtualService:
//!
//! - `GET /api/routes` lists routes
//! - `GET /api/routes/<path>` returns one route
//! - `POST /api/routes/<path>` with `{"target": ..., ...data}` adds or updates
//! - `DELETE /api/routes/<path>` removes
//!
//! `/health` and `/version` need no token; everything under `/api` does.

use crate::error::{json_error_response, ErrorCode, RouteError};
use crate::reconciler::{self, ApplyOutcome, Reconciler};
use crate::route::{Metadata, Route};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const ROUTES_PREFIX: &str = "/api/routes";

/// Largest accepted request body
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

/// HTTP server for the route API
pub struct ApiServer {
    bind_addr: SocketAddr,
    reconciler: Arc<Reconciler>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        reconciler: Arc<Reconciler>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            reconciler,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, store = self.reconciler.store_name(), "Route API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let reconciler = Arc::clone(&self.reconciler);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, reconciler, auth_token).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Route API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    _addr: SocketAddr,
    reconciler: Arc<Reconciler>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let reconciler = Arc::clone(&reconciler);
        let token = Arc::clone(&auth_token);
        async move { handle_request(req, reconciler, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

/// Accepts `token <secret>` (configurable-http-proxy) and `Bearer <secret>`
fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| {
            auth.strip_prefix("token ")
                .or_else(|| auth.strip_prefix("Bearer "))
        })
        .map(|token| token.trim() == expected_token)
        .unwrap_or(false)
}

/// Route id addressed by the remainder of an `/api/routes` path
fn route_id_from_path(rest: &str) -> Result<String, RouteError> {
    let decoded = urlencoding::decode(rest)
        .map_err(|_| RouteError::validation("route path is not valid UTF-8"))?;
    if decoded.starts_with('/') {
        Ok(decoded.into_owned())
    } else {
        Ok(format!("/{}", decoded))
    }
}

/// JSON representation of a route, flat like configurable-http-proxy reports it
fn route_json(route: &Route) -> Value {
    let mut object = serde_json::Map::new();
    for (key, value) in &route.metadata {
        object.insert(key.clone(), Value::String(value.clone()));
    }
    object.insert("target".to_string(), Value::String(route.target.clone()));
    object.insert(
        "last_activity".to_string(),
        Value::String(route.created_at.to_rfc3339()),
    );
    Value::Object(object)
}

/// Split a POST body into target and metadata
///
/// Non-string values are kept as their JSON text; nulls are dropped.
fn parse_route_body(body: &[u8]) -> Result<(String, Metadata), RouteError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RouteError::validation(format!("request body is not valid JSON: {}", e)))?;
    let Value::Object(object) = value else {
        return Err(RouteError::validation("request body must be a JSON object"));
    };

    let mut target = None;
    let mut metadata = Metadata::new();
    for (key, value) in object {
        if key == "target" {
            match value {
                Value::String(t) => target = Some(t),
                _ => return Err(RouteError::validation("'target' must be a string")),
            }
            continue;
        }
        match value {
            Value::Null => {}
            _ if key == "last_activity" => {}
            Value::String(s) => {
                metadata.insert(key, s);
            }
            other => {
                metadata.insert(key, other.to_string());
            }
        }
    }

    match target {
        Some(t) if !t.trim().is_empty() => Ok((t, metadata)),
        _ => Err(RouteError::validation("missing 'target' in request body")),
    }
}

fn error_response(err: &RouteError) -> Response<Full<Bytes>> {
    match err {
        RouteError::Validation(_) | RouteError::NotFound(_) => debug!(error = %err, "Route request rejected"),
        _ => warn!(error = %err, "Route request failed"),
    }
    err.into()
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    reconciler: Arc<Reconciler>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (_, p) if p == ROUTES_PREFIX || p.starts_with("/api/routes/") => {
            if !check_auth(&req, &auth_token) {
                warn!(%method, path = %p, "Unauthorized route API request");
                json_error_response(ErrorCode::Unauthorized, "missing or invalid API token")
            } else {
                let rest = p.strip_prefix(ROUTES_PREFIX).unwrap_or("");
                handle_routes(req, &method, rest, reconciler).await
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn handle_routes(
    req: Request<hyper::body::Incoming>,
    method: &Method,
    rest: &str,
    reconciler: Arc<Reconciler>,
) -> Response<Full<Bytes>> {
    if method == Method::GET && rest.is_empty() {
        let routes: serde_json::Map<String, Value> = reconciler
            .list()
            .iter()
            .map(|route| (route.id.clone(), route_json(route)))
            .collect();
        return json_response(StatusCode::OK, Value::Object(routes).to_string());
    }

    let id = match route_id_from_path(rest) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };

    match *method {
        Method::GET => match reconciler.get(&id) {
            Some(route) => json_response(StatusCode::OK, route_json(&route).to_string()),
            None => error_response(&RouteError::not_found(id)),
        },

        Method::POST => {
            let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return error_response(&RouteError::validation(format!(
                        "unreadable request body: {}",
                        e
                    )))
                }
            };

            let route = match parse_route_body(&body).and_then(|(target, metadata)| Route::new(id, target, metadata)) {
                Ok(route) => route,
                Err(e) => return error_response(&e),
            };

            let result = reconciler::detached(move |cancel| async move {
                reconciler.apply_route(route, &cancel).await
            })
            .await;

            match result {
                Ok(ApplyOutcome::Created) => response(StatusCode::CREATED, ""),
                Ok(ApplyOutcome::Updated) => response(StatusCode::OK, ""),
                Err(e) => error_response(&e),
            }
        }

        Method::DELETE => {
            let result = reconciler::detached(move |cancel| async move {
                reconciler.remove_route(&id, &cancel).await
            })
            .await;

            match result {
                Ok(()) => response(StatusCode::NO_CONTENT, ""),
                Err(e) => error_response(&e),
            }
        }

        _ => json_error_response(
            ErrorCode::MethodNotAllowed,
            format!("{} not supported on {}{}", method, ROUTES_PREFIX, rest),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_id_from_path() {
        assert_eq!(route_id_from_path("/user/alice").unwrap(), "/user/alice");
        assert_eq!(route_id_from_path("").unwrap(), "/");
        assert_eq!(route_id_from_path("/").unwrap(), "/");
        assert_eq!(route_id_from_path("/user/al%20ice").unwrap(), "/user/al ice");
        assert_eq!(route_id_from_path("/user/%C3%A9").unwrap(), "/user/é");
        assert!(route_id_from_path("/user/%FF").is_err());
    }

    #[test]
    fn test_parse_route_body() {
        let body = br#"{"target": "http://10.0.0.5:8888", "user": "alice", "server_name": "", "hub": true, "last_activity": "x", "extra": null}"#;
        let (target, metadata) = parse_route_body(body).unwrap();

        assert_eq!(target, "http://10.0.0.5:8888");
        assert_eq!(metadata.get("user").unwrap(), "alice");
        assert_eq!(metadata.get("server_name").unwrap(), "");
        assert_eq!(metadata.get("hub").unwrap(), "true");
        assert!(!metadata.contains_key("last_activity"));
        assert!(!metadata.contains_key("extra"));
        assert!(!metadata.contains_key("target"));
    }

    #[test]
    fn test_parse_route_body_rejects_bad_input() {
        assert!(parse_route_body(b"not json").is_err());
        assert!(parse_route_body(b"[1, 2]").is_err());
        assert!(parse_route_body(br#"{"user": "alice"}"#).is_err());
        assert!(parse_route_body(br#"{"target": ""}"#).is_err());
        assert!(parse_route_body(br#"{"target": 42}"#).is_err());
    }

    #[test]
    fn test_route_json_is_flat() {
        let mut metadata = Metadata::new();
        metadata.insert("user".to_string(), "alice".to_string());
        let route = Route::new("/user/alice", "10.0.0.5:8888", metadata).unwrap();

        let json = route_json(&route);
        assert_eq!(json["target"], "10.0.0.5:8888");
        assert_eq!(json["user"], "alice");
        assert!(json["last_activity"].as_str().is_some());
    }

    #[test]
    fn test_check_auth() {
        let with = |value: &str| {
            Request::builder()
                .header(AUTHORIZATION, value)
                .body(())
                .unwrap()
        };

        assert!(check_auth(&with("token secret"), "secret"));
        assert!(check_auth(&with("Bearer secret"), "secret"));
        assert!(!check_auth(&with("token wrong"), "secret"));
        assert!(!check_auth(&with("secret"), "secret"));
        assert!(!check_auth(&with("Basic secret"), "secret"));
        assert!(!check_auth(&Request::builder().body(()).unwrap(), "secret"));
    }
}
