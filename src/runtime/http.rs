//! HTTP mock handler.
//!
//! Routes are grouped by (rendered) path and dispatched by method inside each
//! group. Paths are literal: `:id` or `{id}` segments match only themselves,
//! and a path ending in `/` also serves everything below it. Every request
//! renders its headers and body through a fresh [`TemplateRuntime`].

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{bind_listener, build_engine, log_definition, ProtocolHandler};
use crate::config::{MockDefinition, Protocol, Route, RuntimeSettings};
use crate::error::{StartError, StartResult};
use crate::template::{merge_context, TemplateEngine, TemplateRuntime};

/// Body sent when a response body template fails to render.
pub const TEMPLATE_ERROR_BODY: &str = r#"{"error": "template rendering failed"}"#;

/// Paths that get a built-in health endpoint unless a route claims them.
pub const HEALTH_PATHS: [&str; 2] = ["/health", "/healthz"];

/// Serves a definition's `routes` over HTTP.
pub struct HttpHandler {
    settings: RuntimeSettings,
    running: Option<RunningServer>,
}

struct RunningServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

/// Per-mock state shared by every request.
struct HttpState {
    engine: Arc<TemplateEngine>,
    globals: Map<String, Value>,
    table: RouteTable,
}

/// What a registered path serves.
enum Endpoint {
    Routes(Vec<Route>),
    Health,
}

/// Literal path table. An exact path wins; otherwise the longest registered
/// path ending in `/` that prefixes the request path.
#[derive(Default)]
struct RouteTable {
    endpoints: IndexMap<String, Endpoint>,
}

impl RouteTable {
    /// Find the endpoint for a request path, with the registered path it matched.
    fn lookup(&self, path: &str) -> Option<(&str, &Endpoint)> {
        if let Some((key, endpoint)) = self.endpoints.get_key_value(path) {
            return Some((key.as_str(), endpoint));
        }
        self.endpoints
            .iter()
            .filter(|(prefix, _)| prefix.ends_with('/') && path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, endpoint)| (prefix.as_str(), endpoint))
    }
}

impl HttpHandler {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            running: None,
        }
    }
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn start(&mut self, def: &MockDefinition) -> StartResult<()> {
        if self.running.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        def.validate()?;
        log_definition(def);

        let engine = build_engine(def).await;
        let router = build_router(def, engine);

        let listener = bind_listener(&self.settings, def.port).await?;
        let addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let server_cancel = cancel.clone();
        let mut task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    server_cancel.cancelled().await;
                })
                .await
        });

        // Catch a server that dies right after launch
        let window = Duration::from_millis(self.settings.bind_check_ms);
        if let Ok(joined) = tokio::time::timeout(window, &mut task).await {
            let reason = match joined {
                Ok(Ok(())) => "server stopped".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            error!(port = def.port, reason = %reason, "HTTP server exited during startup");
            return Err(StartError::Exited {
                port: def.port,
                reason,
            });
        }

        info!(%addr, name = %def.display_name(), "HTTP mock listening");
        self.running = Some(RunningServer { addr, cancel, task });
        Ok(())
    }

    async fn stop(&mut self) -> StartResult<()> {
        let Some(mut server) = self.running.take() else {
            return Ok(());
        };

        server.cancel.cancel();
        let grace = Duration::from_millis(self.settings.shutdown_grace_ms);
        match tokio::time::timeout(grace, &mut server.task).await {
            Ok(Ok(Err(e))) => warn!(addr = %server.addr, error = %e, "HTTP server ended with error"),
            Ok(_) => info!(addr = %server.addr, "HTTP mock stopped"),
            Err(_) => {
                warn!(addr = %server.addr, "Graceful shutdown timed out, forcing close");
                server.task.abort();
            }
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|s| s.addr)
    }
}

/// Build the router for a definition.
///
/// Routes sharing a resolved path form one group; the first route in the
/// group whose method matches answers the request.
pub fn build_router(def: &MockDefinition, engine: Arc<TemplateEngine>) -> Router {
    let table = route_table(def, &engine);
    let state = Arc::new(HttpState {
        engine,
        globals: def.variables(),
        table,
    });
    Router::new().fallback(dispatch).with_state(state)
}

/// Group routes by rendered path and add health endpoints for unclaimed paths.
fn route_table(def: &MockDefinition, engine: &TemplateEngine) -> RouteTable {
    let path_ctx = path_context(&def.variables());

    let mut groups: IndexMap<String, Vec<Route>> = IndexMap::new();
    for route in &def.routes {
        let path = resolve_path(engine, &route.path, &path_ctx);
        groups.entry(path).or_default().push(route.clone());
    }

    let mut table = RouteTable::default();
    for (path, routes) in groups {
        if !path.starts_with('/') {
            warn!(path = %path, "Route path must start with '/', skipping");
            continue;
        }
        debug!(path = %path, routes = routes.len(), "Registering route group");
        table.endpoints.insert(path, Endpoint::Routes(routes));
    }

    for path in HEALTH_PATHS {
        if !table.endpoints.contains_key(path) {
            table.endpoints.insert(path.to_string(), Endpoint::Health);
        }
    }

    table
}

async fn dispatch(
    State(state): State<Arc<HttpState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state.table.lookup(uri.path()) {
        Some((_, Endpoint::Routes(routes))) => respond(&state, routes, &method, &uri, &headers, &body),
        Some((_, Endpoint::Health)) => health(method).await,
        None => {
            debug!(method = %method, path = %uri.path(), "No route for path");
            (StatusCode::NOT_FOUND, "404 page not found\n").into_response()
        }
    }
}

/// Template context for route paths: variables at the top level and under `context`.
fn path_context(globals: &Map<String, Value>) -> Value {
    let mut ctx = globals.clone();
    ctx.insert("context".to_string(), Value::Object(globals.clone()));
    Value::Object(ctx)
}

fn resolve_path(engine: &TemplateEngine, raw: &str, ctx: &Value) -> String {
    if !raw.contains("{{") {
        return raw.to_string();
    }
    match engine.render("route_path", raw, ctx) {
        Ok(path) => path,
        Err(e) => {
            warn!(path = %raw, error = %e, "Failed to render route path, using raw path");
            raw.to_string()
        }
    }
}

fn respond(
    state: &HttpState,
    routes: &[Route],
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    let Some(route) = routes.iter().find(|r| r.accepts(method.as_str())) else {
        debug!(method = %method, path = %uri.path(), "No route for method");
        return (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n").into_response();
    };

    let input = json_input(method, headers, body);
    let ctx = merge_context(input, None, Some(state.globals.clone()));
    let tpl = TemplateRuntime::new(Arc::clone(&state.engine), ctx);

    let mut response_headers = HeaderMap::new();
    for (name, raw) in &route.response.headers {
        let value = tpl.render("header", raw).unwrap_or_else(|e| {
            warn!(header = %name, error = %e, "Failed to render header, using raw value");
            raw.clone()
        });
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response_headers.insert(name, value);
            }
            _ => warn!(header = %name, "Invalid response header, skipping"),
        }
    }

    let body = match tpl.render("body", &route.response.body) {
        Ok(body) => body,
        Err(e) => {
            error!(path = %uri.path(), error = %e, "Failed to render response body");
            response_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            TEMPLATE_ERROR_BODY.to_string()
        }
    };

    let status = StatusCode::from_u16(route.response.status).unwrap_or_else(|_| {
        warn!(status = route.response.status, "Invalid status code, using 500");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    info!(
        method = %method,
        path = %uri.path(),
        status = status.as_u16(),
        "Serving mock response"
    );
    (status, response_headers, body).into_response()
}

/// Decode a JSON object body for POST/PUT/PATCH requests.
fn json_input(method: &Method, headers: &HeaderMap, body: &Bytes) -> Option<Map<String, Value>> {
    if !matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
        return None;
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);
    if !is_json || body.is_empty() {
        return None;
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            warn!("JSON request body is not an object, ignoring");
            None
        }
        Err(e) => {
            warn!(error = %e, "Failed to decode JSON request body");
            None
        }
    }
}

async fn health(method: Method) -> Response {
    let headers = [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_METHODS, "GET,HEAD,OPTIONS"),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
        (header::CACHE_CONTROL, "no-store"),
    ];

    match method {
        Method::OPTIONS => (StatusCode::NO_CONTENT, headers).into_response(),
        Method::HEAD => (StatusCode::OK, headers).into_response(),
        _ => {
            let body = json!({
                "status": "healthy",
                "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            });
            (StatusCode::OK, headers, axum::Json(body)).into_response()
        }
    }
}
