use crate::error::{json_error_response, ApiErrorCode};
use crate::routes::RouteProvider;
use crate::task::{Cause, Task};
use crate::watcher::Watcher;
use futures::{Stream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Admin responses: buffered JSON or a server-sent-events stream
pub type AdminBody = UnsyncBoxBody<Bytes, Infallible>;

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = response(status, body.to_string());
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Admin API: health, version and the idle watchers behind each route
pub struct AdminServer {
    bind_addr: SocketAddr,
    routes: Arc<RouteProvider>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, routes: Arc<RouteProvider>, auth_token: String) -> Self {
        Self {
            bind_addr,
            routes,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Bind and serve as the `admin` subtask of `parent`
    pub async fn start(self, parent: &Task) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let task = parent.subtask("admin", true);
        tokio::spawn(self.serve(listener, task));
        Ok(())
    }

    /// Accept connections until `task` is cancelled, then finish it
    pub async fn serve(self, listener: TcpListener, task: Task) {
        let addr = listener.local_addr().unwrap_or(self.bind_addr);
        info!(addr = %addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        loop {
            tokio::select! {
                _ = task.cancelled() => {
                    info!("Admin server shutting down");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let routes = Arc::clone(&self.routes);
                        let auth_token = Arc::clone(&self.auth_token);
                        let conn_task = task.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = conn_task.cancelled() => {}
                                result = serve_admin_connection(stream, routes, auth_token) => {
                                    if let Err(e) = result {
                                        debug!(addr = %addr, error = %e, "Admin connection error");
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept admin connection");
                    }
                },
            }
        }

        task.finish(task.finish_cause().unwrap_or(Cause::Canceled)).await;
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    routes: Arc<RouteProvider>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let routes = Arc::clone(&routes);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, routes, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

/// Only `Authorization: Bearer <token>` is accepted
fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected_token)
}

/// Past events of the watcher's current wake, then live ones, as SSE
/// frames. Ends when the watcher stops.
pub fn wake_event_stream(watcher: &Watcher) -> impl Stream<Item = Bytes> + Send + 'static {
    let (history, live) = watcher.wake_events();
    let task = watcher.task().clone();

    let live = futures::stream::unfold((live, task), |(mut live, task)| async move {
        loop {
            tokio::select! {
                _ = task.cancelled() => return None,
                received = live.recv() => match received {
                    Ok(event) => return Some((event, (live, task))),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Wake event subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    });

    futures::stream::iter(history)
        .chain(live)
        .map(|event| Bytes::from(event.to_sse()))
}

fn sse_response(watcher: &Watcher) -> Response<AdminBody> {
    let frames = wake_event_stream(watcher).map(|bytes| Ok::<_, Infallible>(Frame::data(bytes)));
    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        hyper::header::CACHE_CONTROL,
        hyper::header::HeaderValue::from_static("no-cache"),
    );
    response
}

fn unauthorized(path: &str) -> Response<Full<Bytes>> {
    warn!(path, "Unauthorized admin API request");
    json_error_response(ApiErrorCode::Unauthorized, "missing or invalid bearer token")
}

async fn handle_admin_request<B>(
    req: Request<B>,
    routes: Arc<RouteProvider>,
    auth_token: Arc<String>,
) -> Result<Response<AdminBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        // No auth
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (_, path) if !check_auth(&req, &auth_token) => unauthorized(path),

        (&Method::GET, "/watchers") => {
            let watchers: Vec<serde_json::Value> = routes
                .snapshots()
                .into_iter()
                .map(|(route, snapshot)| {
                    let mut value = serde_json::to_value(snapshot).unwrap_or_default();
                    value["route"] = serde_json::Value::String(route);
                    value
                })
                .collect();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "count": watchers.len(),
                    "watchers": watchers,
                }),
            )
        }

        (&Method::GET, path) if path.starts_with("/watchers/") => {
            let route = path.trim_start_matches("/watchers/");
            match lookup(&routes, route) {
                Ok(watcher) => {
                    let mut value = watcher.to_json();
                    value["route"] = serde_json::Value::String(route.to_string());
                    json_response(StatusCode::OK, value)
                }
                Err(response) => response,
            }
        }

        (&Method::GET, path) if path.starts_with("/events/") => {
            let route = path.trim_start_matches("/events/");
            match lookup(&routes, route) {
                Ok(watcher) => return Ok(sse_response(&watcher)),
                Err(response) => response,
            }
        }

        (&Method::POST, path) if path.starts_with("/wake/") => {
            let route = path.trim_start_matches("/wake/");
            match lookup(&routes, route) {
                Ok(watcher) => match watcher.wake_and_wait().await {
                    Ok(()) => {
                        info!(route, "Backend woken via admin API");
                        json_response(
                            StatusCode::OK,
                            serde_json::json!({
                                "route": route,
                                "status": watcher.current_status(),
                            }),
                        )
                    }
                    Err(e) => {
                        warn!(route, error = %e, "Wake via admin API failed");
                        json_error_response(ApiErrorCode::from(&e), e.to_string())
                    }
                },
                Err(response) => response,
            }
        }

        _ => json_error_response(ApiErrorCode::NotFound, "not found"),
    };

    Ok(response.map(BodyExt::boxed_unsync))
}

fn lookup(
    routes: &RouteProvider,
    route: &str,
) -> Result<Arc<Watcher>, Response<Full<Bytes>>> {
    if !routes.is_known(route) {
        return Err(json_error_response(
            ApiErrorCode::UnknownRoute,
            format!("no route named {}", route),
        ));
    }
    routes
        .watcher_for(route)
        .map_err(|e| json_error_response(ApiErrorCode::from(&e), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::docker::DockerClientPool;
    use crate::routes::DefaultProviders;
    use crate::task::Root;
    use crate::watcher::WatcherRegistry;
    use http_body_util::Empty;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn routes_for(root: &Root) -> Arc<RouteProvider> {
        let routes = RouteProvider::new(
            root.task(),
            WatcherRegistry::new(),
            Arc::new(DefaultProviders::new(DockerClientPool::new())),
        );
        let config: Config = toml::from_str(
            r#"
[routes.static]
port = 8080
"#,
        )
        .unwrap();
        routes.apply_config(&config).await;
        routes
    }

    async fn call(
        routes: &Arc<RouteProvider>,
        method: Method,
        path: &str,
        token: Option<&str>,
    ) -> (StatusCode, Option<String>, String) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = builder.body(Empty::<Bytes>::new()).unwrap();
        let response = handle_admin_request(req, Arc::clone(routes), Arc::new("secret".to_string()))
            .await
            .unwrap();

        let status = response.status();
        let code = response
            .headers()
            .get("X-Napgate-Error")
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, code, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_version_need_no_auth() {
        let root = Root::new();
        let routes = routes_for(&root).await;

        let (status, _, body) = call(&routes, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, _, body) = call(&routes, Method::GET, "/version", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(VERSION));
    }

    #[tokio::test]
    async fn test_watchers_require_token() {
        let root = Root::new();
        let routes = routes_for(&root).await;

        let (status, code, _) = call(&routes, Method::GET, "/watchers", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(code.as_deref(), Some("UNAUTHORIZED"));

        let (status, _, _) = call(&routes, Method::GET, "/watchers", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, body) = call(&routes, Method::GET, "/watchers", Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["count"], 0);
    }

    #[tokio::test]
    async fn test_bare_token_is_rejected() {
        let root = Root::new();
        let routes = routes_for(&root).await;

        let req = Request::builder()
            .uri("/watchers")
            .header(AUTHORIZATION, "secret")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(!check_auth(&req, "secret"));
        let response = handle_admin_request(req, Arc::clone(&routes), Arc::new("secret".to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .header(AUTHORIZATION, "Bearer secret")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(check_auth(&req, "secret"));
    }

    #[tokio::test]
    async fn test_wake_events_error_codes() {
        let root = Root::new();
        let routes = routes_for(&root).await;

        let (status, code, _) = call(&routes, Method::GET, "/events/missing", Some("secret")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code.as_deref(), Some("UNKNOWN_ROUTE"));

        let (status, code, _) = call(&routes, Method::GET, "/events/static", Some("secret")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code.as_deref(), Some("WATCHER_NOT_FOUND"));

        let (status, _, _) = call(&routes, Method::GET, "/events/static", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wake_error_codes() {
        let root = Root::new();
        let routes = routes_for(&root).await;

        let (status, code, _) = call(&routes, Method::POST, "/wake/missing", Some("secret")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code.as_deref(), Some("UNKNOWN_ROUTE"));

        let (status, code, _) = call(&routes, Method::POST, "/wake/static", Some("secret")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code.as_deref(), Some("WATCHER_NOT_FOUND"));

        let (status, code, _) = call(&routes, Method::DELETE, "/watchers", Some("secret")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code.as_deref(), Some("NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let root = Root::new();
        let routes = routes_for(&root).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = AdminServer::new(addr, routes, "secret".to_string());
        let task = root.subtask("admin", true);
        let handle = tokio::spawn(server.serve(listener, task.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200"));

        root.graceful_shutdown(std::time::Duration::from_secs(2))
            .await
            .unwrap();
        handle.await.unwrap();
        assert!(task.is_finished());
    }
}
