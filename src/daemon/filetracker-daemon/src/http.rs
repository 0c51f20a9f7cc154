//! HTTP surface: login, aggregated data, spreadsheet export and the
//! `file-updated` push channel (Server-Sent Events)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{FromRequest, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use filetracker_core::{Aggregator, AuthError, StoreError};
use filetracker_system::Notifier;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

use crate::auth::{Authenticator, LoginRequest, SessionStore, SESSION_COOKIE};
use crate::export::{encode_xlsx, EXPORT_FILENAME, XLSX_CONTENT_TYPE};
use crate::metrics::MetricsCollector;

/// Name of the push event sent for every accepted change
pub const FILE_UPDATED_EVENT: &str = "file-updated";

/// How long shutdown waits for open connections (event streams never finish)
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub notifier: Notifier,
    pub authenticator: Arc<Authenticator>,
    pub sessions: Arc<SessionStore>,
    pub metrics: Arc<MetricsCollector>,
    pub require_login: bool,
    pub login_redirect: String,
}

/// Errors a handler can answer with
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Rejected(AuthError),
    Store(StoreError),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Store(e) => ApiError::Store(e),
            AuthError::Hash(e) => ApiError::Internal(e),
            rejection => ApiError::Rejected(rejection),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Login required").into_response(),
            ApiError::Rejected(e) => (StatusCode::UNAUTHORIZED, e.to_string()).into_response(),
            ApiError::Store(e) => {
                error!(error = %e, "Tracked-file store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error").into_response()
            }
            ApiError::Internal(e) => {
                error!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}

#[derive(Serialize)]
struct FileUpdated<'a> {
    filename: &'a str,
}

/// Build the application router
pub fn router(state: AppState, static_dir: Option<&Path>) -> Router {
    let protected = Router::new()
        .route("/data", get(get_data))
        .route("/export", get(export))
        .route("/events", get(events))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    let router = Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/health", get(health))
        .merge(protected)
        .with_state(state);

    match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    }
}

async fn require_session(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    if !state.require_login || session_user(&state, &jar).is_some() {
        return next.run(request).await;
    }
    ApiError::Unauthorized.into_response()
}

fn session_user(state: &AppState, jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE)
        .and_then(|cookie| state.sessions.get(cookie.value()))
}

async fn read_login(request: Request) -> Result<LoginRequest, Response> {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    if is_json {
        Json::<LoginRequest>::from_request(request, &())
            .await
            .map(|Json(body)| body)
            .map_err(IntoResponse::into_response)
    } else {
        Form::<LoginRequest>::from_request(request, &())
            .await
            .map(|Form(body)| body)
            .map_err(IntoResponse::into_response)
    }
}

async fn login(State(state): State<AppState>, jar: CookieJar, request: Request) -> Response {
    let credentials = match read_login(request).await {
        Ok(credentials) => credentials,
        Err(rejection) => return rejection,
    };

    match state
        .authenticator
        .verify(&credentials.username, &credentials.password)
        .await
    {
        Ok(user) => {
            state.metrics.record_login(true);
            let token = state.sessions.create(&user.username);
            let cookie = Cookie::build((SESSION_COOKIE, token))
                .http_only(true)
                .same_site(SameSite::Lax)
                .path("/");
            info!("User '{}' logged in", user.username);
            (jar.add(cookie), Redirect::to(&state.login_redirect)).into_response()
        }
        Err(e) => {
            if e.is_rejection() {
                state.metrics.record_login(false);
                warn!(username = %credentials.username, "Login rejected: {}", e);
            }
            ApiError::from(e).into_response()
        }
    }
}

async fn logout(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.revoke(cookie.value());
    }
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    (jar, StatusCode::NO_CONTENT)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "subscribers": state.notifier.subscriber_count(),
    }))
}

async fn aggregate(state: &AppState) -> Result<Vec<Value>, ApiError> {
    let started = Instant::now();
    let aggregation = state.aggregator.aggregate().await?;
    state
        .metrics
        .record_aggregation(&aggregation, started.elapsed());
    Ok(aggregation.records)
}

async fn get_data(State(state): State<AppState>) -> Result<Json<Vec<Value>>, ApiError> {
    Ok(Json(aggregate(&state).await?))
}

async fn export(State(state): State<AppState>) -> Result<Response, ApiError> {
    let records = aggregate(&state).await?;
    let row_count = records.len();

    let workbook = tokio::task::spawn_blocking(move || encode_xlsx(&records))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::Internal(format!("Spreadsheet encoding failed: {}", e)))?;

    debug!("Exported {} records ({} bytes)", row_count, workbook.len());
    Ok((
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", EXPORT_FILENAME),
            ),
        ],
        workbook,
    )
        .into_response())
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = BroadcastStream::new(state.notifier.subscribe()).filter_map(|message| {
        match message {
            Ok(change) => Some(
                Event::default()
                    .event(FILE_UPDATED_EVENT)
                    .json_data(FileUpdated {
                        filename: &change.path,
                    }),
            ),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                debug!("Event stream subscriber lagged, {} changes skipped", missed);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// HTTP server wrapper
pub struct HttpServer {
    addr: SocketAddr,
    router: Option<Router>,
    shutdown_sender: Option<oneshot::Sender<()>>,
    server_handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(bind_address: &str, port: u16, router: Router) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", bind_address, port)
            .parse()
            .with_context(|| "Invalid server address")?;

        Ok(Self {
            addr,
            router: Some(router),
            shutdown_sender: None,
            server_handle: None,
        })
    }

    /// Bind and start serving; returns the bound address
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let router = self
            .router
            .take()
            .context("HTTP server already started")?;

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_receiver.await;
                })
                .await
        });

        self.shutdown_sender = Some(shutdown_sender);
        self.server_handle = Some(handle);

        info!("Server running on http://{}", local_addr);
        Ok(local_addr)
    }

    /// Shutdown the HTTP server
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down HTTP server");

        if let Some(sender) = self.shutdown_sender {
            let _ = sender.send(());
        }

        if let Some(mut handle) = self.server_handle {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(result)) => result.context("HTTP server failed")?,
                Ok(Err(e)) => warn!("HTTP server task ended abnormally: {}", e),
                Err(_) => {
                    warn!("Open connections outlived the shutdown grace period");
                    handle.abort();
                }
            }
        }

        info!("HTTP server shutdown completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use filetracker_core::{ChangeEvent, MemoryStore, TrackedFileStore};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        _dir: TempDir,
        router: Router,
        notifier: Notifier,
    }

    async fn fixture(require_login: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        for (name, body) in [("a.json", r#"[{"x":1}]"#), ("b.json", r#"[{"x":2}]"#)] {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            store.upsert(&path.to_string_lossy(), 1).unwrap();
        }

        let authenticator = Arc::new(Authenticator::new(store.clone(), 4));
        authenticator.ensure_user("admin", "admin123").await.unwrap();

        let notifier = Notifier::new(16);
        let state = AppState {
            aggregator: Arc::new(Aggregator::new(store)),
            notifier: notifier.clone(),
            authenticator,
            sessions: Arc::new(SessionStore::new(Duration::from_secs(60))),
            metrics: Arc::new(MetricsCollector::new()),
            require_login,
            login_redirect: "/dashboard".to_string(),
        };

        Fixture {
            _dir: dir,
            router: router(state, None),
            notifier,
        }
    }

    fn form_login(username: &str, password: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("username={}&password={}", username, password)))
            .unwrap()
    }

    fn get_with_cookie(uri: &str, cookie: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn session_cookie(router: &Router) -> String {
        let response = router
            .clone()
            .oneshot(form_login("admin", "admin123"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_login_success_redirects_with_session() {
        let fx = fixture(true).await;
        let response = fx
            .router
            .clone()
            .oneshot(form_login("admin", "admin123"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/dashboard");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with(SESSION_COOKIE));
        assert!(cookie.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn test_login_json_body() {
        let fx = fixture(true).await;
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"username":"admin","password":"admin123"}"#))
            .unwrap();

        let response = fx.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn test_login_rejections_set_no_session() {
        let fx = fixture(true).await;

        for (username, password) in [("admin", "wrong"), ("nobody", "admin123")] {
            let response = fx
                .router
                .clone()
                .oneshot(form_login(username, password))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert!(response.headers().get(header::SET_COOKIE).is_none());
        }
    }

    #[tokio::test]
    async fn test_data_requires_session() {
        let fx = fixture(true).await;
        let response = fx
            .router
            .clone()
            .oneshot(get_with_cookie("/data", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let forged = format!("{}=forged", SESSION_COOKIE);
        let response = fx
            .router
            .clone()
            .oneshot(get_with_cookie("/data", Some(&forged)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_data_returns_aggregate() {
        let fx = fixture(true).await;
        let cookie = session_cookie(&fx.router).await;

        let response = fx
            .router
            .clone()
            .oneshot(get_with_cookie("/data", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let records: Vec<Value> = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.contains(&json!({"x": 1})));
        assert!(records.contains(&json!({"x": 2})));
    }

    #[tokio::test]
    async fn test_export_attachment() {
        let fx = fixture(false).await;
        let response = fx
            .router
            .clone()
            .oneshot(get_with_cookie("/export", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=export.xlsx"
        );
        assert_eq!(response.headers()[header::CONTENT_TYPE], XLSX_CONTENT_TYPE);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[tokio::test]
    async fn test_logout_revokes_session() {
        let fx = fixture(true).await;
        let cookie = session_cookie(&fx.router).await;

        let logout = HttpRequest::builder()
            .method("POST")
            .uri("/logout")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        let response = fx.router.clone().oneshot(logout).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = fx
            .router
            .clone()
            .oneshot(get_with_cookie("/data", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_event_stream_opens() {
        let fx = fixture(true).await;
        let cookie = session_cookie(&fx.router).await;

        let response = fx
            .router
            .clone()
            .oneshot(get_with_cookie("/events", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    }

    #[tokio::test]
    async fn test_event_stream_delivers_file_updated() {
        let fx = fixture(false).await;
        let response = fx
            .router
            .clone()
            .oneshot(get_with_cookie("/events", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        assert_eq!(
            fx.notifier.broadcast(ChangeEvent {
                path: "/d/a.json".to_string(),
                timestamp: 1000,
            }),
            1
        );

        let frame = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let frame = String::from_utf8(frame.to_vec()).unwrap();

        let mut lines = frame.lines();
        assert_eq!(lines.next(), Some("event: file-updated"));
        let data = lines
            .next()
            .and_then(|line| line.strip_prefix("data: "))
            .unwrap();
        let payload: Value = serde_json::from_str(data).unwrap();
        assert_eq!(payload, json!({"filename": "/d/a.json"}));
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let fx = fixture(true).await;
        let response = fx
            .router
            .clone()
            .oneshot(get_with_cookie("/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"ok\""));
    }
}
