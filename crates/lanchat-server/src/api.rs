use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Request, State},
    http::{header, Extensions, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lanchat_shared::types::{ChatPairKey, Message, MessageDraft};
use lanchat_store::{ChatLogStore, StoreError};
use serde::Serialize;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::identity::{ConnectionMeta, IdentityResolver};
use crate::relay::RelayEngine;
use crate::socket::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayEngine>,
    pub chats: Arc<ChatLogStore>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/test", get(test_route))
        .route("/socket", get(ws_handler))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(state.config.max_upload_size)),
        )
        .route("/attachments/{pair}/{*path}", get(serve_attachment))
        .route("/download/{pair}/{*path}", get(download_attachment));

    if let Some(dir) = &state.config.static_dir {
        info!(dir = %dir.display(), "Serving web client");
        // SPA fallback: unknown paths get index.html
        let serve = ServeDir::new(dir)
            .append_index_html_on_directories(true)
            .fallback(ServeFile::new(dir.join("index.html")));
        app = app.fallback_service(serve);
    }

    app.layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct UploadResponse {
    message: Message,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn test_route() -> &'static str {
    "Test route is working!"
}

/// Store uploaded files for a pair, then persist and relay the message that
/// references them.
///
/// Form fields: `message` (JSON message without attachment paths) and one
/// or more `files`.
async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServerError> {
    let meta = ConnectionMeta::from_request(&headers, &extensions);
    let from = state
        .resolver
        .resolve(&meta)
        .ok_or_else(|| ServerError::BadRequest("Could not determine client address".into()))?;

    let mut draft: Option<MessageDraft> = None;
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "message" => {
                let text = field.text().await.map_err(multipart_error)?;
                let parsed = serde_json::from_str(&text)
                    .map_err(|e| ServerError::BadRequest(format!("Invalid 'message' field: {e}")))?;
                draft = Some(parsed);
            }
            "files" => {
                let file_name = field.file_name().unwrap_or("file").to_string();
                let data = field.bytes().await.map_err(multipart_error)?;
                files.push((file_name, data));
            }
            other => debug!(field = %other, "Ignoring unknown upload field"),
        }
    }

    let draft = draft.ok_or_else(|| {
        ServerError::BadRequest("Missing 'message' field in multipart form".into())
    })?;
    if files.is_empty() {
        return Err(ServerError::BadRequest(
            "Missing 'files' field in multipart form".into(),
        ));
    }

    let mut attachments = Vec::with_capacity(files.len());
    for (name, data) in &files {
        let stored = state
            .chats
            .store_attachment(&from, &draft.to, name, data)
            .await?;
        attachments.push(stored);
    }

    let message = MessageDraft {
        attachments: Some(attachments),
        ..draft
    }
    .into_message(from);
    let delivered = state.relay.publish(&message).await?;

    info!(
        from = %message.from,
        to = %message.to,
        files = files.len(),
        delivered,
        "Upload stored"
    );

    Ok(Json(UploadResponse { message }))
}

fn multipart_error(e: MultipartError) -> ServerError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge
    } else {
        ServerError::BadRequest(format!("Multipart error: {e}"))
    }
}

/// Serve a stored attachment with its guessed content type. Range and
/// conditional requests are answered by `ServeFile`.
async fn serve_attachment(
    State(state): State<AppState>,
    Path((pair, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ServerError> {
    let file = attachment_path(&state, &pair, &path).await?;
    Ok(serve_file(file, request).await)
}

async fn download_attachment(
    State(state): State<AppState>,
    Path((pair, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ServerError> {
    let file = attachment_path(&state, &pair, &path).await?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', ""))
        .unwrap_or_default();

    let mut response = serve_file(file, request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

async fn serve_file(file: PathBuf, request: Request) -> Response {
    match ServeFile::new(file).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

/// Validated on-disk location of an existing attachment.
async fn attachment_path(
    state: &AppState,
    pair: &str,
    path: &str,
) -> Result<PathBuf, ServerError> {
    let key = ChatPairKey::parse(pair).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let file = state.chats.resolve_attachment(&key, path)?;

    match tokio::fs::metadata(&file).await {
        Ok(meta) if meta.is_file() => Ok(file),
        Ok(_) => Err(ServerError::NotFound(format!("{pair}/{path}"))),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(ServerError::NotFound(format!("{pair}/{path}")))
        }
        Err(e) => Err(StoreError::from(e).into()),
    }
}

/// Start the HTTP server and block until Ctrl+C.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use lanchat_shared::protocol::ServerEvent;
    use lanchat_shared::types::PeerIp;
    use lanchat_store::UserStore;
    use tempfile::TempDir;

    use crate::identity::LoopbackAwareResolver;

    const BOUNDARY: &str = "lanchat-test-boundary";
    const PAIR: &str = "10.0.0.1_to_10.0.0.2";

    async fn test_state(max_upload_size: usize) -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let users = Arc::new(
            UserStore::open(dir.path().join("registered_users.json"))
                .await
                .unwrap(),
        );
        let chats = Arc::new(ChatLogStore::open(dir.path().join("chats")).await.unwrap());
        let relay = Arc::new(RelayEngine::new(users, chats.clone()));
        let config = ServerConfig {
            chats_dir: dir.path().join("chats"),
            max_upload_size,
            ..ServerConfig::default()
        };
        let state = AppState {
            relay,
            chats,
            resolver: Arc::new(LoopbackAwareResolver::new(
                PeerIp::parse("192.168.1.50").unwrap(),
            )),
            config: Arc::new(config),
        };
        (state, dir)
    }

    fn multipart_body(message: Option<&str>, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(message) = message {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\n\
                     Content-Disposition: form-data; name=\"message\"\r\n\r\n\
                     {message}\r\n"
                )
                .as_bytes(),
            );
        }
        for (name, data) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\n\
                     Content-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(from: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header("x-forwarded-for", from)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_health_and_test_routes() {
        let (state, _dir) = test_state(1024).await;
        let app = build_router(state);

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["status"], "ok");

        let response = app.oneshot(get("/test")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"Test route is working!");
    }

    #[tokio::test]
    async fn test_upload_stores_relays_and_serves() {
        let (state, dir) = test_state(1024 * 1024).await;
        let (_b, mut b_rx) = state.relay.connect(PeerIp::parse("10.0.0.2").unwrap()).await;
        while b_rx.try_recv().is_ok() {}
        let app = build_router(state);

        let message = r#"{"text":"look","to":"10.0.0.2","from":"6.6.6.6","sent":"2024-05-01T10:00:00Z"}"#;
        let body = multipart_body(Some(message), &[("cat.png", b"PNGDATA")]);
        let response = app
            .clone()
            .oneshot(upload_request("10.0.0.1", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        let message: Message = serde_json::from_value(body["message"].clone()).unwrap();
        assert_eq!(message.from.as_str(), "10.0.0.1");
        assert_eq!(message.text, "look");
        let attachment = &message.attachments.as_ref().unwrap()[0];
        assert_eq!(attachment.name, "cat.png");
        let path = attachment.path.clone().unwrap();
        assert!(path.starts_with("attachments/") && path.ends_with(".png"));

        // Live delivery to the connected recipient
        match b_rx.try_recv() {
            Ok(ServerEvent::ReceiveMessage(m)) => assert_eq!(m, message),
            other => panic!("unexpected event: {other:?}"),
        }

        // Persisted alongside the file
        let log_path = dir.path().join("chats").join(PAIR).join("messages.json");
        let log = std::fs::read_to_string(log_path).unwrap();
        let log: Vec<Message> = serde_json::from_str(&log).unwrap();
        assert_eq!(log, vec![message]);

        let response = app
            .clone()
            .oneshot(get(&format!("/attachments/{PAIR}/{path}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(body_bytes(response).await, b"PNGDATA");

        let file_name = path.trim_start_matches("attachments/");
        let response = app
            .oneshot(get(&format!("/download/{PAIR}/{file_name}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
        assert_eq!(disposition, format!("attachment; filename=\"{file_name}\""));
    }

    #[tokio::test]
    async fn test_upload_requires_files_and_message() {
        let (state, _dir) = test_state(1024 * 1024).await;
        let app = build_router(state);

        let body = multipart_body(Some(r#"{"text":"x","to":"10.0.0.2"}"#), &[]);
        let response = app
            .clone()
            .oneshot(upload_request("10.0.0.1", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = multipart_body(None, &[("a.txt", b"hello")]);
        let response = app
            .clone()
            .oneshot(upload_request("10.0.0.1", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = multipart_body(Some("not json"), &[("a.txt", b"hello")]);
        let response = app.oneshot(upload_request("10.0.0.1", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_over_limit_is_rejected() {
        let (state, _dir) = test_state(256).await;
        let app = build_router(state);

        let big = vec![b'x'; 4096];
        let body = multipart_body(Some(r#"{"text":"x","to":"10.0.0.2"}"#), &[("big.bin", &big)]);
        let response = app.oneshot(upload_request("10.0.0.1", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_attachment_range_request() {
        let (state, _dir) = test_state(1024).await;
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let stored = state
            .chats
            .store_attachment(
                &PeerIp::parse("10.0.0.1").unwrap(),
                &PeerIp::parse("10.0.0.2").unwrap(),
                "clip.mp4",
                &data,
            )
            .await
            .unwrap();
        let path = stored.path.unwrap();
        let app = build_router(state);

        let request = Request::builder()
            .uri(format!("/attachments/{PAIR}/{path}"))
            .header(header::RANGE, "bytes=0-99")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-99/10000");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(body_bytes(response).await, &data[..100]);

        let response = app.oneshot(get(&format!("/attachments/{PAIR}/{path}"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(body_bytes(response).await.len(), 10_000);
    }

    #[tokio::test]
    async fn test_attachment_lookup_errors() {
        let (state, _dir) = test_state(1024).await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(get(&format!("/attachments/{PAIR}/missing.png")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(get(&format!("/attachments/{PAIR}/..%2Fmessages.json")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(get("/attachments/10.0.0.2_to_10.0.0.1/a.png"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
