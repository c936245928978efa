use axum::{
    body::Body,
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, SinkExt, StreamExt};
use std::env;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

mod protocol;
mod relay;
mod storage;

use relay::Relay;
use storage::VideoStore;

/// Upload body limit: 2 GiB covers typical movie files.
const UPLOAD_LIMIT: usize = 2 * 1024 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
    store: Arc<VideoStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lockstep_server=debug,info".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(3005);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let upload_dir = env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".into());

    let app_state = AppState {
        relay: Arc::new(Relay::new()),
        store: Arc::new(VideoStore::open(&upload_dir).await?),
    };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/ws", get(ws_endpoint))
        .route("/video/upload", post(upload_video))
        .route("/video", get(current_video).delete(delete_video))
        .route("/uploads/:name", get(serve_video))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT))
        .with_state(app_state.clone());

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Lockstep Server listening on {} (uploads in {})", addr, upload_dir);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

// --- relay -------------------------------------------------------------------

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let peer_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.relay.subscribe(peer_id, tx);

    // Forward frames destined for this peer onto its socket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sender.send(AxumWsMessage::Text(frame)).await {
                tracing::error!("Failed to send to peer: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                state.relay.broadcast_from(peer_id, text);
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Peer {} closing connection", peer_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            // Ping/pong is handled by axum; binary frames are not part of
            // the protocol and are dropped.
            _ => {}
        }
    }

    state.relay.unsubscribe(peer_id);
    send_task.abort();
}

// --- upload gateway ----------------------------------------------------------

async fn upload_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<protocol::VideoReference>, (StatusCode, String)> {
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Malformed multipart body: {e}")))?;
        let Some(mut field) = field else {
            return Err((StatusCode::BAD_REQUEST, "Missing 'file' field".into()));
        };
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let mut pending = state
            .store
            .begin(&file_name)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => pending.write(&chunk).await.map_err(internal_error)?,
                Ok(None) => break,
                Err(e) => {
                    return Err((StatusCode::BAD_REQUEST, format!("Upload interrupted: {e}")))
                }
            }
        }

        let reference = state.store.commit(pending).await.map_err(internal_error)?;
        return Ok(Json(reference));
    }
}

async fn current_video(
    State(state): State<AppState>,
) -> Result<Json<protocol::VideoReference>, (StatusCode, String)> {
    match state.store.current().await {
        Some(reference) => Ok(Json(reference)),
        None => Err((StatusCode::NOT_FOUND, "No video uploaded".into())),
    }
}

async fn delete_video(State(state): State<AppState>) -> StatusCode {
    if state.store.clear().await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn serve_video(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(path) = state.store.resolve(&name).await else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };

    let (file, len) = match open_with_len(&path).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!("Failed to open {}: {}", path.display(), e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Read failure").into_response();
        }
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    match range {
        None => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "video/mp4".to_string()),
                (header::CONTENT_LENGTH, len.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            Body::from_stream(chunked(file, len)),
        )
            .into_response(),
        Some(spec) => match parse_byte_range(spec, len) {
            Some((start, end)) => {
                let mut file = file;
                if let Err(e) = file.seek(SeekFrom::Start(start)).await {
                    tracing::error!("Seek failed for {}: {}", path.display(), e);
                    return (StatusCode::INTERNAL_SERVER_ERROR, "Read failure").into_response();
                }
                let span = end - start + 1;
                (
                    StatusCode::PARTIAL_CONTENT,
                    [
                        (header::CONTENT_TYPE, "video/mp4".to_string()),
                        (header::CONTENT_LENGTH, span.to_string()),
                        (header::ACCEPT_RANGES, "bytes".to_string()),
                        (
                            header::CONTENT_RANGE,
                            format!("bytes {start}-{end}/{len}"),
                        ),
                    ],
                    Body::from_stream(chunked(file, span)),
                )
                    .into_response()
            }
            None => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{len}"))],
                Body::empty(),
            )
                .into_response(),
        },
    }
}

async fn open_with_len(path: &std::path::Path) -> std::io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok((file, len))
}

/// Parse a single `bytes=start-end` range (also `start-` and `-suffix`).
/// Multi-range requests are not supported and fall through to None.
fn parse_byte_range(spec: &str, len: u64) -> Option<(u64, u64)> {
    let spec = spec.strip_prefix("bytes=")?;
    if spec.contains(',') || len == 0 {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = match (start.trim(), end.trim()) {
        ("", suffix) => {
            let suffix: u64 = suffix.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            (len.saturating_sub(suffix), len - 1)
        }
        (start, "") => (start.parse().ok()?, len - 1),
        (start, end) => (start.parse().ok()?, end.parse::<u64>().ok()?.min(len - 1)),
    };
    (start <= end && start < len).then_some((start, end))
}

fn chunked(
    file: tokio::fs::File,
    limit: u64,
) -> impl futures_util::Stream<Item = std::io::Result<Vec<u8>>> + Send {
    stream::try_unfold((file, limit), |(mut file, remaining)| async move {
        if remaining == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; remaining.min(READ_CHUNK as u64) as usize];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        let remaining = remaining - n as u64;
        Ok(Some((buf, (file, remaining))))
    })
}

fn internal_error(e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("Upload failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::parse_byte_range;

    #[test]
    fn parses_simple_and_open_ended_ranges() {
        assert_eq!(parse_byte_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_byte_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_byte_range("bytes=-100", 1000), Some((900, 999)));
        // End clamped to file length
        assert_eq!(parse_byte_range("bytes=900-5000", 1000), Some((900, 999)));
    }

    #[test]
    fn rejects_invalid_ranges() {
        assert_eq!(parse_byte_range("bytes=1000-", 1000), None);
        assert_eq!(parse_byte_range("bytes=5-2", 1000), None);
        assert_eq!(parse_byte_range("bytes=0-0,5-9", 1000), None);
        assert_eq!(parse_byte_range("items=0-9", 1000), None);
        assert_eq!(parse_byte_range("bytes=-0", 1000), None);
        assert_eq!(parse_byte_range("bytes=0-", 0), None);
    }
}
