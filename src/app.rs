use crate::error::ServiceError;
use crate::recording::{self, UploadedFile};
use crate::videos;
use crate::worker;
use crate::AppState;
use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose;
use base64::Engine;
use clap::Parser;
use fs2::FileExt as Fs2FileExt;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::SeekFrom;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, BufReader};
use tokio_util::io::ReaderStream;
use tower_http::compression::predicate::{
    NotForContentType, Predicate, SizeAbove,
};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{prelude::*, Registry};
use tracing_tree::HierarchicalLayer;

// Uploads larger than this are rejected at the body layer.
const MAX_UPLOAD_BYTES: usize = 250 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct StatusResponse {
    pending_jobs: i64,
    active_tasks: HashMap<String, String>,
    stats: StatusStats,
}

#[derive(Debug, Serialize)]
struct StatusStats {
    processed_count: u64,
    error_count: u64,
    total_processing_time_ms: u64,
    average_processing_time_ms: f64,
}

// Health check endpoint
#[instrument]
pub async fn health_check() -> &'static str {
    debug!("Health check requested");
    "OK"
}

#[instrument(level = "debug")]
fn check_file_is_writable(path: &str, file_type: &str) -> Result<()> {
    let file_path = std::path::Path::new(path);
    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file_exists = file_path.exists();
    let file = if file_exists {
        std::fs::OpenOptions::new().write(true).open(file_path)
    } else {
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(file_path)
    };
    if let Err(e) = file {
        return Err(anyhow::anyhow!(
            "Cannot write to {} at '{}': {}. Please check file permissions.",
            file_type,
            path,
            e
        ));
    }

    Ok(())
}

/// Pull the `file` part (and optional `title`) out of a single-upload
/// multipart body. The MIME check happens as soon as the part headers are
/// seen, before the body bytes are buffered.
async fn read_upload_field(
    field: axum::extract::multipart::Field<'_>,
) -> Result<UploadedFile, ServiceError> {
    let content_type = field
        .content_type()
        .map(str::to_string)
        .ok_or_else(|| {
            ServiceError::Validation(
                "file part is missing a content type".to_string(),
            )
        })?;
    if !content_type.starts_with("video/") {
        return Err(ServiceError::Validation(
            "Only video files are allowed".to_string(),
        ));
    }
    let original_name = field.file_name().map(str::to_string);
    let bytes = field
        .bytes()
        .await
        .map_err(|e| {
            ServiceError::Validation(format!("invalid multipart body: {}", e))
        })?
        .to_vec();
    Ok(UploadedFile {
        original_name,
        content_type,
        bytes,
    })
}

#[axum::debug_handler]
async fn upload_video(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ServiceError> {
    let mut file: Option<UploadedFile> = None;
    let mut title: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ServiceError::Validation(format!("invalid multipart body: {}", e))
    })? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => file = Some(read_upload_field(field).await?),
            Some("title") => {
                title = Some(field.text().await.map_err(|e| {
                    ServiceError::Validation(format!(
                        "invalid title field: {}",
                        e
                    ))
                })?);
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| {
        ServiceError::Validation("missing file field".to_string())
    })?;
    let file_url = recording::upload_video(&state, file, title).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "File uploaded successfully",
            "fileUrl": file_url
        })),
    ))
}

#[axum::debug_handler]
async fn upload_videos(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<String>>), ServiceError> {
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ServiceError::Validation(format!("invalid multipart body: {}", e))
    })? {
        if field.name() == Some("files") {
            files.push(read_upload_field(field).await?);
        }
    }

    if files.is_empty() {
        return Err(ServiceError::Validation(
            "missing files field".to_string(),
        ));
    }

    let urls = recording::upload_videos(&state, files).await?;
    Ok((StatusCode::CREATED, Json(urls)))
}

#[axum::debug_handler]
async fn get_video(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<recording::VideoSummary>, ServiceError> {
    let summary = recording::get_video(&state, &id).await?;
    Ok(Json(summary))
}

#[axum::debug_handler]
async fn get_videos(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<recording::VideoSummary>>, ServiceError> {
    let listed = recording::list_videos(&state).await?;
    Ok(Json(listed))
}

#[axum::debug_handler]
async fn start_recording(
    State(state): State<Arc<AppState>>,
) -> Result<Json<recording::StartedRecording>, ServiceError> {
    let started = recording::start_recording(&state).await?;
    Ok(Json(started))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendChunkRequest {
    chunk_data: String,
}

#[axum::debug_handler]
async fn append_chunk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<AppendChunkRequest>,
) -> Result<Json<Value>, ServiceError> {
    let chunk =
        general_purpose::STANDARD.decode(&request.chunk_data).map_err(
            |e| {
                ServiceError::Validation(format!(
                    "chunkData is not valid base64: {}",
                    e
                ))
            },
        )?;

    recording::append_chunk(&state, &id, &chunk).await?;
    Ok(Json(json!({ "message": "Chunk appended successfully" })))
}

#[axum::debug_handler]
async fn end_recording(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    recording::end_recording(&state, &id).await?;
    Ok(Json(json!({
        "message": "Recording finished and transcription started"
    })))
}

static RANGE_RE: OnceLock<Regex> = OnceLock::new();

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next() {
        Some("webm") => "video/webm",
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

#[axum::debug_handler]
async fn serve_recording(
    Path(filename): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ServiceError> {
    // Blobs are only served for known records; the record-iff-blob
    // invariant means anything else is a 404, including traversal
    // attempts that could never match a generated filename.
    let record = {
        let conn = state.videos_db.get()?;
        videos::find_by_filename(&conn, &filename)?
    }
    .ok_or_else(|| ServiceError::NotFound("Video not found".to_string()))?;

    let blob_path = state
        .blobs
        .blob_path(&filename)
        .map_err(|_| ServiceError::NotFound("Video not found".to_string()))?;

    let content_type = record
        .mime_type
        .unwrap_or_else(|| content_type_for(&filename).to_string());

    const CHUNK_SIZE: u64 = 1024 * 1024; // 1MB chunks

    let file = File::open(&blob_path).map_err(|e| {
        error!("Failed to open blob at {}: {}", blob_path.display(), e);
        ServiceError::NotFound("Video file not found".to_string())
    })?;

    let file_size = file
        .metadata()
        .map_err(|e| {
            ServiceError::Storage(format!("Failed to get file size: {}", e))
        })?
        .len();

    // A freshly started recording has no bytes yet; serve it as-is.
    if file_size == 0 {
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, 0)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(axum::body::Body::empty())
            .map_err(|e| ServiceError::Storage(e.to_string()))?;
        return Ok(response);
    }

    // Parse range header if present
    let (start, end) = if let Some(range) = headers.get(header::RANGE) {
        let range_str = range.to_str().map_err(|e| {
            ServiceError::Validation(format!("Invalid range header: {}", e))
        })?;

        // Parse range header of the form "bytes=start-end"
        let captures = RANGE_RE
            .get_or_init(|| {
                Regex::new(r"bytes=(\d*)-(\d*)").expect("valid range regex")
            })
            .captures(range_str)
            .ok_or_else(|| {
                ServiceError::Validation("Invalid range format".to_string())
            })?;

        let start = captures
            .get(1)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0);
        let end = captures
            .get(2)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(file_size - 1)
            .min(file_size - 1);

        if start > end {
            let response = Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes */{}", file_size),
                )
                .body(axum::body::Body::empty())
                .map_err(|e| ServiceError::Storage(e.to_string()))?;
            return Ok(response);
        }

        (start, end)
    } else {
        (0_u64, file_size - 1)
    };

    let content_length = end - start + 1;

    // Seek to the start position
    let mut file = tokio::fs::File::from_std(file);
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await.map_err(|e| {
            ServiceError::Storage(format!("Failed to seek: {}", e))
        })?;
    }

    let buf_reader = BufReader::with_capacity(CHUNK_SIZE as usize, file);
    let limited_reader =
        tokio::io::AsyncReadExt::take(buf_reader, content_length);
    let stream =
        ReaderStream::with_capacity(limited_reader, CHUNK_SIZE as usize);

    let response = Response::builder()
        .status(if start == 0 && end == file_size - 1 {
            StatusCode::OK
        } else {
            StatusCode::PARTIAL_CONTENT
        })
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, file_size),
        )
        .body(axum::body::Body::from_stream(stream))
        .map_err(|e| ServiceError::Storage(e.to_string()))?;

    Ok(response)
}

#[axum::debug_handler]
async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, ServiceError> {
    let active_tasks = state.active_tasks.lock().await.clone();
    let pending_jobs = {
        let conn = state.videos_db.get()?;
        crate::queue::pending_count(&conn)?
    };

    let processed_count = state.stats.processed_count.load(Ordering::Relaxed);
    let total_time =
        state.stats.total_processing_time_ms.load(Ordering::Relaxed);
    let average_time = if processed_count > 0 {
        total_time as f64 / processed_count as f64
    } else {
        0.0
    };

    let status = StatusResponse {
        pending_jobs,
        active_tasks,
        stats: StatusStats {
            processed_count,
            error_count: state.stats.error_count.load(Ordering::Relaxed),
            total_processing_time_ms: total_time,
            average_processing_time_ms: average_time,
        },
    };

    Ok(Json(status))
}

pub fn routes(state: Arc<AppState>) -> Router {
    let predicate = SizeAbove::new(32)
        // still don't compress gRPC
        .and(NotForContentType::GRPC)
        // still don't compress images
        .and(NotForContentType::IMAGES)
        // video payloads are already compressed
        .and(NotForContentType::const_new("video/mp4"))
        .and(NotForContentType::const_new("video/webm"));

    let compression_layer = CompressionLayer::new()
        .br(true)
        .deflate(true)
        .gzip(true)
        .zstd(true)
        .compress_when(predicate);

    Router::new()
        .route("/health", get(health_check))
        .route("/video", get(get_videos).post(upload_video))
        .route("/video/uploads", post(upload_videos))
        .route("/video/{id}", get(get_video))
        .route("/start-recording", post(start_recording))
        .route("/append-chunk/{id}", post(append_chunk))
        .route("/end-recording/{id}", post(end_recording))
        .route("/recordings/{filename}", get(serve_recording))
        .route("/api/status", get(get_status))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(compression_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn create_app_lock() -> Result<File> {
    let lock_file = File::create("/tmp/vidkeep.lock")?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("Another instance is already running"))?;
    Ok(lock_file)
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Public base URL used to build file links; defaults to the listen
    /// address
    #[arg(long, env = "APP_URL")]
    base_url: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Path to the videos database
    #[arg(long, default_value = "data/vidkeep.db")]
    videos_db: String,

    /// Directory holding uploaded and recorded video files
    #[arg(long, env = "STORAGE_DIR", default_value = "data/uploads")]
    storage_dir: String,

    /// URL of the transcription provider endpoint
    #[arg(
        long,
        env = "WHISPER_URL",
        default_value = "http://localhost:9000/asr"
    )]
    whisper_url: String,

    /// Maximum concurrent transcription tasks
    #[arg(long, default_value_t = 3)]
    max_concurrent_tasks: usize,

    // Should create lock file to prevent multiple instances from running
    #[arg(long, default_value_t = true)]
    create_lock_file: bool,

    /// Enable background transcription worker (enabled by default)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_worker: bool,

    /// Interval in seconds between queue polls
    #[arg(long, default_value_t = 2)]
    worker_poll_interval: u64,

    /// Timeout in seconds for one provider transcription call
    #[arg(long, default_value_t = 300)]
    transcription_timeout: u64,
}

pub async fn serve() -> Result<()> {
    // Initialize logging with tracing
    let subscriber = Registry::default()
        .with(
            HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(true),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        );

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    // Parse command line arguments
    let args = Args::parse();

    if args.create_lock_file && args.enable_worker {
        let _lock_file = create_app_lock().map_err(|e| {
            error!("Failed to create lock file: {}", e);
            e
        })?;
    }

    info!("Starting vidkeep service");

    // Make sure the storage area exists before anything writes into it
    std::fs::create_dir_all(&args.storage_dir)?;

    // Check if the videos database is writable
    info!("Checking if videos database is writable");
    check_file_is_writable(&args.videos_db, "videos database")?;

    info!("Creating database connection pool");
    let videos_manager = SqliteConnectionManager::file(&args.videos_db);
    let videos_pool = Pool::new(videos_manager)?;

    // Initialize database schema
    {
        let mut conn = videos_pool.get()?;
        crate::init_videos_db(&mut conn)?;
    }

    let base_url = args
        .base_url
        .unwrap_or_else(|| format!("http://localhost:{}", args.port));

    info!("Using transcription provider at {}", args.whisper_url);

    let state = crate::create_app_state(crate::AppConfig {
        videos_pool,
        storage_dir: args.storage_dir.into(),
        base_url,
        whisper_url: args.whisper_url,
        max_concurrent_tasks: args.max_concurrent_tasks,
        transcription_timeout_secs: args.transcription_timeout,
        worker_poll_interval_secs: args.worker_poll_interval,
    });

    // Set up ctrl-c handler
    let ctrl_c_state = state.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL-C, initiating shutdown");
            ctrl_c_state.shutdown_token.cancel();
        }
    });

    // Start background worker only if enabled
    let worker_handle = if args.enable_worker {
        info!("Starting background transcription worker");
        let worker_state = state.clone();
        Some(tokio::spawn(async move {
            worker::run_worker(worker_state).await;
        }))
    } else {
        info!("Background transcription worker disabled");
        None
    };

    // Start web server
    let app = routes(state.clone());
    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server running on http://{}", addr);

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = state.shutdown_token.cancelled() => {
            info!("Shutdown signal received, waiting for background tasks to complete...");
        }
    }

    // Give the worker a bounded drain window
    if let Some(handle) = worker_handle {
        state.shutdown_token.cancel();
        match tokio::time::timeout(Duration::from_secs(30), handle).await {
            Ok(_) => info!("Background worker completed gracefully"),
            Err(_) => {
                warn!("Background worker timed out during shutdown")
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
