use crate::error::ServiceError;
use crate::queue;
use crate::videos::{self, NewVideo, VideoRecord};
use crate::AppState;
use serde::Serialize;
use std::path::Path;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of starting a recording session.
#[derive(Debug, Serialize)]
pub struct StartedRecording {
    pub id: String,
    pub filename: String,
}

/// Public projection of a record, as returned by the list and get
/// endpoints.
#[derive(Debug, Serialize)]
pub struct VideoSummary {
    pub title: Option<String>,
    #[serde(rename = "fileUrl")]
    pub file_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
}

/// A file received through the upload endpoints.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub original_name: Option<String>,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

fn summary_of(state: &AppState, record: &VideoRecord) -> VideoSummary {
    VideoSummary {
        title: record.title.clone(),
        file_url: state.file_url(&record.filename),
        transcription: record.transcription.clone(),
    }
}

/// Begin a new recording session: a zero-length blob under a fresh
/// generated filename plus a record carrying only that filename.
///
/// Blob and record are created together; if the record insert fails the
/// blob is removed again so neither an orphaned blob nor a blob-less
/// record survives.
#[instrument(skip(state), err)]
pub async fn start_recording(
    state: &AppState,
) -> Result<StartedRecording, ServiceError> {
    let filename = format!("{}.webm", Uuid::new_v4());
    state.blobs.create_empty(&filename).await?;

    let conn = state.videos_db.get()?;
    let id = match videos::insert_recording(&conn, &filename) {
        Ok(id) => id,
        Err(e) => {
            // Compensating cleanup: the blob exists but the record does
            // not. Removal failure leaves an orphan, which we can only
            // log.
            if let Err(cleanup) = state.blobs.remove(&filename).await {
                warn!(
                    "failed to remove orphaned blob {}: {}",
                    filename, cleanup
                );
            }
            return Err(e);
        }
    };

    info!("started recording {} as {}", id, filename);
    Ok(StartedRecording { id, filename })
}

/// Append a chunk of recording bytes to the blob behind `id`.
///
/// Chunks are written in arrival order; appends for the same id are
/// serialized here, but ordering across requests remains the caller's
/// responsibility.
#[instrument(skip(state, chunk), fields(len = chunk.len()), err)]
pub async fn append_chunk(
    state: &AppState,
    id: &str,
    chunk: &[u8],
) -> Result<(), ServiceError> {
    let record = {
        let conn = state.videos_db.get()?;
        videos::find_by_id(&conn, id)?
    }
    .ok_or_else(|| ServiceError::NotFound("Video not found".to_string()))?;

    let lock = state.append_lock(id).await;
    let _guard = lock.lock().await;
    state.blobs.append(&record.filename, chunk).await?;
    Ok(())
}

/// Finish a recording: publish a transcription job for it.
///
/// Does not wait for transcription. Safe to call again if the publish
/// fails; the worker tolerates duplicate deliveries.
#[instrument(skip(state), err)]
pub async fn end_recording(
    state: &AppState,
    id: &str,
) -> Result<(), ServiceError> {
    let conn = state.videos_db.get()?;
    let record = videos::find_by_id(&conn, id)?
        .ok_or_else(|| ServiceError::NotFound("Video not found".to_string()))?;

    let job = queue::TranscriptionJob::new(&record.id, &record.filename);
    queue::enqueue(&conn, &job)?;
    info!("recording {} ended, transcription job published", id);
    Ok(())
}

fn generated_filename(original_name: Option<&str>) -> String {
    let extension = original_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default();
    format!("{}{}", Uuid::new_v4(), extension)
}

fn validate_video(file: &UploadedFile) -> Result<(), ServiceError> {
    if !file.content_type.starts_with("video/") {
        return Err(ServiceError::Validation(
            "Only video files are allowed".to_string(),
        ));
    }
    Ok(())
}

/// Store one uploaded video and return its public URL.
///
/// The MIME check runs before any blob or record is created.
#[instrument(skip(state, file), fields(name = ?file.original_name), err)]
pub async fn upload_video(
    state: &AppState,
    file: UploadedFile,
    title: Option<String>,
) -> Result<String, ServiceError> {
    validate_video(&file)?;

    let filename = generated_filename(file.original_name.as_deref());
    let size = file.bytes.len() as i64;
    state.blobs.store(&filename, &file.bytes).await?;

    let conn = state.videos_db.get()?;
    let insert = videos::insert(
        &conn,
        NewVideo {
            original_name: file.original_name,
            mime_type: Some(file.content_type),
            filename: filename.clone(),
            size: Some(size),
            title,
        },
    );
    let id = match insert {
        Ok(id) => id,
        Err(e) => {
            if let Err(cleanup) = state.blobs.remove(&filename).await {
                warn!(
                    "failed to remove orphaned blob {}: {}",
                    filename, cleanup
                );
            }
            return Err(e);
        }
    };

    info!("uploaded video {} as {} ({} bytes)", id, filename, size);
    Ok(state.file_url(&filename))
}

/// Store a batch of uploaded videos and return their public URLs.
///
/// Every file is validated before the first blob is written, so a bad
/// MIME type in the batch rejects the whole request without side effects.
pub async fn upload_videos(
    state: &AppState,
    files: Vec<UploadedFile>,
) -> Result<Vec<String>, ServiceError> {
    for file in &files {
        validate_video(file)?;
    }

    let mut urls = Vec::with_capacity(files.len());
    for file in files {
        urls.push(upload_video(state, file, None).await?);
    }
    Ok(urls)
}

/// Look up one record by id.
pub async fn get_video(
    state: &AppState,
    id: &str,
) -> Result<VideoSummary, ServiceError> {
    let conn = state.videos_db.get()?;
    let record = videos::find_by_id(&conn, id)?
        .ok_or_else(|| ServiceError::NotFound("Video not found".to_string()))?;
    Ok(summary_of(state, &record))
}

/// All records in insertion order.
pub async fn list_videos(
    state: &AppState,
) -> Result<Vec<VideoSummary>, ServiceError> {
    let conn = state.videos_db.get()?;
    let records = videos::find_all(&conn)?;
    Ok(records
        .iter()
        .map(|record| summary_of(state, record))
        .collect())
}
