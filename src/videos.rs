use crate::error::ServiceError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata record for one video or recording.
///
/// `transcription` is the only field that changes after creation, and only
/// from absent to present.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VideoRecord {
    pub id: String,
    pub created_at: i64,
    pub original_name: Option<String>,
    pub mime_type: Option<String>,
    pub filename: String,
    pub size: Option<i64>,
    pub title: Option<String>,
    pub transcription: Option<String>,
}

/// Fields supplied by the upload path; recordings start with only a
/// filename (see [`insert_recording`]).
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub original_name: Option<String>,
    pub mime_type: Option<String>,
    pub filename: String,
    pub size: Option<i64>,
    pub title: Option<String>,
}

/// Outcome of the guarded transcription update.
#[derive(Debug, PartialEq, Eq)]
pub enum TranscriptionUpdate {
    Applied,
    AlreadySet,
    NotFound,
}

const RECORD_COLUMNS: &str = "video_id, created_at, original_name, \
     mime_type, filename, size, title, transcription";

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VideoRecord> {
    Ok(VideoRecord {
        id: row.get(0)?,
        created_at: row.get(1)?,
        original_name: row.get(2)?,
        mime_type: row.get(3)?,
        filename: row.get(4)?,
        size: row.get(5)?,
        title: row.get(6)?,
        transcription: row.get(7)?,
    })
}

/// Insert a fully-populated record and return its generated id.
pub fn insert(
    conn: &Connection,
    video: NewVideo,
) -> Result<String, ServiceError> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO videos (
            video_id, created_at, original_name, mime_type,
            filename, size, title
        ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            now,
            video.original_name,
            video.mime_type,
            video.filename,
            video.size,
            video.title,
        ],
    )?;
    Ok(id)
}

/// Insert a recording record with only the filename populated.
pub fn insert_recording(
    conn: &Connection,
    filename: &str,
) -> Result<String, ServiceError> {
    insert(
        conn,
        NewVideo {
            original_name: None,
            mime_type: None,
            filename: filename.to_string(),
            size: None,
            title: None,
        },
    )
}

pub fn find_by_id(
    conn: &Connection,
    id: &str,
) -> Result<Option<VideoRecord>, ServiceError> {
    let record = conn
        .query_row(
            &format!("SELECT {} FROM videos WHERE video_id = ?", RECORD_COLUMNS),
            params![id],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

pub fn find_by_filename(
    conn: &Connection,
    filename: &str,
) -> Result<Option<VideoRecord>, ServiceError> {
    let record = conn
        .query_row(
            &format!("SELECT {} FROM videos WHERE filename = ?", RECORD_COLUMNS),
            params![filename],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Set the transcription text for a record, once.
///
/// The update is guarded on `transcription IS NULL` so a redelivered job can
/// never replace or erase text written by an earlier delivery.
pub fn update_transcription(
    conn: &Connection,
    id: &str,
    text: &str,
) -> Result<TranscriptionUpdate, ServiceError> {
    let updated = conn.execute(
        "UPDATE videos SET transcription = ?
         WHERE video_id = ? AND transcription IS NULL",
        params![text, id],
    )?;
    if updated > 0 {
        return Ok(TranscriptionUpdate::Applied);
    }
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM videos WHERE video_id = ?",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        Ok(TranscriptionUpdate::AlreadySet)
    } else {
        Ok(TranscriptionUpdate::NotFound)
    }
}

/// All records in insertion order (`created_at`, then rowid to break ties
/// within the same second).
pub fn find_all(conn: &Connection) -> Result<Vec<VideoRecord>, ServiceError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM videos ORDER BY created_at ASC, rowid ASC",
        RECORD_COLUMNS
    ))?;
    let rows = stmt.query_map([], record_from_row)?;
    let records: Result<Vec<_>, _> = rows.collect();
    Ok(records?)
}
