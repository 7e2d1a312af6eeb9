use crate::blobs::BlobStore;
use crate::transcription::real::HttpTranscriptionClient;
use crate::transcription::TranscriptionClient;
use anyhow::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub mod app;
pub mod blobs;
pub mod error;
pub mod queue;
pub mod recording;
pub mod transcription;
pub mod videos;
pub mod worker;

pub mod test_utils;

// ServiceStats struct for both main app and testing
#[derive(Debug)]
pub struct ServiceStats {
    pub processed_count: AtomicU64,
    pub error_count: AtomicU64,
    pub total_processing_time_ms: AtomicU64,
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceStats {
    pub fn new() -> Self {
        Self {
            processed_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_processing_time_ms: AtomicU64::new(0),
        }
    }
}

// Define the AppState struct for both main app and testing
pub struct AppState {
    pub videos_db: Pool<SqliteConnectionManager>,
    pub blobs: BlobStore,
    pub base_url: String,
    pub stats: ServiceStats,
    pub active_tasks: Arc<Mutex<HashMap<String, String>>>,
    pub semaphore: Arc<tokio::sync::Semaphore>,
    pub transcription_client: Arc<dyn TranscriptionClient>,
    pub transcription_timeout: Duration,
    pub worker_poll_interval: Duration,
    // Per-recording append serialization; chunk order across requests is
    // still the caller's contract.
    pub append_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    pub shutdown_token: CancellationToken,
    // Add fields to track temp files
    #[allow(dead_code)]
    temp_db_file: Option<tempfile::NamedTempFile>,
    #[allow(dead_code)]
    temp_storage_dir: Option<tempfile::TempDir>,
}

impl AppState {
    pub fn new_for_testing() -> Self {
        Self::new_for_testing_with_client(Arc::new(
            transcription::fake::FakeTranscriptionClient::new(),
        ))
    }

    // Create a new AppState for testing with minimal configuration and a
    // scripted transcription client
    pub fn new_for_testing_with_client(
        transcription_client: Arc<dyn TranscriptionClient>,
    ) -> Self {
        let temp_db_file = tempfile::NamedTempFile::new()
            .expect("Failed to create temporary videos database file");
        let temp_storage_dir = tempfile::tempdir()
            .expect("Failed to create temporary storage directory");

        let db_path = temp_db_file
            .path()
            .to_str()
            .expect("Failed to get videos temp file path")
            .to_string();

        let manager = SqliteConnectionManager::file(&db_path);
        let videos_pool =
            Pool::new(manager).expect("Failed to create videos pool");

        let mut conn = videos_pool.get().expect("Failed to get connection");
        init_videos_db(&mut conn)
            .expect("Failed to initialize videos database");
        drop(conn);

        let blobs = BlobStore::new(temp_storage_dir.path());

        Self {
            videos_db: videos_pool,
            blobs,
            base_url: "http://localhost:3000".to_string(),
            stats: ServiceStats::new(),
            active_tasks: Arc::new(Mutex::new(HashMap::new())),
            semaphore: Arc::new(tokio::sync::Semaphore::new(3)),
            transcription_client,
            transcription_timeout: Duration::from_secs(30),
            worker_poll_interval: Duration::from_secs(1),
            append_locks: Arc::new(Mutex::new(HashMap::new())),
            shutdown_token: CancellationToken::new(),
            // Store temp handles so they're cleaned up when AppState drops
            temp_db_file: Some(temp_db_file),
            temp_storage_dir: Some(temp_storage_dir),
        }
    }

    /// Public URL for a stored blob.
    pub fn file_url(&self, filename: &str) -> String {
        format!(
            "{}/recordings/{}",
            self.base_url.trim_end_matches('/'),
            filename
        )
    }

    /// Lock guarding appends for one recording id.
    pub async fn append_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// Create a config struct to hold AppState configuration
pub struct AppConfig {
    pub videos_pool: Pool<SqliteConnectionManager>,
    pub storage_dir: PathBuf,
    pub base_url: String,
    pub whisper_url: String,
    pub max_concurrent_tasks: usize,
    pub transcription_timeout_secs: u64,
    pub worker_poll_interval_secs: u64,
}

// Function to create AppState from parameters
pub fn create_app_state(config: AppConfig) -> Arc<AppState> {
    let transcription_client: Arc<dyn TranscriptionClient> =
        Arc::new(HttpTranscriptionClient::new(config.whisper_url));

    Arc::new(AppState {
        videos_db: config.videos_pool,
        blobs: BlobStore::new(config.storage_dir),
        base_url: config.base_url,
        stats: ServiceStats::new(),
        active_tasks: Arc::new(Mutex::new(HashMap::new())),
        semaphore: Arc::new(tokio::sync::Semaphore::new(
            config.max_concurrent_tasks,
        )),
        transcription_client,
        transcription_timeout: Duration::from_secs(
            config.transcription_timeout_secs,
        ),
        worker_poll_interval: Duration::from_secs(
            config.worker_poll_interval_secs,
        ),
        append_locks: Arc::new(Mutex::new(HashMap::new())),
        shutdown_token: CancellationToken::new(),
        temp_db_file: None,
        temp_storage_dir: None,
    })
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            video_id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            original_name TEXT,
            mime_type TEXT,
            filename TEXT NOT NULL UNIQUE,
            size INTEGER,
            title TEXT,
            transcription TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_videos_created
            ON videos(created_at);

        CREATE TABLE IF NOT EXISTS transcription_jobs (
            job_id INTEGER PRIMARY KEY AUTOINCREMENT,
            video_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER,
            lease_expires_at INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transcription_jobs_status_created
            ON transcription_jobs(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_transcription_jobs_video_status
            ON transcription_jobs(video_id, status);
        "#,
    )?;
    Ok(())
}

// Database initialization
#[instrument]
pub fn init_videos_db(conn: &mut Connection) -> Result<()> {
    info!("Initializing videos database");
    conn.pragma_update(None, "journal_mode", "WAL")?;
    ensure_schema(conn)?;
    Ok(())
}

#[cfg(test)]
mod schema_tests {
    use super::init_videos_db;
    use anyhow::Result;
    use rusqlite::{Connection, OptionalExtension};

    fn has_table(conn: &Connection, name: &str) -> Result<bool> {
        Ok(conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    fn has_index(conn: &Connection, name: &str) -> Result<bool> {
        Ok(conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?1",
                [name],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    #[test]
    fn schema_applies_on_fresh_database() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;

        init_videos_db(&mut conn)?;

        assert!(has_table(&conn, "videos")?);
        assert!(has_table(&conn, "transcription_jobs")?);
        assert!(has_index(&conn, "idx_videos_created")?);
        assert!(has_index(&conn, "idx_transcription_jobs_status_created")?);
        assert!(has_index(&conn, "idx_transcription_jobs_video_status")?);

        Ok(())
    }

    #[test]
    fn schema_init_is_idempotent() -> Result<()> {
        let mut conn = Connection::open_in_memory()?;

        init_videos_db(&mut conn)?;
        init_videos_db(&mut conn)?;

        assert!(has_table(&conn, "videos")?);
        assert!(has_table(&conn, "transcription_jobs")?);

        Ok(())
    }
}

#[cfg(test)]
mod app_state_tests {
    use super::*;

    #[test]
    fn file_url_joins_base_and_filename() {
        let state = AppState::new_for_testing();
        assert_eq!(
            state.file_url("abc.webm"),
            "http://localhost:3000/recordings/abc.webm"
        );
    }

    #[test]
    fn create_app_state_uses_config() {
        let temp_file =
            tempfile::NamedTempFile::new().expect("temp sqlite file");
        let manager = SqliteConnectionManager::file(
            temp_file.path().to_str().expect("temp path"),
        );
        let pool = Pool::new(manager).expect("pool");
        let storage = tempfile::tempdir().expect("storage dir");

        let state = create_app_state(AppConfig {
            videos_pool: pool,
            storage_dir: storage.path().to_path_buf(),
            base_url: "http://media.example.com/".to_string(),
            whisper_url: "http://localhost:9000/asr".to_string(),
            max_concurrent_tasks: 2,
            transcription_timeout_secs: 120,
            worker_poll_interval_secs: 5,
        });

        assert_eq!(
            state.file_url("x.mp4"),
            "http://media.example.com/recordings/x.mp4"
        );
        assert_eq!(state.transcription_timeout, Duration::from_secs(120));
        assert_eq!(state.semaphore.available_permits(), 2);
    }
}
