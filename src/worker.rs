use crate::error::ServiceError;
use crate::queue::{self, ClaimedJob, TranscriptionJob};
use crate::videos::{self, TranscriptionUpdate};
use crate::AppState;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, instrument};

// How many jobs one poll may pull from the queue before sleeping.
const CLAIM_BATCH_SIZE: usize = 8;

/// Background consumer loop: claim ready transcription jobs and process
/// them with bounded concurrency until shutdown is requested.
#[instrument(skip(state))]
pub async fn run_worker(state: Arc<AppState>) {
    info!("Starting transcription worker loop");

    // Create a JoinSet to track running tasks
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            _ = state.shutdown_token.cancelled() => {
                info!("Shutting down transcription worker - waiting for in-flight jobs to complete");
                break;
            }
            _ = async {
                match claim_ready_jobs(&state) {
                    Ok(jobs) => {
                        for job in jobs {
                            let state = state.clone();

                            // Acquire semaphore permit before spawning task
                            let permit = state.semaphore.clone().acquire_owned().await.unwrap();

                            tasks.spawn(async move {
                                let _permit = permit; // Keep permit alive for duration of task
                                if let Err(e) = process_job(&state, job).await {
                                    error!("Error processing transcription job: {}", e);
                                }
                            });
                        }
                    }
                    Err(e) => error!("Error claiming transcription jobs: {}", e),
                }
                time::sleep(state.worker_poll_interval).await;
            } => {}
        }
    }

    // Wait for all tasks to complete with a timeout
    let shutdown_timeout = Duration::from_secs(30);
    let shutdown_deadline = tokio::time::Instant::now() + shutdown_timeout;

    while let Some(result) =
        tokio::time::timeout_at(shutdown_deadline, tasks.join_next())
            .await
            .unwrap_or(None)
    {
        if let Err(e) = result {
            error!("Task failed during shutdown: {}", e);
        }
    }

    info!("Transcription worker loop terminated");
}

/// Claim a batch of ready jobs, requeueing any whose consumer died with
/// an expired lease first.
fn claim_ready_jobs(
    state: &AppState,
) -> Result<Vec<ClaimedJob>, ServiceError> {
    let conn = state.videos_db.get()?;
    queue::release_expired(&conn)?;

    let mut jobs = Vec::new();
    while jobs.len() < CLAIM_BATCH_SIZE {
        match queue::claim_next(&conn, queue::DEFAULT_LEASE)? {
            Some(job) => jobs.push(job),
            None => break,
        }
    }
    if !jobs.is_empty() {
        debug!("claimed {} transcription jobs", jobs.len());
    }
    Ok(jobs)
}

/// Sequentially claim and process everything that is currently ready.
/// Returns the number of successfully processed jobs.
pub async fn run_pending_jobs(
    state: &AppState,
) -> Result<usize, ServiceError> {
    let jobs = claim_ready_jobs(state)?;
    let mut processed = 0;
    for job in jobs {
        if process_job(state, job).await.is_ok() {
            processed += 1;
        }
    }
    Ok(processed)
}

/// Process one claimed job end to end: transcribe, write back, settle the
/// queue row.
#[instrument(skip(state, job), fields(job_id = job.job_id, video_id = %job.payload.id), err)]
pub async fn process_job(
    state: &AppState,
    job: ClaimedJob,
) -> Result<(), ServiceError> {
    {
        let mut active_tasks = state.active_tasks.lock().await;
        active_tasks.insert(
            job.payload.id.clone(),
            "Transcription started".to_string(),
        );
    }
    debug!(
        "Processing job {} for video {} (attempt {})",
        job.job_id, job.payload.id, job.attempt
    );

    let started = std::time::Instant::now();
    let result = transcribe_and_store(state, &job.payload).await;

    // Settle the queue row before reporting the outcome
    let settle = {
        let conn = state.videos_db.get()?;
        match &result {
            Ok(()) => queue::ack(&conn, job.job_id),
            Err(ServiceError::NotFound(msg)) => {
                // The record is gone; no number of retries will bring it
                // back.
                queue::fail(&conn, job.job_id, msg)
            }
            Err(e) => queue::nack(&conn, job.job_id, &e.to_string()).map(|_| ()),
        }
    };

    // Always remove the task from active tasks
    {
        let mut active_tasks = state.active_tasks.lock().await;
        active_tasks.remove(&job.payload.id);
    }
    settle?;

    match result {
        Ok(()) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            state.stats.processed_count.fetch_add(1, Ordering::Relaxed);
            state
                .stats
                .total_processing_time_ms
                .fetch_add(duration_ms, Ordering::Relaxed);
            info!(
                "Successfully transcribed video {} in {}ms",
                job.payload.id, duration_ms
            );
            Ok(())
        }
        Err(e) => {
            error!(
                "Error transcribing video {}: {}",
                job.payload.id, e
            );
            state.stats.error_count.fetch_add(1, Ordering::Relaxed);
            Err(e)
        }
    }
}

/// Read the blob, call the provider under the configured timeout and set
/// the transcription once.
async fn transcribe_and_store(
    state: &AppState,
    job: &TranscriptionJob,
) -> Result<(), ServiceError> {
    let record = {
        let conn = state.videos_db.get()?;
        videos::find_by_id(&conn, &job.id)?
    }
    .ok_or_else(|| {
        ServiceError::NotFound(format!("video {} no longer exists", job.id))
    })?;

    let media = state.blobs.read(&record.filename).await?;
    debug!(
        "Sending {} bytes of {} to the transcription provider",
        media.len(),
        record.filename
    );

    let text = time::timeout(
        state.transcription_timeout,
        state
            .transcription_client
            .transcribe(&record.filename, media),
    )
    .await
    .map_err(|_| {
        ServiceError::Transcription(format!(
            "provider call timed out after {}s",
            state.transcription_timeout.as_secs()
        ))
    })??;

    if text.trim().is_empty() {
        return Err(ServiceError::Transcription(
            "provider returned an empty transcript".to_string(),
        ));
    }

    let conn = state.videos_db.get()?;
    match videos::update_transcription(&conn, &job.id, &text)? {
        TranscriptionUpdate::Applied => Ok(()),
        TranscriptionUpdate::AlreadySet => {
            // Redelivered job; the earlier delivery already wrote its
            // transcript and that one wins.
            info!(
                "Transcription already present for video {}, leaving it unchanged",
                job.id
            );
            Ok(())
        }
        TranscriptionUpdate::NotFound => Err(ServiceError::NotFound(format!(
            "video {} no longer exists",
            job.id
        ))),
    }
}
