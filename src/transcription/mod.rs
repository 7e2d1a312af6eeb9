pub mod fake;
pub mod real;

use crate::error::ServiceError;
use async_trait::async_trait;

/// What the worker hands to the provider for one job.
#[derive(Debug, Clone)]
pub struct TranscriptRequest {
    pub filename: String,
    pub byte_len: usize,
}

/// A trait that abstracts the external transcription provider.
///
/// The provider is an opaque dependency: media bytes in, transcript text
/// out. Having it behind a trait lets the worker run against the real HTTP
/// client in production and a scripted fake in tests.
///
/// Implementation notes:
/// - Uses `async-trait` to enable async methods in traits
/// - Implementations must be cheap to share behind an `Arc`
#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    /// Transcribe the audio track of the given media bytes.
    ///
    /// # Arguments
    /// * `filename` - the blob name, used for content-type hints and logs
    /// * `media` - the complete media file contents
    ///
    /// # Returns
    /// The transcript text, or a `Transcription` error.
    async fn transcribe(
        &self,
        filename: &str,
        media: Vec<u8>,
    ) -> Result<String, ServiceError>;
}
