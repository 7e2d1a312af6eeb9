use crate::error::ServiceError;
use crate::transcription::{TranscriptRequest, TranscriptionClient};
use async_trait::async_trait;
use std::sync::Mutex;

/// A fake implementation of the transcription provider for testing.
///
/// The fake lets tests script exactly what each call returns, without any
/// network traffic, and records the requests it received for verification.
///
/// # Example
///
/// ```
/// use vidkeep::transcription::fake::FakeTranscriptionClient;
/// use vidkeep::transcription::TranscriptionClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), vidkeep::error::ServiceError> {
///     let client = FakeTranscriptionClient::new()
///         .with_transcript("hello world");
///
///     let text = client.transcribe("abc.webm", b"HELLOWORLD".to_vec()).await?;
///     assert_eq!(text, "hello world");
///
///     let requests = client.requests.lock().unwrap();
///     assert_eq!(requests[0].filename, "abc.webm");
///     assert_eq!(requests[0].byte_len, 10);
///     Ok(())
/// }
/// ```
pub struct FakeTranscriptionClient {
    responses: Mutex<Vec<Result<String, String>>>,
    // Track requests for verification in tests
    pub requests: Mutex<Vec<TranscriptRequest>>,
}

impl Default for FakeTranscriptionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTranscriptionClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(vec![]),
            requests: Mutex::new(vec![]),
        }
    }

    /// Queue a transcript to be returned by the next call.
    pub fn with_transcript(self, text: &str) -> Self {
        self.responses.lock().unwrap().push(Ok(text.to_string()));
        self
    }

    /// Queue several transcripts to be returned in sequence.
    pub fn with_transcripts(self, texts: Vec<&str>) -> Self {
        {
            let mut responses = self.responses.lock().unwrap();
            for text in texts {
                responses.push(Ok(text.to_string()));
            }
        }
        self
    }

    /// Queue a provider failure for the next call.
    pub fn with_error(self, message: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push(Err(message.to_string()));
        self
    }
}

#[async_trait]
impl TranscriptionClient for FakeTranscriptionClient {
    async fn transcribe(
        &self,
        filename: &str,
        media: Vec<u8>,
    ) -> Result<String, ServiceError> {
        self.requests.lock().unwrap().push(TranscriptRequest {
            filename: filename.to_string(),
            byte_len: media.len(),
        });

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Ok("fake default transcript".to_string());
        }
        responses
            .remove(0)
            .map_err(ServiceError::Transcription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_come_back_in_order(
    ) -> Result<(), ServiceError> {
        let client = FakeTranscriptionClient::new()
            .with_transcripts(vec!["first", "second"]);

        assert_eq!(client.transcribe("a.webm", vec![1]).await?, "first");
        assert_eq!(client.transcribe("a.webm", vec![2]).await?, "second");
        // Exhausted scripts fall back to the default transcript.
        assert_eq!(
            client.transcribe("a.webm", vec![3]).await?,
            "fake default transcript"
        );
        Ok(())
    }

    #[tokio::test]
    async fn scripted_errors_surface_as_transcription_failures() {
        let client = FakeTranscriptionClient::new().with_error("boom");
        let err = client.transcribe("a.webm", vec![]).await.unwrap_err();
        assert!(matches!(err, ServiceError::Transcription(_)));
    }

    #[tokio::test]
    async fn requests_are_tracked() -> Result<(), ServiceError> {
        let client =
            FakeTranscriptionClient::new().with_transcript("hello");
        client.transcribe("clip.mp4", b"12345".to_vec()).await?;

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].filename, "clip.mp4");
        assert_eq!(requests[0].byte_len, 5);
        Ok(())
    }
}
