use crate::error::ServiceError;
use crate::transcription::TranscriptionClient;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::{debug, error, info, instrument};
use url::Url;

/// HTTP client for a Whisper-ASR-style transcription endpoint.
///
/// The endpoint accepts a multipart upload of the media file and returns a
/// JSON body whose `text` field carries the transcript.
pub struct HttpTranscriptionClient {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTranscriptionClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

fn mime_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next() {
        Some("webm") => "video/webm",
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl TranscriptionClient for HttpTranscriptionClient {
    #[instrument(skip(self, media), fields(len = media.len()), err)]
    async fn transcribe(
        &self,
        filename: &str,
        media: Vec<u8>,
    ) -> Result<String, ServiceError> {
        let part = Part::bytes(media)
            .file_name(filename.to_string())
            .mime_str(mime_for(filename))
            .map_err(|e| ServiceError::Transcription(e.to_string()))?;
        let form = Form::new().part("audio_file", part);

        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| ServiceError::Transcription(e.to_string()))?;
        url.query_pairs_mut().append_pair("output", "json");
        let url_string = url.to_string();

        debug!("sending media to transcription provider at {}", url_string);
        let response = self
            .client
            .post(url_string)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                ServiceError::Transcription(format!(
                    "failed to reach provider: {}",
                    e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|e| {
                format!("could not read error response: {}", e)
            });
            error!(
                "provider returned error status {}: {}",
                status, error_text
            );
            return Err(ServiceError::Transcription(format!(
                "provider error ({}): {}",
                status, error_text
            )));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            ServiceError::Transcription(format!(
                "invalid provider response: {}",
                e
            ))
        })?;

        let text = body
            .get("text")
            .and_then(|t| t.as_str())
            .map(|t| t.trim().to_string())
            .ok_or_else(|| {
                ServiceError::Transcription(
                    "provider response missing text field".to_string(),
                )
            })?;

        info!("provider transcribed {} ({} chars)", filename, text.len());
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_is_derived_from_the_extension() {
        assert_eq!(mime_for("abc.webm"), "video/webm");
        assert_eq!(mime_for("abc.mp4"), "video/mp4");
        assert_eq!(mime_for("abc"), "application/octet-stream");
    }
}
