//! HTTP-backed [`TaskExecutor`]: downloads a URL and keeps the body in memory
//! when its media type matches.

use super::{
    errors::TaskError,
    executor::TaskExecutor,
};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;


/// Downloaded artifact, cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub url: String,
    pub content_type: String,
    pub bytes: Arc<[u8]>,
}

pub struct HttpFetcher {
    client: reqwest::Client,
    media: String,
}

impl HttpFetcher {
    /// Accepts `image/*` responses only.
    pub fn new() -> Self {
        Self::for_media("image")
    }

    /// Accepts responses whose top-level media type is `media` (e.g. `"text"`).
    pub fn for_media(media: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), media)
    }

    pub fn with_client(client: reqwest::Client, media: impl Into<String>) -> Self {
        Self {
            client,
            media: media.into(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// `true` when `content_type` is `<media>/<subtype>` with a non-empty subtype.
/// Parameters such as `; charset=utf-8` are ignored.
pub fn matches_media_type(content_type: &str, media: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    match essence.split_once('/') {
        Some((top, subtype)) => top.eq_ignore_ascii_case(media) && !subtype.is_empty(),
        None => false,
    }
}

#[async_trait]
impl TaskExecutor for HttpFetcher {
    type Task = String;
    type Handle = Blob;

    async fn execute(&self, url: &String) -> Result<Blob, TaskError> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TaskError::Failed(e.to_string()))?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        if !matches_media_type(&content_type, &self.media) {
            return Err(TaskError::Rejected(format!(
                "{url}: expected {}/*, got `{content_type}`",
                self.media
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TaskError::Failed(e.to_string()))?;

        Ok(Blob {
            url: url.clone(),
            content_type,
            bytes: Arc::from(body.as_ref()),
        })
    }
}
