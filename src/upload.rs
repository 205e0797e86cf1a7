use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::{BuildConfig, PostSpec};
use crate::errors::RunnerError;
use crate::logs::LogSink;

/// Attempt ceiling for the end-of-run log deliveries, which run outside
/// the configured retry budget.
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// One failed delivery attempt, rendered into the private log before the
/// next try.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("post error code={code} text={text}")]
    Status { code: u16, text: String },

    #[error("post failure: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Could not post to url {0}")]
    Exhausted(String),
}

/// Delivers one artifact to a pre-signed destination.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn post_file(
        &self,
        spec: &PostSpec,
        body: Vec<u8>,
        file_name: &str,
    ) -> Result<(), AttemptError>;
}

/// Post a file to its signed destination, re-reading it for every attempt.
/// Attempt failures go to the private log; exhaustion surfaces the url.
pub async fn deliver(
    uploader: &dyn Uploader,
    spec: &PostSpec,
    path: &Path,
    attempts: u32,
    sink: &LogSink,
) -> Result<(), RunnerError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    for _ in 0..attempts {
        let body = std::fs::read(path)?;
        match uploader.post_file(spec, body, &file_name).await {
            Ok(()) => return Ok(()),
            Err(err) => sink.private(&err.to_string()),
        }
    }
    Err(UploadError::Exhausted(spec.url.clone()).into())
}

/// End-of-run delivery of the log destinations. A failed delivery is
/// logged and blocks neither the remaining destinations nor the already
/// decided outcome.
pub async fn deliver_logs(uploader: &dyn Uploader, cfg: &BuildConfig, sink: &LogSink) {
    let posts = &cfg.signed_urls.post;
    let artifacts = [
        (&posts.logs, sink.public_path()),
        (&posts.debug, sink.private_path()),
        (&posts.metrics, sink.metrics_path()),
    ];
    for (spec, path) in artifacts {
        let Some(spec) = spec else {
            continue;
        };
        if let Err(err) = deliver(uploader, spec, &path, DEFAULT_ATTEMPTS, sink).await {
            log::error!("delivering {} failed: {err}", path.display());
        }
    }
}

/// Multipart POST against the pre-signed url. The provided form fields
/// travel alongside the file part; only 204 counts as delivered.
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new() -> Self {
        HttpUploader {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpUploader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn post_file(
        &self,
        spec: &PostSpec,
        body: Vec<u8>,
        file_name: &str,
    ) -> Result<(), AttemptError> {
        let mut form = Form::new();
        for (key, value) in &spec.fields {
            form = form.text(key.clone(), value.clone());
        }
        form = form.part("file", Part::bytes(body).file_name(file_name.to_string()));

        let response = self.client.post(&spec.url).multipart(form).send().await?;
        if response.status() != StatusCode::NO_CONTENT {
            return Err(AttemptError::Status {
                code: response.status().as_u16(),
                text: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
