use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::BuildConfig;

/// Transport or API level failure from the container engine client.
/// In-band failures travel inside [ProgressRecord] instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine api: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("unsupported engine endpoint: {0}")]
    Endpoint(String),

    #[error("registry credentials: {0}")]
    Credentials(String),

    #[error("engine client not connected")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Decoded records from a streamed image operation.
pub type RecordStream = BoxStream<'static, Result<ProgressRecord, EngineError>>;

/// Output chunks from a container's logs.
pub type OutputStream = BoxStream<'static, Result<String, EngineError>>;

/// One decoded record from an engine image-operation stream, mirroring
/// the wire fields of the engine API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(rename = "progressDetail", skip_serializing_if = "Option::is_none")]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "errorDetail", skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressRecord {
    /// In-band failure carried by this record. The detail field wins over
    /// the plain one, and a present-but-empty value still counts as a
    /// failure.
    pub fn error_text(&self) -> Option<String> {
        if let Some(detail) = &self.error_detail {
            return Some(detail.message.clone().unwrap_or_default());
        }
        self.error.clone()
    }

    /// True when `status` is the only populated field.
    pub fn status_only(&self) -> bool {
        self.status.is_some()
            && self.id.is_none()
            && self.progress.is_none()
            && self.progress_detail.is_none()
            && self.aux.is_none()
            && self.stream.is_none()
            && self.error.is_none()
            && self.error_detail.is_none()
    }
}

/// What the built-in build stage asks of the engine.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Directory sent to the engine as the build context.
    pub context_dir: PathBuf,
    /// Dockerfile name, relative to the context directory.
    pub dockerfile: String,
    /// Canonical image name the result is tagged as.
    pub tag: String,
    /// Image whose layers seed the build cache. Absent means layer
    /// caching is disabled for the build.
    pub cache_from: Option<String>,
}

/// Narrow client surface of the container engine. The production
/// implementation speaks the engine HTTP API; tests substitute in-memory
/// fakes.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine version table as ordered key/value pairs.
    async fn version(&self) -> Result<Vec<(String, String)>, EngineError>;

    /// Build an image, streaming build records.
    async fn build(&self, request: BuildRequest) -> Result<RecordStream, EngineError>;

    /// Apply an additional repo:tag name to an existing image.
    async fn tag(&self, image: &str, repo: &str, tag: &str) -> Result<(), EngineError>;

    /// Push one tag, streaming progress records.
    async fn push(&self, repo: &str, tag: &str) -> RecordStream;

    /// Pull one tag, streaming progress records.
    async fn pull(&self, repo: &str, tag: &str) -> RecordStream;

    /// Every tag of every image the engine currently knows.
    async fn image_tags(&self) -> Result<Vec<String>, EngineError>;

    /// Every container the engine currently knows, running or not.
    async fn container_ids(&self) -> Result<Vec<String>, EngineError>;

    async fn remove_image(&self, tag: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Follow a container's output until it stops.
    async fn container_logs(&self, container: &str) -> OutputStream;

    /// Block until a container exits and return its status code.
    async fn wait(&self, container: &str) -> Result<i64, EngineError>;
}

/// Builds the engine client during setup, once the source is in place.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, cfg: &BuildConfig) -> Result<Box<dyn ContainerEngine>, EngineError>;
}
