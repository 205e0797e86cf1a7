use futures::StreamExt;

use crate::engine::{BuildRequest, ContainerEngine};
use crate::errors::{BuildError, RunnerError};
use crate::logs::LogSink;

/// Fixed alias applied to every successful build, for downstream tooling
/// that expects the image under a well-known name.
pub const ALIAS_REPO: &str = "this";
pub const ALIAS_TAG: &str = "latest";

/// Surface the engine version table in the public log.
pub async fn log_engine_version(
    engine: &dyn ContainerEngine,
    sink: &LogSink,
) -> Result<(), RunnerError> {
    for (key, value) in engine.version().await? {
        sink.public(&format!("{key}: {value}"));
    }
    Ok(())
}

/// Build the canonical image, forwarding stream chunks to the public log.
/// An in-band error record is a recognized build failure carrying the
/// engine's own message.
pub async fn build_image(
    engine: &dyn ContainerEngine,
    request: BuildRequest,
    sink: &LogSink,
) -> Result<(), RunnerError> {
    sink.public(&format!("Starting build of {}...", request.tag));
    let mut stream = engine.build(request).await?;
    while let Some(record) = stream.next().await {
        let record = record?;
        if let Some(chunk) = &record.stream {
            sink.public(chunk);
        } else if let Some(error) = &record.error {
            return Err(BuildError::ImageBuild(error.clone()).into());
        }
    }
    Ok(())
}

/// Apply every non-canonical configured tag to the built image.
pub async fn multitag(
    engine: &dyn ContainerEngine,
    image: &str,
    repo: &str,
    tags: &[String],
) -> Result<(), RunnerError> {
    for tag in tags {
        engine.tag(image, repo, tag).await?;
    }
    Ok(())
}

/// Tag the canonical image under the fixed alias name.
pub async fn add_alias_tag(engine: &dyn ContainerEngine, image: &str) -> Result<(), RunnerError> {
    engine.tag(image, ALIAS_REPO, ALIAS_TAG).await?;
    Ok(())
}
