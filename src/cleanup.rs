use std::collections::BTreeSet;
use std::path::Path;

use crate::engine::{ContainerEngine, EngineError};
use crate::logs::LogSink;

/// Engine state captured before the job builds anything. Cleanup reads
/// it to decide what the job introduced.
#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    pub tags: BTreeSet<String>,
    pub containers: BTreeSet<String>,
}

/// Record every image tag and container the engine currently knows.
pub async fn snapshot(engine: &dyn ContainerEngine) -> Result<ResourceSnapshot, EngineError> {
    let tags = engine.image_tags().await?.into_iter().collect();
    let containers = engine.container_ids().await?.into_iter().collect();
    Ok(ResourceSnapshot { tags, containers })
}

/// Remove the job working directory if it still exists.
pub fn remove_workdir(workdir: &Path) -> std::io::Result<()> {
    if workdir.is_dir() {
        std::fs::remove_dir_all(workdir)?;
    }
    Ok(())
}

/// Force-remove every container and image tag introduced since the
/// snapshot. Individual removal failures are logged and skipped; sorted
/// iteration keeps the order deterministic.
pub async fn remove_introduced(
    engine: &dyn ContainerEngine,
    snapshot: &ResourceSnapshot,
    sink: &LogSink,
) -> Result<(), EngineError> {
    let current: BTreeSet<String> = engine.container_ids().await?.into_iter().collect();
    for container in current.difference(&snapshot.containers) {
        if engine.remove_container(container).await.is_err() {
            sink.private(&format!("Could not remove container: {container}"));
        }
    }

    let current: BTreeSet<String> = engine.image_tags().await?.into_iter().collect();
    for tag in current.difference(&snapshot.tags) {
        if engine.remove_image(tag).await.is_err() {
            sink.private(&format!("Could not remove image: {tag}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;

    fn sink(dir: &Path) -> LogSink {
        LogSink::open(dir, 100_000, None).unwrap()
    }

    fn seeded(tags: &[&str], containers: &[&str]) -> FakeEngine {
        let engine = FakeEngine::default();
        *engine.tags.lock().unwrap() = tags.iter().map(|t| t.to_string()).collect();
        *engine.containers.lock().unwrap() = containers.iter().map(|c| c.to_string()).collect();
        engine
    }

    #[tokio::test]
    async fn test_only_introduced_resources_are_removed() {
        let logs = tempfile::tempdir().unwrap();
        let engine = seeded(&["a", "b"], &["keep"]);
        let before = snapshot(&engine).await.unwrap();

        engine.tags.lock().unwrap().extend(["d".to_string(), "c".to_string()]);
        engine.containers.lock().unwrap().push("fresh".to_string());

        remove_introduced(&engine, &before, &sink(logs.path()))
            .await
            .unwrap();

        assert_eq!(*engine.removed_images.lock().unwrap(), vec!["c", "d"]);
        assert_eq!(*engine.removed_containers.lock().unwrap(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_untouched_engine_state_removes_nothing() {
        let logs = tempfile::tempdir().unwrap();
        let engine = seeded(&["a", "b"], &["one"]);
        let before = snapshot(&engine).await.unwrap();

        remove_introduced(&engine, &before, &sink(logs.path()))
            .await
            .unwrap();

        assert!(engine.removed_images.lock().unwrap().is_empty());
        assert!(engine.removed_containers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_removal_failures_are_logged_and_skipped() {
        let logs = tempfile::tempdir().unwrap();
        let engine = seeded(&[], &[]);
        let before = snapshot(&engine).await.unwrap();

        engine
            .tags
            .lock()
            .unwrap()
            .extend(["stuck:tag".to_string(), "zz:ok".to_string()]);
        engine.stuck.lock().unwrap().push("stuck:tag".to_string());

        let sink = sink(logs.path());
        remove_introduced(&engine, &before, &sink).await.unwrap();

        assert_eq!(*engine.removed_images.lock().unwrap(), vec!["zz:ok"]);
        let private = std::fs::read_to_string(sink.private_path()).unwrap();
        assert!(private.contains("Could not remove image: stuck:tag"));
    }

    #[test]
    fn test_workdir_removal_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let workdir = root.path().join("job");
        std::fs::create_dir_all(workdir.join("nested")).unwrap();

        remove_workdir(&workdir).unwrap();
        assert!(!workdir.exists());
        remove_workdir(&workdir).unwrap();
    }
}
