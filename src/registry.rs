use std::time::Duration;

use futures::StreamExt;

use crate::engine::{ContainerEngine, EngineError, ProgressRecord, RecordStream};
use crate::errors::{BuildError, RunnerError};
use crate::logs::LogSink;
use crate::metrics::Metrics;

/// Fixed pause between registry attempts. Constant rather than
/// exponential; the job's wall clock is already bounded by the host.
pub const RETRY_DELAY: Duration = Duration::from_secs(60);

enum Attempt {
    Completed,
    Failed(String),
}

/// Push every configured tag, retrying the whole tag sweep with a fixed
/// delay before each attempt after the first. Using up the attempt
/// ceiling is a recognized build failure carrying the last error text.
pub async fn push(
    engine: &dyn ContainerEngine,
    repo: &str,
    tags: &[String],
    attempts: u32,
    delay: Duration,
    sink: &LogSink,
) -> Result<(), RunnerError> {
    let mut last_error = String::new();
    for attempt in 0..attempts {
        retry_delay(attempt, delay, sink).await;
        match try_push(engine, repo, tags, sink).await? {
            Attempt::Completed => return Ok(()),
            Attempt::Failed(error) => last_error = error,
        }
    }

    if last_error.is_empty() {
        last_error = "Error pushing tags".to_string();
    }
    Err(BuildError::PushExhausted(last_error).into())
}

async fn try_push(
    engine: &dyn ContainerEngine,
    repo: &str,
    tags: &[String],
    sink: &LogSink,
) -> Result<Attempt, EngineError> {
    for tag in tags {
        let stream = engine.push(repo, tag).await;
        if let Some(error) = drain_records(stream, sink).await? {
            return Ok(Attempt::Failed(error));
        }
    }
    Ok(Attempt::Completed)
}

/// Pull one tag with the same retry shape as push, but never fail the
/// build: a cold cache is worth a metric and a notice, not an abort.
pub async fn pull(
    engine: &dyn ContainerEngine,
    repo: &str,
    tag: &str,
    attempts: u32,
    delay: Duration,
    sink: &LogSink,
) {
    let mut last_error = String::new();
    for attempt in 0..attempts {
        retry_delay(attempt, delay, sink).await;
        let stream = engine.pull(repo, tag).await;
        match drain_records(stream, sink).await {
            Ok(None) => return,
            Ok(Some(error)) => last_error = error,
            Err(err) => last_error = err.to_string(),
        }
    }

    Metrics::new(sink).increment("cache.pull_failure", &[("error", &last_error)]);
    sink.public(&format!("Error pulling cache tag: {last_error}"));
}

async fn retry_delay(attempt: u32, delay: Duration, sink: &LogSink) {
    if attempt > 0 {
        sink.public(&format!("Push failed. Attempt {} in 60 seconds.", attempt + 1));
        tokio::time::sleep(delay).await;
    }
}

/// Consume one operation stream, logging every record privately and
/// returning the first in-band error.
async fn drain_records(
    mut stream: RecordStream,
    sink: &LogSink,
) -> Result<Option<String>, EngineError> {
    while let Some(record) = stream.next().await {
        let record = record?;
        sink.private(&format_record(&record));
        if let Some(error) = record.error_text() {
            return Ok(Some(error));
        }
    }
    Ok(None)
}

/// Human form of one progress record. The fallback is the raw encoded
/// record, which also covers malformed shapes such as a Pushing status
/// with no progress detail.
pub fn format_record(record: &ProgressRecord) -> String {
    format_status(record)
        .or_else(|| format_status_only(record))
        .or_else(|| format_aux(record))
        .unwrap_or_else(|| encode_raw(record))
}

fn format_status(record: &ProgressRecord) -> Option<String> {
    let status = record.status.as_deref()?;
    match status {
        "Pushing" => {
            let detail = record.progress_detail.as_ref()?;
            Some(format!(
                "{} Pushing: {} {}/{}",
                text_or_empty(&record.id),
                text_or_empty(&record.progress),
                number_or_empty(detail.current),
                number_or_empty(detail.total),
            ))
        }
        "Waiting" | "Preparing" | "Pushed" => {
            Some(format!("{}: {}", text_or_empty(&record.id), status))
        }
        _ => None,
    }
}

fn format_status_only(record: &ProgressRecord) -> Option<String> {
    if record.status_only() {
        record.status.clone()
    } else {
        None
    }
}

fn format_aux(record: &ProgressRecord) -> Option<String> {
    let aux = record.aux.as_ref()?;
    let detail_empty = match &record.progress_detail {
        None => true,
        Some(detail) => detail.current.is_none() && detail.total.is_none(),
    };
    let nothing_else = record.id.is_none()
        && record.status.is_none()
        && record.progress.is_none()
        && record.stream.is_none()
        && record.error.is_none()
        && record.error_detail.is_none();
    if !(detail_empty && nothing_else) {
        return None;
    }
    Some(
        aux.iter()
            .map(|(key, value)| format!("  {}: {}", key, display_value(value)))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn text_or_empty(field: &Option<String>) -> &str {
    field.as_deref().unwrap_or_default()
}

fn number_or_empty(field: Option<i64>) -> String {
    field.map(|value| value.to_string()).unwrap_or_default()
}

fn encode_raw(record: &ProgressRecord) -> String {
    serde_json::to_string(record).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;
    use crate::engine::{ErrorDetail, ProgressDetail};
    use serde_json::json;

    fn record(raw: serde_json::Value) -> ProgressRecord {
        serde_json::from_value(raw).unwrap()
    }

    fn sink(dir: &std::path::Path) -> LogSink {
        LogSink::open(dir, 100_000, None).unwrap()
    }

    fn failing(error: &str) -> Vec<Result<ProgressRecord, EngineError>> {
        vec![Ok(ProgressRecord {
            error: Some(error.to_string()),
            ..Default::default()
        })]
    }

    #[test]
    fn test_pushing_status_renders_progress_counters() {
        let line = record(json!({
            "id": "ab12",
            "status": "Pushing",
            "progress": "[=====>    ]",
            "progressDetail": {"current": 10, "total": 100},
        }));
        assert_eq!(format_record(&line), "ab12 Pushing: [=====>    ] 10/100");
    }

    #[test]
    fn test_queue_statuses_render_id_and_status() {
        for status in ["Waiting", "Preparing", "Pushed"] {
            let line = record(json!({"id": "ab12", "status": status}));
            assert_eq!(format_record(&line), format!("ab12: {status}"));
        }
    }

    #[test]
    fn test_lone_status_renders_verbatim() {
        let line = record(json!({"status": "Pushing two layers to the registry"}));
        assert_eq!(format_record(&line), "Pushing two layers to the registry");
    }

    #[test]
    fn test_aux_payload_renders_indented_pairs() {
        let line = record(json!({
            "progressDetail": {},
            "aux": {"Digest": "sha256:feed", "Size": 1234},
        }));
        assert_eq!(format_record(&line), "  Digest: sha256:feed\n  Size: 1234");
    }

    #[test]
    fn test_pushing_without_detail_falls_back_to_raw() {
        let line = record(json!({"id": "ab12", "status": "Pushing"}));
        let rendered = format_record(&line);
        assert!(rendered.contains("\"status\":\"Pushing\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_sleeps_before_every_attempt_after_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let engine = FakeEngine::default();
        engine
            .push_scripts
            .lock()
            .unwrap()
            .extend([failing("denied"), failing("denied")]);

        let started = tokio::time::Instant::now();
        push(
            &engine,
            "acme/app",
            &["latest".to_string()],
            3,
            Duration::from_secs(60),
            &sink,
        )
        .await
        .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(120));
        assert_eq!(engine.push_calls.lock().unwrap().len(), 3);

        let public = std::fs::read_to_string(sink.public_path()).unwrap();
        assert!(public.contains("Push failed. Attempt 2 in 60 seconds."));
        assert!(public.contains("Push failed. Attempt 3 in 60 seconds."));
    }

    #[tokio::test]
    async fn test_push_exhaustion_carries_the_last_error_text() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let engine = FakeEngine::default();
        engine
            .push_scripts
            .lock()
            .unwrap()
            .extend([failing("first"), failing("second")]);

        let err = push(
            &engine,
            "acme/app",
            &["latest".to_string()],
            2,
            Duration::ZERO,
            &sink,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "second");
        assert_eq!(err.outcome(), crate::errors::ExitOutcome::UserError);
    }

    #[tokio::test]
    async fn test_push_exhaustion_with_empty_error_uses_the_default_text() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let engine = FakeEngine::default();
        let empty_detail = || {
            vec![Ok(ProgressRecord {
                error_detail: Some(ErrorDetail::default()),
                ..Default::default()
            })]
        };
        engine
            .push_scripts
            .lock()
            .unwrap()
            .extend([empty_detail(), empty_detail()]);

        let err = push(
            &engine,
            "acme/app",
            &["latest".to_string()],
            2,
            Duration::ZERO,
            &sink,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Error pushing tags");
    }

    #[tokio::test]
    async fn test_zero_attempt_ceiling_exhausts_without_pushing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let engine = FakeEngine::default();

        let err = push(
            &engine,
            "acme/app",
            &["latest".to_string()],
            0,
            Duration::from_secs(60),
            &sink,
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "Error pushing tags");
        assert!(engine.push_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_sweeps_all_tags_and_restarts_the_sweep_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let engine = FakeEngine::default();
        engine.push_scripts.lock().unwrap().extend([failing("blip")]);

        push(
            &engine,
            "acme/app",
            &["latest".to_string(), "v2".to_string()],
            3,
            Duration::ZERO,
            &sink,
        )
        .await
        .unwrap();

        let calls = engine.push_calls.lock().unwrap().clone();
        let tags: Vec<&str> = calls.iter().map(|(_, tag)| tag.as_str()).collect();
        assert_eq!(tags, vec!["latest", "latest", "v2"]);
    }

    #[tokio::test]
    async fn test_error_detail_message_wins_over_plain_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let engine = FakeEngine::default();
        engine.push_scripts.lock().unwrap().extend([vec![Ok(ProgressRecord {
            error: Some("plain".to_string()),
            error_detail: Some(ErrorDetail {
                code: Some(401),
                message: Some("authentication required".to_string()),
            }),
            ..Default::default()
        })]]);

        let err = push(
            &engine,
            "acme/app",
            &["latest".to_string()],
            1,
            Duration::ZERO,
            &sink,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "authentication required");
    }

    #[tokio::test]
    async fn test_pull_exhaustion_logs_and_counts_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let engine = FakeEngine::default();
        engine
            .pull_scripts
            .lock()
            .unwrap()
            .extend([failing("no such image"), failing("no such image")]);

        pull(&engine, "acme/app", "master", 2, Duration::ZERO, &sink).await;

        let public = std::fs::read_to_string(sink.public_path()).unwrap();
        assert!(public.contains("Error pulling cache tag: no such image"));
        let metrics = std::fs::read_to_string(sink.metrics_path()).unwrap();
        assert!(metrics.contains("builder_cache.pull_failure"));
    }

    #[tokio::test]
    async fn test_pull_swallows_transport_errors_too() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let engine = FakeEngine::default();
        let broken = || vec![Err(EngineError::Endpoint("tcp://gone".to_string()))];
        engine
            .pull_scripts
            .lock()
            .unwrap()
            .extend([broken(), broken()]);

        pull(&engine, "acme/app", "master", 2, Duration::ZERO, &sink).await;

        let public = std::fs::read_to_string(sink.public_path()).unwrap();
        assert!(public.contains("Error pulling cache tag:"));
    }

    #[tokio::test]
    async fn test_progress_records_land_in_the_private_log() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path());
        let engine = FakeEngine::default();
        engine.push_scripts.lock().unwrap().push_back(vec![
            Ok(record(json!({"id": "ab12", "status": "Preparing"}))),
            Ok(record(json!({"id": "ab12", "status": "Pushed"}))),
        ]);

        push(
            &engine,
            "acme/app",
            &["latest".to_string()],
            1,
            Duration::ZERO,
            &sink,
        )
        .await
        .unwrap();

        let private = std::fs::read_to_string(sink.private_path()).unwrap();
        assert!(private.contains("ab12: Preparing"));
        assert!(private.contains("ab12: Pushed"));
        let public = std::fs::read_to_string(sink.public_path()).unwrap();
        assert!(!public.contains("ab12"));
    }

    #[test]
    fn test_progress_detail_counters_may_be_partial() {
        let line = ProgressRecord {
            id: Some("ab12".to_string()),
            status: Some("Pushing".to_string()),
            progress: None,
            progress_detail: Some(ProgressDetail {
                current: Some(512),
                total: None,
            }),
            ..Default::default()
        };
        assert_eq!(format_record(&line), "ab12 Pushing:  512/");
    }
}
