use chrono::Utc;
use serde_json::json;

use crate::logs::LogSink;

/// Every metric name is namespaced before it leaves the process.
const PREFIX: &str = "builder_";

/// Writes metric records to the metrics log destination. A harvesting
/// agent on the host turns the records into real time series; nothing is
/// transported from here.
pub struct Metrics<'a> {
    sink: &'a LogSink,
}

impl<'a> Metrics<'a> {
    pub fn new(sink: &'a LogSink) -> Self {
        Metrics { sink }
    }

    pub fn increment(&self, name: &str, tags: &[(&str, &str)]) {
        self.emit("increment", name, 1.0, tags);
    }

    pub fn timing(&self, name: &str, seconds: f64, tags: &[(&str, &str)]) {
        self.emit("timing", name, seconds, tags);
    }

    fn emit(&self, method: &str, name: &str, value: f64, tags: &[(&str, &str)]) {
        let metric = format!("{PREFIX}{name}");
        self.sink.debug(&format!("emitting metric {metric} ({method})"));
        let tags: serde_json::Map<String, serde_json::Value> = tags
            .iter()
            .map(|(key, value)| ((*key).to_string(), json!(value)))
            .collect();
        self.sink.metric(&json!({
            "time": Utc::now().to_rfc3339(),
            "metric": metric,
            "method": method,
            "value": value,
            "tags": tags,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_records_are_namespaced() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path(), 10_000, None).unwrap();
        Metrics::new(&sink).increment("cache.pull_failure", &[("error", "no such image")]);

        let content = std::fs::read_to_string(sink.metrics_path()).unwrap();
        let record: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(record["metric"], "builder_cache.pull_failure");
        assert_eq!(record["method"], "increment");
        assert_eq!(record["value"], 1.0);
        assert_eq!(record["tags"]["error"], "no such image");
    }

    #[test]
    fn test_timing_carries_elapsed_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path(), 10_000, None).unwrap();
        Metrics::new(&sink).timing("build_duration_seconds", 12.5, &[("state", "success")]);

        let content = std::fs::read_to_string(sink.metrics_path()).unwrap();
        let record: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(record["metric"], "builder_build_duration_seconds");
        assert_eq!(record["method"], "timing");
        assert_eq!(record["value"], 12.5);
    }
}
