use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::json;

/// Marker left at the end of a destination that reached its byte budget.
pub const TRUNCATION_MARKER: &str = "<Max Log-size Reached>";

/// Pipeline stage, attached to every structured record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Setup,
    Pull,
    Build,
    Test,
    Push,
    Cleanup,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Setup => "setup",
            Step::Pull => "pull",
            Step::Build => "build",
            Step::Test => "test",
            Step::Push => "push",
            Step::Cleanup => "cleanup",
        }
    }
}

/// One size-bounded log file. Crossing the byte budget cuts the stored
/// content back to fit, ends it with [TRUNCATION_MARKER], and silently
/// drops every later write.
struct Destination {
    path: PathBuf,
    file: File,
    written: u64,
    limit: u64,
    closed: bool,
    echo: bool,
}

impl Destination {
    fn open(path: PathBuf, limit: u64, echo: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Destination {
            path,
            file,
            written: 0,
            limit,
            closed: false,
            echo,
        })
    }

    fn write_line(&mut self, line: &str) {
        if self.closed {
            return;
        }
        if self.echo {
            print!("{line}");
            let _ = std::io::stdout().flush();
        }
        if self.file.write_all(line.as_bytes()).is_err() {
            return;
        }
        self.written += line.len() as u64;
        if self.written > self.limit {
            self.truncate();
        }
    }

    fn truncate(&mut self) {
        let keep = self.limit.saturating_sub(TRUNCATION_MARKER.len() as u64);
        let _ = self.file.set_len(keep);
        let _ = self.file.seek(SeekFrom::End(0));
        let _ = self.file.write_all(TRUNCATION_MARKER.as_bytes());
        let _ = self.file.flush();
        self.written = keep + TRUNCATION_MARKER.len() as u64;
        self.closed = true;
    }
}

/// The three log destinations of one build job.
///
/// The public log is plain build narration, echoed to stdout for anyone
/// watching the host. The private log holds structured operator records.
/// The metrics log holds raw metric records for the harvesting agent.
/// All three share the same byte budget and truncation behavior.
pub struct LogSink {
    step: Mutex<Step>,
    cluster: Option<String>,
    public: Mutex<Destination>,
    private: Mutex<Destination>,
    metrics: Mutex<Destination>,
}

impl LogSink {
    pub fn open(dir: &Path, limit: u64, cluster: Option<String>) -> std::io::Result<Self> {
        Ok(LogSink {
            step: Mutex::new(Step::Setup),
            cluster,
            public: Mutex::new(Destination::open(dir.join("public.log"), limit, true)?),
            private: Mutex::new(Destination::open(dir.join("private.log"), limit, false)?),
            metrics: Mutex::new(Destination::open(dir.join("metrics.log"), limit, false)?),
        })
    }

    /// Called by the orchestrator as each stage begins. Individual log
    /// calls never change the step.
    pub fn set_step(&self, step: Step) {
        *self.step.lock().unwrap() = step;
    }

    pub fn step(&self) -> Step {
        *self.step.lock().unwrap()
    }

    /// Public build narration. A newline is appended only when missing, so
    /// engine stream chunks carrying their own pass through unchanged.
    pub fn public(&self, message: &str) {
        if message.ends_with('\n') {
            self.public.lock().unwrap().write_line(message);
        } else {
            self.public.lock().unwrap().write_line(&format!("{message}\n"));
        }
    }

    /// Operator-facing record at info level.
    pub fn private(&self, message: &str) {
        self.structured("info", message);
    }

    /// Operator-facing record at debug level.
    pub fn debug(&self, message: &str) {
        self.structured("debug", message);
    }

    fn structured(&self, level: &str, message: &str) {
        let mut record = json!({
            "time": Utc::now().to_rfc3339(),
            "level": level,
            "step": self.step().as_str(),
            "message": message,
        });
        if let Some(cluster) = &self.cluster {
            record["cluster_name"] = json!(cluster);
        }
        let mut line = record.to_string();
        line.push('\n');
        self.private.lock().unwrap().write_line(&line);
    }

    /// Raw record for the metrics destination.
    pub fn metric(&self, record: &serde_json::Value) {
        let mut line = record.to_string();
        line.push('\n');
        self.metrics.lock().unwrap().write_line(&line);
    }

    pub fn public_path(&self) -> PathBuf {
        self.public.lock().unwrap().path.clone()
    }

    pub fn private_path(&self) -> PathBuf {
        self.private.lock().unwrap().path.clone()
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.metrics.lock().unwrap().path.clone()
    }
}
