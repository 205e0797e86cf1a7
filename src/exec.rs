use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::logs::LogSink;

/// Outcome of a streamed subprocess: exit code plus the collected output
/// for callers that translate failures into hints.
#[derive(Debug)]
pub struct ExecOutput {
    pub code: i32,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run a command, forwarding every stdout and stderr line to the public
/// log as it arrives and collecting the combined output.
pub async fn run_streamed(command: &mut Command, sink: &LogSink) -> std::io::Result<ExecOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "stderr not captured"))?;

    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let mut collected = String::new();
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !(stdout_done && stderr_done) {
        tokio::select! {
            line = stdout.next_line(), if !stdout_done => match line? {
                Some(line) => forward(&line, sink, &mut collected),
                None => stdout_done = true,
            },
            line = stderr.next_line(), if !stderr_done => match line? {
                Some(line) => forward(&line, sink, &mut collected),
                None => stderr_done = true,
            },
        }
    }

    let status = child.wait().await?;
    Ok(ExecOutput {
        code: status.code().unwrap_or(-1),
        output: collected,
    })
}

fn forward(line: &str, sink: &LogSink, collected: &mut String) {
    sink.public(line);
    collected.push_str(line);
    collected.push('\n');
}
