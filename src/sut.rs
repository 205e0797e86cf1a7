use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::process::Command;

use crate::engine::ContainerEngine;
use crate::errors::{BuildError, RunnerError};
use crate::exec;
use crate::logs::LogSink;

/// Compose service whose exit status decides a stack's verdict.
const SUT_SERVICE: &str = "sut";

/// Container the sut service lands in under compose v1 project naming.
pub fn container_name(build_code: &str) -> String {
    format!("{build_code}_sut_1")
}

/// Test stacks are compose files named `<name>.test.yml` or
/// `<name>-test.yml` next to the dockerfile. Sorted for a deterministic
/// run order.
pub fn discover_stacks(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut stacks: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .map(|name| {
                    let name = name.to_string_lossy();
                    name.ends_with(".test.yml") || name.ends_with("-test.yml")
                })
                .unwrap_or(false)
        })
        .collect();
    stacks.sort();
    stacks
}

/// Run every discovered test stack in order, stopping at the first
/// failure. No stacks is not an error.
pub async fn run_all(
    engine: &dyn ContainerEngine,
    dir: &Path,
    build_code: &str,
    sink: &LogSink,
) -> Result<(), RunnerError> {
    sink.private("Starting Test");
    for stack in discover_stacks(dir) {
        run_stack(engine, &stack, dir, build_code, sink).await?;
    }
    Ok(())
}

async fn run_stack(
    engine: &dyn ContainerEngine,
    stack: &Path,
    dir: &Path,
    build_code: &str,
    sink: &LogSink,
) -> Result<(), RunnerError> {
    let name = stack
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| stack.display().to_string());

    sink.public(&format!("Starting Test in {name}..."));
    compose(
        dir,
        &["-f", &name, "-p", build_code, "build"],
        Some(&format!("building {name}")),
        sink,
    )
    .await?;
    compose(
        dir,
        &["-f", &name, "-p", build_code, "up", "-d", SUT_SERVICE],
        Some(&format!("starting \"{SUT_SERVICE}\" service in {name}")),
        sink,
    )
    .await?;

    let container = container_name(build_code);
    let mut output = engine.container_logs(&container).await;
    while let Some(chunk) = output.next().await {
        sink.public(&chunk?);
    }
    let status = engine.wait(&container).await?;

    // Teardown happens before the verdict; its own exit status is ignored.
    compose(
        dir,
        &["-f", &name, "-p", build_code, "rm", "--force", "-v"],
        None,
        sink,
    )
    .await?;

    if status != 0 {
        return Err(BuildError::TestFailed {
            stack: name,
            status,
        }
        .into());
    }
    sink.public(&format!("Tests in {name} succeeded"));
    Ok(())
}

async fn compose(
    dir: &Path,
    args: &[&str],
    failure_context: Option<&str>,
    sink: &LogSink,
) -> Result<(), RunnerError> {
    let mut command = Command::new("docker-compose");
    command.args(args).current_dir(dir);
    let result = exec::run_streamed(&mut command, sink).await?;
    if !result.success() {
        if let Some(context) = failure_context {
            return Err(BuildError::Command {
                context: context.to_string(),
                code: result.code,
            }
            .into());
        }
    }
    Ok(())
}
