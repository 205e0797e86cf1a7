use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::{Source, SourceKind};
use crate::errors::{BuildError, RunnerError};
use crate::exec;
use crate::logs::LogSink;

const GIT_BIN: &str = "/usr/bin/git";
const HG_BIN: &str = "/usr/bin/hg";

// Output fragments that tell clone failure kinds apart.
const ACCESS_RIGHTS_FRAGMENT: &str = "Please make sure you have the correct access rights";
const MISSING_BRANCH_FRAGMENT: &str = "not found in";

/// Details captured from the checked-out source, exposed to hooks later.
#[derive(Debug, Clone, Default)]
pub struct CloneDetails {
    pub commit: Option<String>,
    pub message: Option<String>,
}

/// Materializes the configured source in the job working directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        source: &Source,
        workdir: &Path,
        sink: &LogSink,
    ) -> Result<CloneDetails, RunnerError>;
}

/// Fetcher that shells out to the version control binaries.
pub struct CommandLineFetcher {
    ssh_key_path: PathBuf,
}

impl CommandLineFetcher {
    pub fn new(ssh_key_path: PathBuf) -> Self {
        CommandLineFetcher { ssh_key_path }
    }
}

#[async_trait]
impl SourceFetcher for CommandLineFetcher {
    async fn fetch(
        &self,
        source: &Source,
        workdir: &Path,
        sink: &LogSink,
    ) -> Result<CloneDetails, RunnerError> {
        sink.private("Starting to clone");
        let url = match &source.ssh_key {
            Some(key) => {
                write_private_key(key, &self.ssh_key_path)?;
                ssh_source_url(&source.url)
            }
            None => source.url.clone(),
        };

        let commands = clone_commands(
            source.kind,
            &url,
            source.branch.as_deref(),
            source.commit.as_deref(),
        );
        for parts in commands {
            let mut command = Command::new(&parts[0]);
            command.args(&parts[1..]).current_dir(workdir);
            let result = exec::run_streamed(&mut command, sink).await?;
            if !result.success() {
                return Err(BuildError::Command {
                    context: convert_clone_error(&result.output).to_string(),
                    code: result.code,
                }
                .into());
            }
        }

        match source.kind {
            SourceKind::Git => Ok(git_details(workdir).await),
            SourceKind::Hg => Ok(CloneDetails::default()),
        }
    }
}

/// Private github repositories need the ssh form of the clone url for the
/// deploy key to apply.
pub fn ssh_source_url(url: &str) -> String {
    match url.strip_prefix("https://github.com") {
        Some(rest) => format!("git@github.com{}", rest.replacen('/', ":", 1)),
        None => url.to_string(),
    }
}

fn write_private_key(contents: &str, path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{contents}\n"))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Command lines that materialize the source in the working directory.
pub fn clone_commands(
    kind: SourceKind,
    url: &str,
    branch: Option<&str>,
    commit: Option<&str>,
) -> Vec<Vec<String>> {
    let commands: Vec<Vec<&str>> = match kind {
        SourceKind::Git => {
            let branch = branch.unwrap_or("master");
            match commit {
                Some(commit) => vec![
                    vec![GIT_BIN, "clone", "--recursive", url, "."],
                    vec![GIT_BIN, "checkout", "-B", branch, commit],
                    vec![GIT_BIN, "submodule", "update"],
                ],
                None => vec![
                    vec![
                        GIT_BIN,
                        "clone",
                        "--recursive",
                        "--depth",
                        "1",
                        "-b",
                        branch,
                        url,
                        ".",
                    ],
                    vec![GIT_BIN, "submodule", "update"],
                ],
            }
        }
        SourceKind::Hg => vec![vec![
            HG_BIN,
            "clone",
            "-r",
            branch.unwrap_or("default"),
            url,
            ".",
        ]],
    };
    commands
        .into_iter()
        .map(|parts| parts.into_iter().map(String::from).collect())
        .collect()
}

/// Translate raw clone output into something the repository owner can act
/// on. Substring probing against an external tool's wording is
/// best-effort and may misclassify.
pub fn convert_clone_error(output: &str) -> &'static str {
    if output.contains(ACCESS_RIGHTS_FRAGMENT) {
        return "please ensure the correct public key is added to the list of trusted keys for this repository";
    }
    if output.contains(MISSING_BRANCH_FRAGMENT) {
        return "please ensure the remote branch exists";
    }
    "please ensure the correct public key is added to the list of trusted keys for this repository and the remote branch exists."
}

async fn git_details(workdir: &Path) -> CloneDetails {
    let mut command = Command::new("git");
    command.args(["rev-parse", "HEAD"]).current_dir(workdir);
    let commit = capture(&mut command).await;

    let message = match &commit {
        Some(commit) => {
            let mut command = Command::new("git");
            command
                .args(["log", "--format=%B", "-n", "1", commit])
                .current_dir(workdir);
            capture(&mut command).await
        }
        None => None,
    };

    CloneDetails { commit, message }
}

async fn capture(command: &mut Command) -> Option<String> {
    let output = command.output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout)
        .trim_end()
        .to_string();
    (!text.is_empty()).then_some(text)
}
