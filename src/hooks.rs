use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::errors::{BuildError, RunnerError};
use crate::exec;
use crate::logs::LogSink;

// exec(2) fails with this errno when the file has no interpreter line.
const ENOEXEC: i32 = 8;

/// User extension scripts found under `hooks/` next to the dockerfile.
/// An override hook (`build`, `test`, `push`) replaces the built-in body
/// of its stage entirely.
pub struct Hooks {
    dir: PathBuf,
    env: Vec<(String, String)>,
}

impl Hooks {
    /// Marks everything under the hook directory executable and fixes the
    /// environment the hooks will see.
    pub fn prepare(dockerfile_dir: &Path, env: Vec<(String, String)>) -> std::io::Result<Self> {
        let dir = dockerfile_dir.join("hooks");
        if dir.is_dir() {
            mark_executable(&dir)?;
        }
        Ok(Hooks { dir, env })
    }

    /// Run `hooks/<name>` if it exists, reporting whether a hook ran.
    /// A non-zero exit aborts the surrounding stage.
    pub async fn run(&self, name: &str, sink: &LogSink) -> Result<bool, RunnerError> {
        let path = self.dir.join(name);
        if !path.is_file() {
            return Ok(false);
        }

        sink.public(&format!("Executing {name} hook..."));
        let mut command = Command::new(&path);
        command.envs(self.env.iter().map(|(key, value)| (key.as_str(), value.as_str())));
        if let Some(parent) = self.dir.parent() {
            command.current_dir(parent);
        }

        let result = match exec::run_streamed(&mut command, sink).await {
            Ok(result) => result,
            Err(err) if err.raw_os_error() == Some(ENOEXEC) => {
                return Err(BuildError::HookMissingShebang(path.display().to_string()).into());
            }
            Err(err) => return Err(err.into()),
        };
        if !result.success() {
            return Err(BuildError::Command {
                context: format!("{name} hook failed!"),
                code: result.code,
            }
            .into());
        }
        Ok(true)
    }
}

fn mark_executable(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            mark_executable(&path)?;
        } else {
            let mut permissions = entry.metadata()?.permissions();
            permissions.set_mode(permissions.mode() | 0o111);
            std::fs::set_permissions(&path, permissions)?;
        }
    }
    Ok(())
}
