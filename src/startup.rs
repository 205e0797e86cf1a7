use std::path::{Path, PathBuf};

use crate::errors::BuildError;

/// Where the build reads its inputs from, resolved once during setup.
#[derive(Debug, Clone)]
pub struct BuildLayout {
    /// Directory submitted to the engine as the build context.
    pub build_dir: PathBuf,
    /// Dockerfile name, relative to the build directory.
    pub dockerfile: String,
    /// Directory holding the dockerfile, and the hooks/ directory with it.
    pub dockerfile_dir: PathBuf,
    /// First readme found near the dockerfile, if any.
    pub readme: Option<PathBuf>,
}

/// Purge and recreate the job working directory. A retried job can land
/// on a host that still has the previous attempt's directory.
pub fn prepare_workdir(workdir: &Path) -> std::io::Result<()> {
    if workdir.is_dir() {
        std::fs::remove_dir_all(workdir)?;
    }
    std::fs::create_dir_all(workdir)?;
    Ok(())
}

/// Strip the leading slash the agent sends, so repository paths join
/// cleanly under the checkout.
pub fn clean_path(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// Resolve the build directory and dockerfile name from the configured
/// build and dockerfile paths. The build path may point at the dockerfile
/// itself or at the directory holding it.
pub fn resolve_dockerfile(
    workdir: &Path,
    build_path: &str,
    dockerfile_path: &str,
) -> Result<(PathBuf, String), BuildError> {
    let dockerfile_path = clean_path(dockerfile_path);
    let build_path = workdir.join(clean_path(build_path));

    if build_path.is_file() {
        dockerfile_for_file_path(&build_path, dockerfile_path)
    } else if build_path.is_dir() {
        dockerfile_for_dir_path(&build_path, dockerfile_path)
    } else {
        Err(BuildError::BuildPathMissing(
            build_path.display().to_string(),
        ))
    }
}

fn dockerfile_for_file_path(
    build_path: &Path,
    dockerfile_path: &str,
) -> Result<(PathBuf, String), BuildError> {
    let file_name = build_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let directory = build_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    if !dockerfile_path.is_empty() && file_name != dockerfile_path {
        return Err(BuildError::DockerfileConflict {
            directory: directory.display().to_string(),
            existing: file_name,
            configured: dockerfile_path.to_string(),
        });
    }
    Ok((directory, file_name))
}

fn dockerfile_for_dir_path(
    build_path: &Path,
    dockerfile_path: &str,
) -> Result<(PathBuf, String), BuildError> {
    let dockerfile = if dockerfile_path.is_empty() {
        "Dockerfile"
    } else {
        dockerfile_path
    };
    let candidate = build_path.join(dockerfile);

    if candidate.is_file() {
        return Ok((build_path.to_path_buf(), dockerfile.to_string()));
    }
    if candidate.is_dir() {
        let hint = candidate.join("Dockerfile");
        return Err(BuildError::DockerfileIsDirectory {
            path: candidate.display().to_string(),
            hint: hint.display().to_string(),
        });
    }
    Err(BuildError::DockerfileNotFound(
        candidate.display().to_string(),
    ))
}

/// Directory that holds the dockerfile. Hook scripts and test stacks are
/// discovered here; the dockerfile name may itself carry directories.
pub fn dockerfile_dir(build_dir: &Path, dockerfile: &str) -> PathBuf {
    build_dir
        .join(dockerfile)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| build_dir.to_path_buf())
}

/// Probe for a readme worth publishing: the build directory first, then
/// the dockerfile folder, then the checkout root. An exact `README.md`
/// wins over the alphabetically first case-insensitive match.
pub fn resolve_readme(build_dir: &Path, dockerfile_dir: &Path, workdir: &Path) -> Option<PathBuf> {
    for dir in [build_dir, dockerfile_dir, workdir] {
        let exact = dir.join("README.md");
        if exact.is_file() {
            return Some(exact);
        }
        if let Some(found) = first_readme_like(dir) {
            return Some(found);
        }
    }
    None
}

fn first_readme_like(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().to_lowercase().starts_with("readme"))
                .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn test_clean_path_strips_one_leading_slash() {
        assert_eq!(clean_path("/a/b"), "a/b");
        assert_eq!(clean_path("a/b"), "a/b");
        assert_eq!(clean_path("/"), "");
    }

    #[test]
    fn test_workdir_is_purged_and_recreated() {
        let root = tempfile::tempdir().unwrap();
        let workdir = root.path().join("job");
        touch(&workdir.join("stale"));

        prepare_workdir(&workdir).unwrap();
        assert!(workdir.is_dir());
        assert!(!workdir.join("stale").exists());
    }

    #[test]
    fn test_dockerfile_in_build_directory() {
        let workdir = tempfile::tempdir().unwrap();
        touch(&workdir.path().join("Dockerfile"));

        let (build_dir, dockerfile) = resolve_dockerfile(workdir.path(), "/", "").unwrap();
        assert_eq!(build_dir, workdir.path());
        assert_eq!(dockerfile, "Dockerfile");
    }

    #[test]
    fn test_build_path_pointing_at_the_dockerfile_itself() {
        let workdir = tempfile::tempdir().unwrap();
        touch(&workdir.path().join("sub/Dockerfile.dev"));

        let (build_dir, dockerfile) =
            resolve_dockerfile(workdir.path(), "/sub/Dockerfile.dev", "").unwrap();
        assert_eq!(build_dir, workdir.path().join("sub"));
        assert_eq!(dockerfile, "Dockerfile.dev");
    }

    #[test]
    fn test_conflicting_dockerfile_names_are_rejected() {
        let workdir = tempfile::tempdir().unwrap();
        touch(&workdir.path().join("sub/Dockerfile.dev"));

        let err = resolve_dockerfile(workdir.path(), "/sub/Dockerfile.dev", "Dockerfile.prod")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Conflicting desired dockerfiles in"));
        assert!(message.ends_with("Dockerfile.dev, Dockerfile.prod"));
    }

    #[test]
    fn test_missing_dockerfile_in_directory() {
        let workdir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(workdir.path().join("app")).unwrap();

        let err = resolve_dockerfile(workdir.path(), "/app", "").unwrap_err();
        assert!(err.to_string().starts_with("Dockerfile not found at"));
    }

    #[test]
    fn test_missing_build_path() {
        let workdir = tempfile::tempdir().unwrap();
        let err = resolve_dockerfile(workdir.path(), "/nope", "").unwrap_err();
        assert!(err.to_string().starts_with("Build path does not exist:"));
    }

    #[test]
    fn test_dockerfile_name_pointing_at_a_directory_gets_a_hint() {
        let workdir = tempfile::tempdir().unwrap();
        touch(&workdir.path().join("app/docker/Dockerfile"));

        let err = resolve_dockerfile(workdir.path(), "/app", "docker").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("points to a directory"));
        assert!(message.contains("docker/Dockerfile"));
    }

    #[test]
    fn test_dockerfile_dir_follows_nested_names() {
        let build_dir = PathBuf::from("/src/job");
        assert_eq!(
            dockerfile_dir(&build_dir, "deploy/Dockerfile"),
            PathBuf::from("/src/job/deploy")
        );
        assert_eq!(dockerfile_dir(&build_dir, "Dockerfile"), build_dir);
    }

    #[test]
    fn test_readme_probing_prefers_exact_name_then_walks_outward() {
        let workdir = tempfile::tempdir().unwrap();
        let build_dir = workdir.path().join("app");
        touch(&build_dir.join("readme.rst"));
        touch(&build_dir.join("README.md"));
        touch(&workdir.path().join("README.md"));

        let readme = resolve_readme(&build_dir, &build_dir, workdir.path()).unwrap();
        assert_eq!(readme, build_dir.join("README.md"));
    }

    #[test]
    fn test_readme_probing_is_case_insensitive() {
        let workdir = tempfile::tempdir().unwrap();
        let build_dir = workdir.path().join("app");
        std::fs::create_dir_all(&build_dir).unwrap();
        touch(&workdir.path().join("ReadMe.txt"));

        let readme = resolve_readme(&build_dir, &build_dir, workdir.path()).unwrap();
        assert_eq!(readme, workdir.path().join("ReadMe.txt"));
    }

    #[test]
    fn test_no_readme_is_fine() {
        let workdir = tempfile::tempdir().unwrap();
        assert!(resolve_readme(workdir.path(), workdir.path(), workdir.path()).is_none());
    }
}
