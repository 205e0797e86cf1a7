use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

/// Environment contract of one build job. Every knob arrives as an
/// environment variable set by the scheduling agent; the flags exist for
/// --help and local runs.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Unique identifier of the build job.
    #[arg(long, env = "BUILD_CODE")]
    pub build_code: String,

    /// Repository the built image is named under.
    #[arg(long, env = "DOCKER_REPO")]
    pub docker_repo: String,

    /// Comma-separated tag list. The first tag names the canonical image.
    #[arg(long, env = "DOCKER_TAG", default_value = "latest")]
    pub docker_tag: String,

    /// Version control system holding the source.
    #[arg(long, value_enum, env = "SOURCE_TYPE")]
    pub source_type: SourceKind,

    /// Clone URL of the source repository.
    #[arg(long, env = "SOURCE_URL")]
    pub source_url: String,

    /// Branch to build.
    #[arg(long, env = "SOURCE_BRANCH")]
    pub source_branch: Option<String>,

    /// Exact commit to check out.
    #[arg(long, env = "SOURCE_COMMIT")]
    pub source_commit: Option<String>,

    /// SSH private key granting read access to the source repository.
    #[arg(long, env = "SSH_PRIVATE", hide_env_values = true)]
    pub ssh_private: Option<String>,

    /// Where in the repository to root the build context.
    #[arg(long, env = "BUILD_PATH", default_value = "/")]
    pub build_path: String,

    /// Dockerfile location inside the build context.
    #[arg(long, env = "DOCKERFILE_PATH", default_value = "")]
    pub dockerfile_path: String,

    /// Engine endpoint the job builds against.
    #[arg(long, env = "DOCKER_HOST")]
    pub docker_host: String,

    /// Registry credential document in dockercfg format.
    #[arg(long, env = "DOCKERCFG", hide_env_values = true)]
    pub dockercfg: Option<String>,

    /// Tag whose layers are pulled before building to warm the cache.
    #[arg(long, env = "CACHE_TAG")]
    pub cache_tag: Option<String>,

    /// Pre-signed upload destinations, as a JSON document.
    #[arg(long, env = "SIGNED_URLS", default_value = "{}")]
    pub signed_urls: String,

    /// Label of the user-provided build node, if the job runs on one.
    #[arg(long, env = "BYON")]
    pub byon: Option<String>,

    /// Whether the built image is pushed to the registry.
    #[arg(long, env = "PUSH", default_value = "false")]
    pub push: String,

    /// Attempt ceiling for registry and upload operations.
    #[arg(long, env = "PUSH_ATTEMPT_COUNT", default_value_t = 5)]
    pub push_attempt_count: u32,

    /// Byte budget of each log destination.
    #[arg(long, env = "MAX_LOG_SIZE", default_value_t = 64_000_000)]
    pub max_log_size: u64,

    /// Cluster label stamped into structured log records.
    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    /// Directory that job working directories are created under.
    #[arg(long, env = "WORK_ROOT", default_value = "/src")]
    pub work_root: PathBuf,

    /// Directory the log destinations are written to.
    #[arg(long, env = "LOG_DIR", default_value = "/")]
    pub log_dir: PathBuf,

    /// Marker file that keeps a finished host from running a second job.
    #[arg(long, env = "COMPLETED_FILE", default_value = "/completed")]
    pub completed_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "lower")]
pub enum SourceKind {
    Git,
    Hg,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no usable tags in the configured tag list")]
    EmptyTagList,

    #[error("signed urls document: {0}")]
    SignedUrls(#[from] serde_json::Error),
}

/// Immutable job configuration, built once at startup and passed to every
/// component. Nothing reads ambient environment state after this point.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub build_code: String,
    pub repo: String,
    pub tags: Vec<String>,
    pub source: Source,
    pub build_path: String,
    pub dockerfile_path: String,
    pub engine_host: String,
    pub dockercfg: Option<String>,
    pub cache_tag: Option<String>,
    pub signed_urls: SignedUrls,
    pub node_label: Option<String>,
    pub push: bool,
    pub attempts: u32,
    pub max_log_size: u64,
    pub cluster_name: Option<String>,
    pub work_root: PathBuf,
    pub log_dir: PathBuf,
    pub completed_file: PathBuf,
    pub ssh_key_path: PathBuf,
}

/// Where and how to fetch the source tree.
#[derive(Debug, Clone)]
pub struct Source {
    pub kind: SourceKind,
    pub url: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub ssh_key: Option<String>,
}

/// Pre-signed upload destinations, decoded from the SIGNED_URLS document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignedUrls {
    #[serde(default)]
    pub post: PostUrls,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostUrls {
    pub logs: Option<PostSpec>,
    pub debug: Option<PostSpec>,
    pub metrics: Option<PostSpec>,
    pub dockerfile: Option<PostSpec>,
    pub readme: Option<PostSpec>,
}

/// One pre-signed POST: the target url plus the form fields that must
/// accompany the file part.
#[derive(Debug, Clone, Deserialize)]
pub struct PostSpec {
    pub url: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl BuildConfig {
    pub fn new(cli: Cli) -> Result<Self, ConfigError> {
        let tags = parse_tags(&cli.docker_tag)?;
        let signed_urls: SignedUrls = serde_json::from_str(&cli.signed_urls)?;
        let ssh_key_path = home_dir().join(".ssh").join("id_rsa");

        Ok(BuildConfig {
            build_code: cli.build_code,
            repo: cli.docker_repo,
            tags,
            source: Source {
                kind: cli.source_type,
                url: cli.source_url,
                branch: non_empty(cli.source_branch),
                commit: non_empty(cli.source_commit),
                ssh_key: non_empty(cli.ssh_private),
            },
            build_path: cli.build_path,
            dockerfile_path: cli.dockerfile_path,
            engine_host: cli.docker_host,
            dockercfg: non_empty(cli.dockercfg),
            cache_tag: non_empty(cli.cache_tag),
            signed_urls,
            node_label: non_empty(cli.byon),
            push: cli.push.eq_ignore_ascii_case("true"),
            attempts: cli.push_attempt_count,
            max_log_size: cli.max_log_size,
            cluster_name: non_empty(cli.cluster_name),
            work_root: cli.work_root,
            log_dir: cli.log_dir,
            completed_file: cli.completed_file,
            ssh_key_path,
        })
    }

    /// `repository:firstTag`, the name every build and tag operation
    /// targets first.
    pub fn image_name(&self) -> String {
        format!("{}:{}", self.repo, self.tags[0])
    }

    pub fn cache_image_name(&self) -> Option<String> {
        self.cache_tag
            .as_ref()
            .map(|tag| format!("{}:{}", self.repo, tag))
    }

    /// Job working directory, recreated from scratch at setup.
    pub fn workdir(&self) -> PathBuf {
        self.work_root.join(&self.build_code)
    }
}

fn parse_tags(raw: &str) -> Result<Vec<String>, ConfigError> {
    let tags: Vec<String> = raw
        .replace(' ', "")
        .split(',')
        .filter(|tag| !tag.is_empty())
        .map(String::from)
        .collect();
    if tags.is_empty() {
        return Err(ConfigError::EmptyTagList);
    }
    Ok(tags)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
}
