use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bollard::auth::DockerCredentials;
use bollard::container::{
    ListContainersOptions, LogsOptions, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{
    BuildImageOptions, CreateImageOptions, ListImagesOptions, PushImageOptions,
    RemoveImageOptions, TagImageOptions,
};
use bollard::models::ContainerWaitResponse;
use bollard::{models, Docker};
use futures::{pin_mut, StreamExt};
use serde_json::Value;

use crate::config::BuildConfig;
use crate::engine::{
    BuildRequest, ContainerEngine, EngineConnector, EngineError, ErrorDetail, OutputStream,
    ProgressDetail, ProgressRecord, RecordStream,
};

/// Engine operations share one generous deadline; an image build can
/// legitimately take hours.
const CLIENT_TIMEOUT_SECS: u64 = 60 * 120;

/// Registry index implied by unqualified repository names.
const DOCKER_HUB: &str = "docker.io";

/// Where the credential document is persisted so compose, which runs as a
/// subprocess during the test stage, can authenticate too.
const DOCKERCFG_PATH: &str = "/root/.dockercfg";

/// Engine client backed by the Docker HTTP API.
pub struct DockerEngine {
    docker: Docker,
    credentials: HashMap<String, DockerCredentials>,
}

impl DockerEngine {
    pub fn connect(endpoint: &str, dockercfg: Option<&str>) -> Result<Self, EngineError> {
        let docker = if endpoint.starts_with("unix://") {
            Docker::connect_with_unix(endpoint, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        } else if ["tcp://", "http://", "https://"]
            .iter()
            .any(|scheme| endpoint.starts_with(scheme))
        {
            Docker::connect_with_http(endpoint, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        } else {
            return Err(EngineError::Endpoint(endpoint.to_string()));
        };

        let credentials = match dockercfg {
            Some(raw) => parse_dockercfg(raw)?,
            None => HashMap::new(),
        };
        Ok(DockerEngine {
            docker,
            credentials,
        })
    }

    fn credential_for(&self, repo: &str) -> Option<DockerCredentials> {
        let registry = registry_of(repo);
        self.credentials
            .iter()
            .find(|(key, _)| normalize_registry(key) == registry)
            .map(|(_, credential)| credential.clone())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn version(&self) -> Result<Vec<(String, String)>, EngineError> {
        let version = self.docker.version().await?;
        let fields = [
            ("Version", version.version),
            ("ApiVersion", version.api_version),
            ("MinAPIVersion", version.min_api_version),
            ("GitCommit", version.git_commit),
            ("GoVersion", version.go_version),
            ("Os", version.os),
            ("Arch", version.arch),
            ("KernelVersion", version.kernel_version),
            ("BuildTime", version.build_time),
        ];
        Ok(fields
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key.to_string(), value)))
            .collect())
    }

    async fn build(&self, request: BuildRequest) -> Result<RecordStream, EngineError> {
        let archive = tar_context(&request.context_dir)?;
        let options = BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: request.tag.clone(),
            nocache: request.cache_from.is_none(),
            cachefrom: request.cache_from.into_iter().collect(),
            pull: true,
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        let credentials = (!self.credentials.is_empty()).then(|| self.credentials.clone());

        // The record stream must outlive this client borrow; forward it
        // through a channel from a task that owns its own handle.
        let docker = self.docker.clone();
        let (tx, rx) = futures::channel::mpsc::unbounded();
        tokio::spawn(async move {
            let stream = docker.build_image(options, credentials, Some(archive.into()));
            pin_mut!(stream);
            while let Some(result) = stream.next().await {
                let record = result.map(ProgressRecord::from).map_err(EngineError::from);
                if tx.unbounded_send(record).is_err() {
                    break;
                }
            }
        });
        Ok(rx.boxed())
    }

    async fn tag(&self, image: &str, repo: &str, tag: &str) -> Result<(), EngineError> {
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        self.docker.tag_image(image, Some(options)).await?;
        Ok(())
    }

    async fn push(&self, repo: &str, tag: &str) -> RecordStream {
        let docker = self.docker.clone();
        let credentials = self.credential_for(repo);
        let repo = repo.to_string();
        let tag = tag.to_string();

        let (tx, rx) = futures::channel::mpsc::unbounded();
        tokio::spawn(async move {
            let options = PushImageOptions { tag };
            let stream = docker.push_image(&repo, Some(options), credentials);
            pin_mut!(stream);
            while let Some(result) = stream.next().await {
                let record = result.map(ProgressRecord::from).map_err(EngineError::from);
                if tx.unbounded_send(record).is_err() {
                    break;
                }
            }
        });
        rx.boxed()
    }

    async fn pull(&self, repo: &str, tag: &str) -> RecordStream {
        let docker = self.docker.clone();
        let credentials = self.credential_for(repo);
        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let (tx, rx) = futures::channel::mpsc::unbounded();
        tokio::spawn(async move {
            let stream = docker.create_image(Some(options), None, credentials);
            pin_mut!(stream);
            while let Some(result) = stream.next().await {
                let record = result.map(ProgressRecord::from).map_err(EngineError::from);
                if tx.unbounded_send(record).is_err() {
                    break;
                }
            }
        });
        rx.boxed()
    }

    async fn image_tags(&self) -> Result<Vec<String>, EngineError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String>::default()))
            .await?;
        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .collect())
    }

    async fn container_ids(&self) -> Result<Vec<String>, EngineError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|container| container.id)
            .collect())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), EngineError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_image(tag, Some(options), None).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn container_logs(&self, container: &str) -> OutputStream {
        let docker = self.docker.clone();
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let container = container.to_string();

        let (tx, rx) = futures::channel::mpsc::unbounded();
        tokio::spawn(async move {
            let stream = docker.logs(&container, Some(options));
            pin_mut!(stream);
            while let Some(result) = stream.next().await {
                let chunk = result
                    .map(|output| output.to_string())
                    .map_err(EngineError::from);
                if tx.unbounded_send(chunk).is_err() {
                    break;
                }
            }
        });
        rx.boxed()
    }

    async fn wait(&self, container: &str) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let stream = self.docker.wait_container(container, Some(options));
        pin_mut!(stream);
        wait_outcome(stream.next().await)
    }
}

/// The wait endpoint reports a non-zero container exit as an error item;
/// that is a regular outcome here, not a transport failure.
fn wait_outcome(
    item: Option<Result<ContainerWaitResponse, BollardError>>,
) -> Result<i64, EngineError> {
    match item {
        Some(Ok(response)) => Ok(response.status_code),
        Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(err)) => Err(err.into()),
        None => Ok(0),
    }
}

/// Builds the engine client once the source is in place, persisting the
/// credential document where subprocesses expect it.
pub struct DockerConnector;

#[async_trait]
impl EngineConnector for DockerConnector {
    async fn connect(&self, cfg: &BuildConfig) -> Result<Box<dyn ContainerEngine>, EngineError> {
        log::debug!("connecting to engine at {}", cfg.engine_host);
        if let Some(raw) = &cfg.dockercfg {
            std::fs::write(DOCKERCFG_PATH, raw)?;
        }
        let engine = DockerEngine::connect(&cfg.engine_host, cfg.dockercfg.as_deref())?;
        Ok(Box::new(engine))
    }
}

fn tar_context(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.append_dir_all(".", dir)?;
    archive.into_inner()
}

/// Registry a repository name addresses, in normalized index form. A first
/// path segment carrying a dot, a colon or the literal `localhost` names a
/// registry host; everything else lives on Docker Hub.
fn registry_of(repo: &str) -> String {
    let head = repo.split('/').next().unwrap_or_default();
    if head == "localhost" || head.contains('.') || head.contains(':') {
        head.to_string()
    } else {
        DOCKER_HUB.to_string()
    }
}

/// Normalize a dockercfg key for lookup: scheme and path stripped, the
/// legacy Hub index collapsed to its plain index name.
fn normalize_registry(key: &str) -> String {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = key.split('/').next().unwrap_or_default();
    match host {
        "index.docker.io" | "registry-1.docker.io" | "docker.io" => DOCKER_HUB.to_string(),
        _ => host.to_string(),
    }
}

/// Decode a credential document in either the legacy flat dockercfg form
/// or the config.json form with an `auths` wrapper. Auth blobs are base64
/// `user:password` pairs; entries without one are skipped.
fn parse_dockercfg(raw: &str) -> Result<HashMap<String, DockerCredentials>, EngineError> {
    let document: Value =
        serde_json::from_str(raw).map_err(|err| EngineError::Credentials(err.to_string()))?;
    let entries = document.get("auths").unwrap_or(&document);
    let entries = entries
        .as_object()
        .ok_or_else(|| EngineError::Credentials("not a credential map".to_string()))?;

    let mut credentials = HashMap::new();
    for (registry, entry) in entries {
        let auth = entry
            .get("auth")
            .and_then(|auth| auth.as_str())
            .unwrap_or_default();
        if auth.is_empty() {
            continue;
        }
        let decoded = STANDARD
            .decode(auth)
            .map_err(|err| EngineError::Credentials(format!("auth for {registry}: {err}")))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|err| EngineError::Credentials(format!("auth for {registry}: {err}")))?;
        let (username, password) = decoded.split_once(':').ok_or_else(|| {
            EngineError::Credentials(format!("auth for {registry} is not user:password"))
        })?;

        credentials.insert(
            registry.clone(),
            DockerCredentials {
                username: Some(username.to_string()),
                password: Some(password.to_string()),
                email: entry
                    .get("email")
                    .and_then(|email| email.as_str())
                    .map(String::from),
                serveraddress: Some(registry.clone()),
                ..Default::default()
            },
        );
    }
    Ok(credentials)
}

impl From<models::BuildInfo> for ProgressRecord {
    fn from(info: models::BuildInfo) -> Self {
        let aux = info.aux.and_then(|image| image.id).map(|id| {
            let mut map = serde_json::Map::new();
            map.insert("ID".to_string(), Value::String(id));
            map
        });
        ProgressRecord {
            id: info.id,
            status: info.status,
            progress: info.progress,
            progress_detail: info.progress_detail.map(Into::into),
            aux,
            stream: info.stream,
            error: info.error,
            error_detail: info.error_detail.map(Into::into),
        }
    }
}

// The typed push record carries no errorDetail object; push failures
// arrive through `error` alone.
impl From<models::PushImageInfo> for ProgressRecord {
    fn from(info: models::PushImageInfo) -> Self {
        ProgressRecord {
            status: info.status,
            progress: info.progress,
            progress_detail: info.progress_detail.map(Into::into),
            error: info.error,
            ..Default::default()
        }
    }
}

impl From<models::CreateImageInfo> for ProgressRecord {
    fn from(info: models::CreateImageInfo) -> Self {
        ProgressRecord {
            id: info.id,
            status: info.status,
            progress: info.progress,
            progress_detail: info.progress_detail.map(Into::into),
            error: info.error,
            error_detail: info.error_detail.map(Into::into),
            ..Default::default()
        }
    }
}

impl From<models::ProgressDetail> for ProgressDetail {
    fn from(detail: models::ProgressDetail) -> Self {
        ProgressDetail {
            current: detail.current,
            total: detail.total,
        }
    }
}

impl From<models::ErrorDetail> for ErrorDetail {
    fn from(detail: models::ErrorDetail) -> Self {
        ErrorDetail {
            code: detail.code,
            message: detail.message,
        }
    }
}
