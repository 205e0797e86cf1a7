use std::sync::Arc;
use std::time::Instant;

use crate::build;
use crate::cleanup::{self, ResourceSnapshot};
use crate::config::BuildConfig;
use crate::docker::DockerConnector;
use crate::engine::{BuildRequest, ContainerEngine, EngineConnector, EngineError};
use crate::errors::{ExitOutcome, RunnerError};
use crate::hooks::Hooks;
use crate::logs::{LogSink, Step};
use crate::metrics::Metrics;
use crate::registry;
use crate::startup::{self, BuildLayout};
use crate::sut;
use crate::upload::{self, HttpUploader, Uploader};
use crate::vcs::{CloneDetails, CommandLineFetcher, SourceFetcher};

/// Drives one build job through the fixed stage sequence: setup, pull,
/// build, test, push, cleanup. Collaborators are injected so tests can run
/// the whole pipeline in memory.
pub struct BuildRunner {
    cfg: BuildConfig,
    sink: Arc<LogSink>,
    fetcher: Box<dyn SourceFetcher>,
    uploader: Box<dyn Uploader>,
    connector: Box<dyn EngineConnector>,
    engine: Option<Box<dyn ContainerEngine>>,
    snapshot: Option<ResourceSnapshot>,
}

/// What setup hands the later stages.
struct StageContext {
    hooks: Hooks,
    layout: BuildLayout,
}

impl BuildRunner {
    pub fn new(cfg: BuildConfig, sink: Arc<LogSink>) -> Self {
        let fetcher = CommandLineFetcher::new(cfg.ssh_key_path.clone());
        Self::with_collaborators(
            cfg,
            sink,
            Box::new(fetcher),
            Box::new(HttpUploader::new()),
            Box::new(DockerConnector),
        )
    }

    pub fn with_collaborators(
        cfg: BuildConfig,
        sink: Arc<LogSink>,
        fetcher: Box<dyn SourceFetcher>,
        uploader: Box<dyn Uploader>,
        connector: Box<dyn EngineConnector>,
    ) -> Self {
        BuildRunner {
            cfg,
            sink,
            fetcher,
            uploader,
            connector,
            engine: None,
            snapshot: None,
        }
    }

    /// Run the job to completion and deliver the log artifacts. The
    /// outcome is decided before delivery and never changed by it.
    pub async fn run(mut self) -> ExitOutcome {
        let outcome = self.execute().await;
        upload::deliver_logs(self.uploader.as_ref(), &self.cfg, &self.sink).await;
        outcome
    }

    async fn execute(&mut self) -> ExitOutcome {
        let result = self.run_stages().await;
        self.cleanup().await;
        match result {
            Ok(()) => ExitOutcome::Success,
            Err(err) => self.report_failure(&err),
        }
    }

    async fn run_stages(&mut self) -> Result<(), RunnerError> {
        let context = self.setup().await?;
        self.pull().await?;
        self.build(&context).await?;
        self.test(&context).await?;
        self.push(&context).await?;
        self.sink.public("Build finished");
        Ok(())
    }

    async fn setup(&mut self) -> Result<StageContext, RunnerError> {
        self.sink.set_step(Step::Setup);
        match &self.cfg.node_label {
            Some(node) => {
                self.sink
                    .public(&format!("Building in user node '{node}'..."))
            }
            None => self.sink.public("Building on shared infrastructure..."),
        }

        let workdir = self.cfg.workdir();
        startup::prepare_workdir(&workdir)?;
        let details = self
            .fetcher
            .fetch(&self.cfg.source, &workdir, &self.sink)
            .await?;
        self.sink.private("Cloning done");

        let (build_dir, dockerfile) =
            startup::resolve_dockerfile(&workdir, &self.cfg.build_path, &self.cfg.dockerfile_path)?;
        let dockerfile_dir = startup::dockerfile_dir(&build_dir, &dockerfile);
        self.sink.private("Getting README");
        let readme = startup::resolve_readme(&build_dir, &dockerfile_dir, &workdir);
        let layout = BuildLayout {
            build_dir,
            dockerfile,
            dockerfile_dir,
            readme,
        };

        self.sink.private("Getting Dockerfile");
        if let Some(spec) = &self.cfg.signed_urls.post.dockerfile {
            let dockerfile_path = layout.build_dir.join(&layout.dockerfile);
            upload::deliver(
                self.uploader.as_ref(),
                spec,
                &dockerfile_path,
                self.cfg.attempts,
                &self.sink,
            )
            .await?;
        }
        if let (Some(spec), Some(readme)) = (&self.cfg.signed_urls.post.readme, &layout.readme) {
            upload::deliver(
                self.uploader.as_ref(),
                spec,
                readme,
                self.cfg.attempts,
                &self.sink,
            )
            .await?;
        }

        let hooks = Hooks::prepare(&layout.dockerfile_dir, hook_env(&self.cfg, &details))?;
        hooks.run("post_checkout", &self.sink).await?;

        let engine = self.connector.connect(&self.cfg).await?;
        self.snapshot = Some(cleanup::snapshot(engine.as_ref()).await?);
        self.engine = Some(engine);

        Ok(StageContext { hooks, layout })
    }

    async fn pull(&self) -> Result<(), RunnerError> {
        let Some(cache_tag) = self.cfg.cache_tag.clone() else {
            return Ok(());
        };
        self.sink.set_step(Step::Pull);
        self.sink.public(&format!(
            "Pulling cache layers for {}:{}...",
            self.cfg.repo, cache_tag
        ));
        registry::pull(
            self.engine()?,
            &self.cfg.repo,
            &cache_tag,
            self.cfg.attempts,
            registry::RETRY_DELAY,
            &self.sink,
        )
        .await;
        self.sink.public("Done!");
        Ok(())
    }

    async fn build(&self, context: &StageContext) -> Result<(), RunnerError> {
        self.sink.set_step(Step::Build);
        let started = Instant::now();
        let result = self.build_inner(context).await;
        let state = if result.is_ok() { "success" } else { "failure" };
        Metrics::new(&self.sink).timing(
            "build_duration_seconds",
            started.elapsed().as_secs_f64(),
            &[("state", state)],
        );
        result
    }

    async fn build_inner(&self, context: &StageContext) -> Result<(), RunnerError> {
        context.hooks.run("pre_build", &self.sink).await?;
        if !context.hooks.run("build", &self.sink).await? {
            let engine = self.engine()?;
            build::log_engine_version(engine, &self.sink).await?;
            let request = BuildRequest {
                context_dir: context.layout.build_dir.clone(),
                dockerfile: context.layout.dockerfile.clone(),
                tag: self.cfg.image_name(),
                cache_from: self.cfg.cache_image_name(),
            };
            build::build_image(engine, request, &self.sink).await?;
            build::multitag(
                engine,
                &self.cfg.image_name(),
                &self.cfg.repo,
                &self.cfg.tags[1..],
            )
            .await?;
            build::add_alias_tag(engine, &self.cfg.image_name()).await?;
        }
        context.hooks.run("post_build", &self.sink).await?;
        Ok(())
    }

    async fn test(&self, context: &StageContext) -> Result<(), RunnerError> {
        self.sink.set_step(Step::Test);
        context.hooks.run("pre_test", &self.sink).await?;
        if !context.hooks.run("test", &self.sink).await? {
            sut::run_all(
                self.engine()?,
                &context.layout.dockerfile_dir,
                &self.cfg.build_code,
                &self.sink,
            )
            .await?;
        }
        context.hooks.run("post_test", &self.sink).await?;
        Ok(())
    }

    async fn push(&self, context: &StageContext) -> Result<(), RunnerError> {
        if !self.cfg.push {
            return Ok(());
        }
        self.sink.set_step(Step::Push);
        self.sink.private("Starting Push");
        context.hooks.run("pre_push", &self.sink).await?;
        if !context.hooks.run("push", &self.sink).await? {
            self.sink
                .public(&format!("Pushing {}...", self.cfg.image_name()));
            registry::push(
                self.engine()?,
                &self.cfg.repo,
                &self.cfg.tags,
                self.cfg.attempts,
                registry::RETRY_DELAY,
                &self.sink,
            )
            .await?;
            self.sink.public("Done!");
        }
        context.hooks.run("post_push", &self.sink).await?;
        Ok(())
    }

    /// Always runs, whatever the stages decided. Failures here are logged
    /// and swallowed so they cannot overwrite the outcome.
    async fn cleanup(&mut self) {
        self.sink.set_step(Step::Cleanup);
        if let Err(err) = cleanup::remove_workdir(&self.cfg.workdir()) {
            self.sink
                .private(&format!("Unexpected error while cleaning up: {err}"));
        }
        if let (Some(engine), Some(snapshot)) = (&self.engine, &self.snapshot) {
            if let Err(err) = cleanup::remove_introduced(engine.as_ref(), snapshot, &self.sink).await
            {
                self.sink
                    .private(&format!("Unexpected error while cleaning up: {err}"));
            }
        }
    }

    /// Recognized errors speak for themselves in the public log; anything
    /// else stays behind a generic notice with the detail kept private.
    fn report_failure(&self, err: &RunnerError) -> ExitOutcome {
        let outcome = err.outcome();
        if outcome == ExitOutcome::UserError {
            self.sink.public(&err.to_string());
        } else {
            self.sink.public("Unexpected error");
            self.sink.private(&format!("Encountered error: {err:?}"));
        }
        outcome
    }

    fn engine(&self) -> Result<&dyn ContainerEngine, RunnerError> {
        self.engine
            .as_deref()
            .ok_or(RunnerError::Engine(EngineError::NotConnected))
    }
}

/// Environment the hook scripts see, fixed once the clone has landed.
fn hook_env(cfg: &BuildConfig, details: &CloneDetails) -> Vec<(String, String)> {
    let mut env = vec![("IMAGE_NAME".to_string(), cfg.image_name())];
    if let Some(commit) = &details.commit {
        env.push(("GIT_SHA1".to_string(), commit.clone()));
    }
    if let Some(message) = &details.message {
        env.push(("GIT_MSG".to_string(), message.clone()));
        env.push(("COMMIT_MSG".to_string(), message.clone()));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;
    use clap::Parser;

    use crate::config::{Cli, PostSpec, Source};
    use crate::upload::AttemptError;

    struct NoFetch;

    #[async_trait]
    impl SourceFetcher for NoFetch {
        async fn fetch(
            &self,
            _source: &Source,
            _workdir: &Path,
            _sink: &LogSink,
        ) -> Result<CloneDetails, RunnerError> {
            Ok(CloneDetails::default())
        }
    }

    struct NoUpload;

    #[async_trait]
    impl Uploader for NoUpload {
        async fn post_file(
            &self,
            _spec: &PostSpec,
            _body: Vec<u8>,
            _file_name: &str,
        ) -> Result<(), AttemptError> {
            Ok(())
        }
    }

    struct NoConnect;

    #[async_trait]
    impl EngineConnector for NoConnect {
        async fn connect(
            &self,
            _cfg: &BuildConfig,
        ) -> Result<Box<dyn ContainerEngine>, EngineError> {
            Err(EngineError::NotConnected)
        }
    }

    fn test_runner(work_root: &Path, log_dir: &Path) -> BuildRunner {
        let cli = Cli::parse_from([
            "builder",
            "--build-code",
            "job1",
            "--docker-repo",
            "acme/app",
            "--source-type",
            "git",
            "--source-url",
            "https://github.com/acme/app.git",
            "--docker-host",
            "tcp://10.0.0.1:2375",
            "--work-root",
            &work_root.display().to_string(),
            "--log-dir",
            &log_dir.display().to_string(),
        ]);
        let cfg = BuildConfig::new(cli).unwrap();
        let sink = Arc::new(LogSink::open(log_dir, 100_000, None).unwrap());
        BuildRunner::with_collaborators(
            cfg,
            sink,
            Box::new(NoFetch),
            Box::new(NoUpload),
            Box::new(NoConnect),
        )
    }

    #[tokio::test]
    async fn test_recognized_failures_speak_publicly() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let runner = test_runner(root.path(), logs.path());

        let err = RunnerError::from(crate::errors::BuildError::DockerfileNotFound(
            "/src/job1/Dockerfile".to_string(),
        ));
        assert_eq!(runner.report_failure(&err), ExitOutcome::UserError);

        let public = std::fs::read_to_string(runner.sink.public_path()).unwrap();
        assert!(public.contains("Dockerfile not found at /src/job1/Dockerfile"));
    }

    #[tokio::test]
    async fn test_unexpected_failures_stay_private() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let runner = test_runner(root.path(), logs.path());

        let err = RunnerError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk died"));
        assert_eq!(runner.report_failure(&err), ExitOutcome::UnexpectedError);

        let public = std::fs::read_to_string(runner.sink.public_path()).unwrap();
        assert!(public.contains("Unexpected error"));
        assert!(!public.contains("disk died"));
        let private = std::fs::read_to_string(runner.sink.private_path()).unwrap();
        assert!(private.contains("Encountered error:"));
        assert!(private.contains("disk died"));
    }

    #[tokio::test]
    async fn test_cleanup_without_an_engine_still_removes_the_workdir() {
        let root = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let mut runner = test_runner(root.path(), logs.path());

        let workdir = runner.cfg.workdir();
        std::fs::create_dir_all(workdir.join("checkout")).unwrap();
        runner.cleanup().await;

        assert!(!workdir.exists());
        assert_eq!(runner.sink.step(), Step::Cleanup);
    }

    #[test]
    fn test_hook_environment_carries_clone_details() {
        let cli = Cli::parse_from([
            "builder",
            "--build-code",
            "job1",
            "--docker-repo",
            "acme/app",
            "--source-type",
            "git",
            "--source-url",
            "https://github.com/acme/app.git",
            "--docker-host",
            "tcp://10.0.0.1:2375",
        ]);
        let cfg = BuildConfig::new(cli).unwrap();

        let details = CloneDetails {
            commit: Some("cafe12".to_string()),
            message: Some("fix the build".to_string()),
        };
        let env = hook_env(&cfg, &details);
        assert!(env.contains(&("IMAGE_NAME".to_string(), "acme/app:latest".to_string())));
        assert!(env.contains(&("GIT_SHA1".to_string(), "cafe12".to_string())));
        assert!(env.contains(&("GIT_MSG".to_string(), "fix the build".to_string())));
        assert!(env.contains(&("COMMIT_MSG".to_string(), "fix the build".to_string())));

        let env = hook_env(&cfg, &CloneDetails::default());
        assert_eq!(env.len(), 1);
    }
}
