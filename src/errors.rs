use thiserror::Error;

use crate::engine::EngineError;
use crate::upload::UploadError;

/// Final verdict of one build job, decided exactly once. Cleanup and log
/// delivery run after the decision and never change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    UnexpectedError,
    UserError,
    Canceled,
}

impl ExitOutcome {
    pub fn code(self) -> i32 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::UnexpectedError => 1,
            ExitOutcome::UserError => 2,
            ExitOutcome::Canceled => 3,
        }
    }
}

/// Failures the pipeline recognizes as correctable by the repository owner.
/// Their message is the last thing the public log says before exit code 2.
#[derive(Error, Debug)]
pub enum BuildError {
    /// A hook, clone or compose command exited non-zero. The context string
    /// carries the user-facing hint.
    #[error("{context} ({code})")]
    Command { context: String, code: i32 },

    #[error("Could not execute hook at '{0}'. Is it missing a #! line?")]
    HookMissingShebang(String),

    #[error("Conflicting desired dockerfiles in {directory}: {existing}, {configured}")]
    DockerfileConflict {
        directory: String,
        existing: String,
        configured: String,
    },

    #[error("Dockerfile location '{path}' points to a directory. Perhaps this was supposed to be the build path or you meant for '{hint}' to be the dockerfile location.")]
    DockerfileIsDirectory { path: String, hint: String },

    #[error("Dockerfile not found at {0}")]
    DockerfileNotFound(String),

    #[error("Build path does not exist: {0}")]
    BuildPathMissing(String),

    /// The engine reported an error record in the build stream.
    #[error("{0}")]
    ImageBuild(String),

    /// Every push attempt was used up. Carries the last observed error text.
    #[error("{0}")]
    PushExhausted(String),

    /// The sut service of a test stack exited non-zero.
    #[error("executing {stack} ({status})")]
    TestFailed { stack: String, status: i64 },
}

/// Everything a build run can die of, split along the exit contract:
/// recognized errors surface their own message publicly with exit code 2,
/// the rest stay private behind a generic notice and exit code 1.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("{0}")]
    Upload(#[from] UploadError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub fn outcome(&self) -> ExitOutcome {
        match self {
            RunnerError::Build(_) | RunnerError::Upload(_) => ExitOutcome::UserError,
            RunnerError::Engine(_) | RunnerError::Io(_) => ExitOutcome::UnexpectedError,
        }
    }
}
