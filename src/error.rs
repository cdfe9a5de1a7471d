//! Error taxonomy for the app host

use hyper::StatusCode;
use thiserror::Error;

/// Errors surfaced by estate and app-manager operations.
///
/// Each variant maps to an HTTP status for the REST layer; build/start
/// failures are the exception and are contained in the build status and log
/// rather than becoming a distinct HTTP failure.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad input such as an invalid app name or a missing git URL
    #[error("{0}")]
    Validation(String),

    /// An app with the requested name is already registered
    #[error("there is already an app with the name '{0}'")]
    AppExists(String),

    /// No app registered under the given name
    #[error("no app found with name '{0}'")]
    AppNotFound(String),

    /// No runner recognizes the project layout
    #[error("no suitable runner found for {0}")]
    UnsupportedProjectType(String),

    /// Clone/fetch/reset failure from the git CLI
    #[error("git error: {0}")]
    Git(String),

    /// A deploy attempt failed to build, start or become ready
    #[error("{0}")]
    BuildOrStart(#[from] StartError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// HTTP status the REST layer reports for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Git(_) => StatusCode::BAD_REQUEST,
            AppError::AppExists(_) => StatusCode::CONFLICT,
            AppError::AppNotFound(_) => StatusCode::NOT_FOUND,
            AppError::UnsupportedProjectType(_) => StatusCode::NOT_IMPLEMENTED,
            // Contained by the deploy flow; only reaches HTTP if something
            // else is broken
            AppError::BuildOrStart(_) | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The single failure type for a runner's build+start sequence
#[derive(Debug, Error)]
pub enum StartError {
    /// A build step exited non-zero, timed out or could not be spawned
    #[error("{0}")]
    Build(String),

    /// The run command exited during the crash-on-start grace window
    #[error("crashed during startup: {0}")]
    CrashedOnStart(String),

    /// The instance never answered the readiness probe in time
    #[error("built successfully, but timed out waiting for startup")]
    TimedOut,
}
