//! Runner contract and registry
//!
//! A runner is the per-ecosystem build+run strategy for one instance
//! directory. The set of runners is a closed list of variants behind one
//! capability surface: detect, build+start, shutdown, version info.
//! Discovery is an explicit ordered list where the first matching detector
//! wins.

use crate::config::AppDefaults;
use crate::error::{AppError, StartError};
use crate::logs::LogSink;
use crate::runners::{GoRunner, NodeRunner, PythonRunner};
use crate::waiter::Waiter;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// One build+run strategy bound to an instance directory
pub enum Runner {
    Node(NodeRunner),
    Python(PythonRunner),
    Go(GoRunner),
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Runner({})", self.id())
    }
}

impl Runner {
    pub fn id(&self) -> &'static str {
        match self {
            Runner::Node(_) => "node",
            Runner::Python(_) => "python",
            Runner::Go(_) => "golang",
        }
    }

    pub fn instance_dir(&self) -> &Path {
        match self {
            Runner::Node(r) => r.instance_dir(),
            Runner::Python(r) => r.instance_dir(),
            Runner::Go(r) => r.instance_dir(),
        }
    }

    /// Run the build steps, spawn the app process and block on the waiter.
    /// All failures surface as a [`StartError`].
    pub async fn start(
        &mut self,
        sink: &LogSink,
        env: &HashMap<String, String>,
        waiter: &Waiter,
    ) -> Result<(), StartError> {
        match self {
            Runner::Node(r) => r.start(sink, env, waiter).await,
            Runner::Python(r) => r.start(sink, env, waiter).await,
            Runner::Go(r) => r.start(sink, env, waiter).await,
        }
    }

    /// Tear down the app process. Idempotent; never fails.
    pub async fn shutdown(&mut self) {
        match self {
            Runner::Node(r) => r.shutdown().await,
            Runner::Python(r) => r.shutdown().await,
            Runner::Go(r) => r.shutdown().await,
        }
    }
}

/// The closed set of available runner kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Node,
    Python,
    Go,
}

impl RunnerKind {
    pub fn id(&self) -> &'static str {
        match self {
            RunnerKind::Node => "node",
            RunnerKind::Python => "python",
            RunnerKind::Go => "golang",
        }
    }

    /// Whether a project directory looks like this ecosystem
    pub fn matches(&self, dir: &Path) -> bool {
        match self {
            RunnerKind::Node => dir.join("package.json").is_file(),
            RunnerKind::Python => {
                dir.join("server.py").is_file() || dir.join("server3.py").is_file()
            }
            RunnerKind::Go => dir.join("go.mod").is_file(),
        }
    }

    fn create(&self, dir: &Path, defaults: &AppDefaults) -> Runner {
        match self {
            RunnerKind::Node => Runner::Node(NodeRunner::new(dir, defaults)),
            RunnerKind::Python => Runner::Python(PythonRunner::new(dir, defaults)),
            RunnerKind::Go => Runner::Go(GoRunner::new(dir, defaults)),
        }
    }

    /// Toolchain version line for startup logs, or a not-available marker
    pub async fn version_info(&self) -> String {
        match self {
            RunnerKind::Node => NodeRunner::version_info().await,
            RunnerKind::Python => PythonRunner::version_info().await,
            RunnerKind::Go => GoRunner::version_info().await,
        }
    }
}

/// Ordered list of available runners; first matching detector wins
pub struct RunnerRegistry {
    kinds: Vec<RunnerKind>,
    defaults: AppDefaults,
}

impl RunnerRegistry {
    pub fn new(kinds: Vec<RunnerKind>, defaults: AppDefaults) -> Self {
        Self { kinds, defaults }
    }

    /// Registry with every built-in runner in fixed priority order
    pub fn with_defaults(defaults: AppDefaults) -> Self {
        Self::new(
            vec![RunnerKind::Node, RunnerKind::Python, RunnerKind::Go],
            defaults,
        )
    }

    /// Pick the first runner whose detector matches the project directory
    pub fn resolve(&self, project_dir: &Path) -> Result<Runner, AppError> {
        for kind in &self.kinds {
            if kind.matches(project_dir) {
                info!(runner = kind.id(), dir = %project_dir.display(), "Runner selected");
                return Ok(kind.create(project_dir, &self.defaults));
            }
        }
        Err(AppError::UnsupportedProjectType(
            project_dir.display().to_string(),
        ))
    }

    /// One version line per registered runner
    pub async fn describe(&self) -> String {
        let mut lines = Vec::new();
        for kind in &self.kinds {
            lines.push(format!("{}: {}", kind.id(), kind.version_info().await));
        }
        lines.join("\n")
    }
}
