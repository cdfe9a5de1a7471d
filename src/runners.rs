//! Built-in runner implementations
//!
//! Each runner follows the same sequence: build steps through the
//! supervisor's blocking mode, then the run command as a supervised daemon,
//! then block on the readiness waiter. The runner owns the daemon handle for
//! the lifetime of its instance.

use crate::config::AppDefaults;
use crate::error::StartError;
use crate::logs::LogSink;
use crate::process::{run_blocking, run_capture, start_daemon, CommandSpec, DaemonHandle, ProcessError};
use crate::waiter::Waiter;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for one build step
const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Upper bound for toolchain version probes
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

async fn build_step(spec: CommandSpec, sink: &LogSink) -> Result<(), StartError> {
    run_blocking(&spec, sink, BUILD_TIMEOUT)
        .await
        .map_err(|e| StartError::Build(e.to_string()))
}

/// Spawn the run command and gate on readiness. A timed-out instance is torn
/// down before the error is returned so no orphan process survives a failed
/// deploy.
async fn launch(
    spec: CommandSpec,
    sink: &LogSink,
    waiter: &Waiter,
    daemon_grace: Duration,
    stop_grace: Duration,
) -> Result<DaemonHandle, StartError> {
    let mut handle = start_daemon(&spec, sink, daemon_grace).await.map_err(|e| {
        sink.build_line(&e.to_string());
        match e {
            ProcessError::CrashedOnStart { .. } => StartError::CrashedOnStart(e.to_string()),
            other => StartError::Build(other.to_string()),
        }
    })?;

    if waiter.block_until_ready().await.is_err() {
        sink.build_line("Built successfully, but timed out waiting for startup");
        handle.terminate(stop_grace).await;
        return Err(StartError::TimedOut);
    }
    Ok(handle)
}

async fn probe_versions(probes: &[(&str, &str)]) -> String {
    let mut parts = Vec::new();
    for (program, arg) in probes {
        let spec = CommandSpec::new(*program, ".").arg(*arg);
        match run_capture(&spec, VERSION_PROBE_TIMEOUT).await {
            Ok(out) => parts.push(format!("{} {}", program, out.lines().next().unwrap_or(""))),
            Err(_) => return "Not available".to_string(),
        }
    }
    parts.join(", ")
}

/// Runs apps with a `package.json`: `npm install`, then `node server.js`
pub struct NodeRunner {
    project_root: PathBuf,
    daemon_grace: Duration,
    stop_grace: Duration,
    handle: Option<DaemonHandle>,
}

impl NodeRunner {
    pub(crate) fn new(project_root: &Path, defaults: &AppDefaults) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            daemon_grace: defaults.daemon_grace(),
            stop_grace: defaults.shutdown_grace(),
            handle: None,
        }
    }

    pub fn instance_dir(&self) -> &Path {
        &self.project_root
    }

    pub async fn start(
        &mut self,
        sink: &LogSink,
        env: &HashMap<String, String>,
        waiter: &Waiter,
    ) -> Result<(), StartError> {
        sink.build_line("Running npm install");
        build_step(
            CommandSpec::new("npm", &self.project_root).arg("install").envs(env),
            sink,
        )
        .await?;

        let run = CommandSpec::new("node", &self.project_root)
            .arg("server.js")
            .envs(env);
        self.handle = Some(launch(run, sink, waiter, self.daemon_grace, self.stop_grace).await?);
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.terminate(self.stop_grace).await;
        }
    }

    pub async fn version_info() -> String {
        probe_versions(&[("node", "--version"), ("npm", "--version")]).await
    }
}

/// Runs apps with a `server.py`/`server3.py`: venv, optional pip install,
/// then the venv python against the server script
pub struct PythonRunner {
    project_root: PathBuf,
    daemon_grace: Duration,
    stop_grace: Duration,
    handle: Option<DaemonHandle>,
}

/// Directory name of the per-instance virtualenv
const VENV_DIR: &str = "server";

impl PythonRunner {
    pub(crate) fn new(project_root: &Path, defaults: &AppDefaults) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            daemon_grace: defaults.daemon_grace(),
            stop_grace: defaults.shutdown_grace(),
            handle: None,
        }
    }

    pub fn instance_dir(&self) -> &Path {
        &self.project_root
    }

    fn script_name(&self) -> &'static str {
        if self.project_root.join("server3.py").is_file() {
            "server3.py"
        } else {
            "server.py"
        }
    }

    pub async fn start(
        &mut self,
        sink: &LogSink,
        env: &HashMap<String, String>,
        waiter: &Waiter,
    ) -> Result<(), StartError> {
        // A dependency-free app runs on the system interpreter; a venv is
        // only built when there is something to install into it
        let python = if self.project_root.join("requirements.txt").is_file() {
            sink.build_line("Creating virtualenv");
            build_step(
                CommandSpec::new("python3", &self.project_root)
                    .args(["-m", "venv", VENV_DIR])
                    .envs(env),
                sink,
            )
            .await?;

            let venv_bin = self.project_root.join(VENV_DIR).join("bin");
            sink.build_line("Installing dependencies from requirements.txt");
            build_step(
                CommandSpec::new(venv_bin.join("pip").to_string_lossy(), &self.project_root)
                    .args(["install", "-r", "requirements.txt"])
                    .envs(env),
                sink,
            )
            .await?;
            venv_bin.join("python").to_string_lossy().into_owned()
        } else {
            sink.build_line("No requirements.txt; using the system interpreter");
            "python3".to_string()
        };

        let run = CommandSpec::new(python, &self.project_root)
            .arg(self.script_name())
            .envs(env);
        self.handle = Some(launch(run, sink, waiter, self.daemon_grace, self.stop_grace).await?);
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.terminate(self.stop_grace).await;
        }
    }

    pub async fn version_info() -> String {
        probe_versions(&[("python3", "--version")]).await
    }
}

/// Runs apps with a `go.mod`: `go build -o app .`, then `./app`
pub struct GoRunner {
    project_root: PathBuf,
    daemon_grace: Duration,
    stop_grace: Duration,
    handle: Option<DaemonHandle>,
}

impl GoRunner {
    pub(crate) fn new(project_root: &Path, defaults: &AppDefaults) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            daemon_grace: defaults.daemon_grace(),
            stop_grace: defaults.shutdown_grace(),
            handle: None,
        }
    }

    pub fn instance_dir(&self) -> &Path {
        &self.project_root
    }

    pub async fn start(
        &mut self,
        sink: &LogSink,
        env: &HashMap<String, String>,
        waiter: &Waiter,
    ) -> Result<(), StartError> {
        sink.build_line("Running go build");
        build_step(
            CommandSpec::new("go", &self.project_root)
                .args(["build", "-o", "app", "."])
                .envs(env),
            sink,
        )
        .await?;

        let run = CommandSpec::new(
            self.project_root.join("app").to_string_lossy(),
            &self.project_root,
        )
        .envs(env);
        self.handle = Some(launch(run, sink, waiter, self.daemon_grace, self.stop_grace).await?);
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.terminate(self.stop_grace).await;
        }
    }

    pub async fn version_info() -> String {
        probe_versions(&[("go", "version")]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_script_detection_prefers_server3() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = PythonRunner::new(tmp.path(), &AppDefaults::default());
        assert_eq!(runner.script_name(), "server.py");

        std::fs::write(tmp.path().join("server3.py"), "").unwrap();
        assert_eq!(runner.script_name(), "server3.py");
    }

    #[tokio::test]
    async fn test_shutdown_without_start_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runner = NodeRunner::new(tmp.path(), &AppDefaults::default());
        runner.shutdown().await;
        runner.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_versions_not_available_for_missing_tool() {
        let out = probe_versions(&[("definitely-not-a-real-tool-xyz", "--version")]).await;
        assert_eq!(out, "Not available");
    }
}
