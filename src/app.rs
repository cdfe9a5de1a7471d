//! Per-app deployment orchestrator
//!
//! An [`AppManager`] owns one registered app: its git clone, its build
//! history and the currently live instance. Deploys for the same app are
//! mutually exclusive; the routing table is only touched after a new
//! instance has passed its readiness gate, and the previous instance keeps
//! serving until that moment.

use crate::config::AppDefaults;
use crate::error::AppError;
use crate::git::GitRepo;
use crate::logs::LogSink;
use crate::routing::RoutingTable;
use crate::runner::{Runner, RunnerRegistry};
use crate::sandbox::FileSandbox;
use crate::status::{Availability, BuildStatus, GitCommit};
use crate::waiter::Waiter;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One build+run attempt that passed its readiness gate
pub struct Instance {
    dir: PathBuf,
    port: u16,
    url: String,
    runner: Runner,
}

impl Instance {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

pub struct AppManager {
    name: String,
    git_url: RwLock<String>,
    repo: GitRepo,
    sandbox: FileSandbox,
    routing: Arc<RoutingTable>,
    registry: Arc<RunnerRegistry>,
    defaults: AppDefaults,
    log: LogSink,
    /// Per-app critical section: holding it serializes deploy/stop and
    /// grants access to the live instance
    current: Mutex<Option<Instance>>,
    availability: RwLock<Availability>,
    last_build: RwLock<BuildStatus>,
    last_successful: RwLock<Option<BuildStatus>>,
    deploys_in_flight: AtomicUsize,
}

impl std::fmt::Debug for AppManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppManager")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl AppManager {
    /// Register an app: validate the name, open or clone the repository and
    /// point its origin at `git_url`.
    pub async fn create(
        git_url: &str,
        sandbox: &FileSandbox,
        name: &str,
        routing: Arc<RoutingTable>,
        registry: Arc<RunnerRegistry>,
        defaults: AppDefaults,
    ) -> Result<Arc<Self>, AppError> {
        validate_name(name)?;
        sandbox.create_app_dirs(name)?;

        let repo = GitRepo::clone_or_open(git_url, &sandbox.repo_dir(name)).await?;
        let head = repo.head_commit().await;
        info!(app = name, url = git_url, "Created app manager");

        Ok(Arc::new(Self {
            name: name.to_string(),
            git_url: RwLock::new(git_url.to_string()),
            repo,
            sandbox: sandbox.clone(),
            routing,
            registry,
            defaults,
            log: LogSink::new(),
            current: Mutex::new(None),
            availability: RwLock::new(Availability::unavailable("Not started")),
            last_build: RwLock::new(BuildStatus::not_built(head)),
            last_successful: RwLock::new(None),
            deploys_in_flight: AtomicUsize::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn git_url(&self) -> String {
        self.git_url.read().clone()
    }

    pub fn availability(&self) -> Availability {
        self.availability.read().clone()
    }

    pub fn last_build(&self) -> BuildStatus {
        self.last_build.read().clone()
    }

    pub fn last_successful_build(&self) -> Option<BuildStatus> {
        self.last_successful.read().clone()
    }

    pub fn build_log(&self) -> String {
        self.log.build_log()
    }

    pub fn console_log(&self) -> String {
        self.log.console_log()
    }

    /// Number of deploys currently holding the critical section (0 or 1)
    pub fn deploys_in_flight(&self) -> usize {
        self.deploys_in_flight.load(Ordering::SeqCst)
    }

    /// Rewrite the origin remote; takes effect on the next deploy
    pub async fn update_git_url(&self, url: &str) -> Result<(), AppError> {
        self.repo.set_origin(url).await?;
        *self.git_url.write() = url.to_string();
        info!(app = %self.name, url, "Updated git URL");
        Ok(())
    }

    /// Run one deploy attempt: fetch, snapshot, build, start, readiness
    /// gate, swap, teardown of the superseded instance. Serialized per app;
    /// a concurrent call blocks until the running attempt finishes.
    ///
    /// Build, start and readiness failures are recorded in the build status
    /// and returned; they never disturb the live instance or its routing
    /// entry.
    pub async fn deploy(
        &self,
        external_log: Option<UnboundedSender<String>>,
    ) -> Result<(), AppError> {
        let mut current = self.current.lock().await;
        self.deploys_in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.deploy_locked(&mut current, external_log).await;
        self.deploys_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.log.detach();
        result
    }

    async fn deploy_locked(
        &self,
        current: &mut Option<Instance>,
        external_log: Option<UnboundedSender<String>>,
    ) -> Result<(), AppError> {
        self.log.reset(external_log);
        let start = Utc::now();
        *self.last_build.write() = BuildStatus::fetching(start);
        self.mark_starting();

        self.log.build_line("Fetching latest changes from git...");
        let instance_dir = match self.fetch_and_snapshot().await {
            Ok(dir) => dir,
            Err(e) => {
                let message = format!("Could not fetch from git: {}", e);
                self.log.build_line(&message);
                self.record_failure(start, message, None, None);
                return Err(e);
            }
        };
        self.log
            .build_line(&format!("Created new instance in {}", instance_dir.display()));

        let commit = self.repo.head_commit().await;
        let mut runner = match self.registry.resolve(&instance_dir) {
            Ok(runner) => runner,
            Err(e) => {
                self.log.build_line("No suitable runner found for this app");
                self.record_failure(start, e.to_string(), commit, None);
                return Err(e);
            }
        };
        let runner_id = runner.id().to_string();
        *self.last_build.write() = BuildStatus::building(start, commit.clone(), &runner_id);

        let port = match get_free_port() {
            Ok(port) => port,
            Err(e) => {
                self.record_failure(start, format!("Unable to get a port: {}", e), commit, Some(runner_id));
                return Err(AppError::Io(e));
            }
        };
        let env = app_env_vars(
            port,
            &self.name,
            &self.sandbox.data_dir(&self.name),
            &self.sandbox.temp_dir(&self.name),
        );
        let waiter = Waiter::wait_for_app(&self.name, port, self.defaults.startup_timeout());

        info!(app = %self.name, runner = %runner_id, port, "Building and starting new instance");
        if let Err(e) = runner.start(&self.log, &env, &waiter).await {
            self.log.build_line(&e.to_string());
            self.record_failure(start, e.to_string(), commit, Some(runner_id));
            // The runner tears its process down on failure; this is a
            // second, idempotent sweep
            runner.shutdown().await;
            return Err(e.into());
        }

        // The new instance answered; swap traffic, then retire the old one
        let url = format!("http://127.0.0.1:{}/{}", port, self.name);
        self.routing.set(&self.name, url.clone());

        let status = BuildStatus::success(start, Utc::now(), commit, &runner_id);
        *self.last_build.write() = status.clone();
        *self.last_successful.write() = Some(status);
        *self.availability.write() = Availability::available();
        info!(app = %self.name, port, "Deployment succeeded");

        let old = current.replace(Instance {
            dir: instance_dir,
            port,
            url,
            runner,
        });
        if let Some(mut old) = old {
            self.log.build_line("Shutting down previous version");
            info!(app = %self.name, old_port = old.port, "Shutting down previous version");
            old.runner.shutdown().await;
            delete_dir_in_background(old.dir);
            self.log.build_line("Deployment complete.");
        }
        Ok(())
    }

    /// Tear down the live instance and remove the routing entry.
    /// Registration and build history survive.
    pub async fn stop(&self) -> Result<(), AppError> {
        let mut current = self.current.lock().await;
        if let Some(mut instance) = current.take() {
            *self.availability.write() = Availability::unavailable("Stopping");
            instance.runner.shutdown().await;
            self.routing.remove(&self.name);
            *self.availability.write() = Availability::unavailable("Stopped");
            info!(app = %self.name, "Stopped");
        }
        Ok(())
    }

    /// Stop plus removal of every working directory for the app
    pub async fn delete(&self) -> Result<(), AppError> {
        self.stop().await?;
        for dir in self.sandbox.app_dirs(&self.name) {
            if dir.exists() {
                info!(app = %self.name, dir = %dir.display(), "Deleting");
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(app = %self.name, dir = %dir.display(), error = %e, "Failed to delete directory");
                }
            }
        }
        Ok(())
    }

    async fn fetch_and_snapshot(&self) -> Result<PathBuf, AppError> {
        self.repo.fetch_and_reset().await?;
        let dest = self.next_instance_dir();
        self.repo.snapshot_to(&dest).await?;
        Ok(dest)
    }

    fn next_instance_dir(&self) -> PathBuf {
        let base = self.sandbox.instances_dir(&self.name);
        let stamp = Utc::now().timestamp_millis();
        let mut dir = base.join(stamp.to_string());
        let mut n = 0;
        while dir.exists() {
            n += 1;
            dir = base.join(format!("{}-{}", stamp, n));
        }
        dir
    }

    fn mark_starting(&self) {
        let mut availability = self.availability.write();
        if !availability.available {
            *availability = Availability::unavailable("Starting");
        }
    }

    fn record_failure(
        &self,
        start: DateTime<Utc>,
        message: String,
        commit: Option<GitCommit>,
        runner_id: Option<String>,
    ) {
        warn!(app = %self.name, message = %message, "Deploy failed");
        *self.last_build.write() =
            BuildStatus::failure(Some(start), Utc::now(), message.clone(), commit, runner_id);
        let mut availability = self.availability.write();
        if !availability.available {
            *availability = Availability::unavailable(message);
        }
    }
}

/// Environment handed to every spawned app process
pub fn app_env_vars(
    port: u16,
    name: &str,
    data_dir: &Path,
    temp_dir: &Path,
) -> HashMap<String, String> {
    HashMap::from([
        ("APP_PORT".to_string(), port.to_string()),
        ("APP_NAME".to_string(), name.to_string()),
        ("APP_ENV".to_string(), "prod".to_string()),
        ("APP_DATA".to_string(), data_dir.display().to_string()),
        ("TEMP".to_string(), temp_dir.display().to_string()),
    ])
}

/// App names are path segments and env values; keep them boring
pub fn validate_name(name: &str) -> Result<(), AppError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(
            "The app name can only contain letters, numbers, hyphens and underscores".to_string(),
        ))
    }
}

/// Ask the OS for a free ephemeral port
pub fn get_free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn delete_dir_in_background(dir: PathBuf) {
    tokio::spawn(async move {
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!(dir = %dir.display(), "Deleted old instance directory"),
            // Not a problem: leftovers are swept on the next host start
            Err(e) => info!(dir = %dir.display(), error = %e, "Could not delete old instance directory"),
        }
    });
}
