//! The estate: every registered app and the dispatch onto its manager
//!
//! An explicitly owned registry injected where it is needed, never a global.
//! Synchronization is per app manager; the estate itself only needs its
//! concurrent map.

use crate::app::AppManager;
use crate::config::AppDefaults;
use crate::error::AppError;
use crate::routing::RoutingTable;
use crate::runner::RunnerRegistry;
use crate::sandbox::FileSandbox;
use crate::store::GitRepoLoader;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

pub struct AppEstate {
    apps: DashMap<String, Arc<AppManager>>,
    routing: Arc<RoutingTable>,
    registry: Arc<RunnerRegistry>,
    sandbox: FileSandbox,
    loader: Arc<dyn GitRepoLoader>,
    defaults: AppDefaults,
}

impl AppEstate {
    pub fn new(
        routing: Arc<RoutingTable>,
        registry: Arc<RunnerRegistry>,
        sandbox: FileSandbox,
        loader: Arc<dyn GitRepoLoader>,
        defaults: AppDefaults,
    ) -> Self {
        Self {
            apps: DashMap::new(),
            routing,
            registry,
            sandbox,
            loader,
            defaults,
        }
    }

    pub fn routing(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.routing)
    }

    /// Reconstruct managers for previously registered apps. A broken entry
    /// is logged and skipped so one bad repo cannot block the others.
    pub async fn load_registered(&self) {
        let entries = match self.loader.load_all() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to load app registry");
                return;
            }
        };
        for (name, git_url) in entries {
            match self.register(&git_url, &name).await {
                Ok(_) => info!(app = %name, "Restored registered app"),
                Err(e) => warn!(app = %name, error = %e, "Skipping app that failed to restore"),
            }
        }
    }

    /// Register a new app. The name defaults to the last segment of the git
    /// URL. Fails if the name is taken, the clone fails, or no runner
    /// recognizes the project.
    pub async fn add_app(
        &self,
        git_url: &str,
        name: Option<&str>,
    ) -> Result<Arc<AppManager>, AppError> {
        let derived;
        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => {
                derived = name_from_url(git_url);
                &derived
            }
        };

        if self.apps.contains_key(name) {
            return Err(AppError::AppExists(name.to_string()));
        }

        let manager = self.create_manager(git_url, name).await?;

        // Reject registrations this host could never deploy
        self.registry.resolve(&self.sandbox.repo_dir(name))?;

        match self.apps.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(AppError::AppExists(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&manager));
            }
        }
        if let Err(e) = self.loader.save(name, git_url) {
            error!(app = %name, error = %e, "Failed to persist app registration");
        }
        Ok(manager)
    }

    /// Reconstruct one app from a persisted registration; no runner check,
    /// the project may gain or lose a matching runner between boots
    async fn register(&self, git_url: &str, name: &str) -> Result<Arc<AppManager>, AppError> {
        let manager = self.create_manager(git_url, name).await?;
        self.apps.insert(name.to_string(), Arc::clone(&manager));
        Ok(manager)
    }

    async fn create_manager(&self, git_url: &str, name: &str) -> Result<Arc<AppManager>, AppError> {
        AppManager::create(
            git_url,
            &self.sandbox,
            name,
            Arc::clone(&self.routing),
            Arc::clone(&self.registry),
            self.defaults.clone(),
        )
        .await
    }

    pub fn app(&self, name: &str) -> Option<Arc<AppManager>> {
        self.apps.get(name).map(|e| Arc::clone(e.value()))
    }

    fn named(&self, name: &str) -> Result<Arc<AppManager>, AppError> {
        self.app(name)
            .ok_or_else(|| AppError::AppNotFound(name.to_string()))
    }

    /// All apps sorted by name
    pub fn all(&self) -> Vec<Arc<AppManager>> {
        let mut apps: Vec<_> = self.apps.iter().map(|e| Arc::clone(e.value())).collect();
        apps.sort_by(|a, b| a.name().cmp(b.name()));
        apps
    }

    /// Apps in boot order: case-insensitive alpha, with the preferred app
    /// (when present) moved to the front
    pub fn apps_by_startup_order(&self, preferred_first: Option<&str>) -> Vec<Arc<AppManager>> {
        let mut apps: Vec<_> = self.apps.iter().map(|e| Arc::clone(e.value())).collect();
        apps.sort_by(|a, b| a.name().to_lowercase().cmp(&b.name().to_lowercase()));
        if let Some(preferred) = preferred_first {
            if let Some(idx) = apps
                .iter()
                .position(|a| a.name().eq_ignore_ascii_case(preferred))
            {
                let first = apps.remove(idx);
                apps.insert(0, first);
            }
        }
        apps
    }

    pub async fn deploy(
        &self,
        name: &str,
        external_log: Option<UnboundedSender<String>>,
    ) -> Result<(), AppError> {
        self.named(name)?.deploy(external_log).await
    }

    pub async fn stop(&self, name: &str) -> Result<(), AppError> {
        self.named(name)?.stop().await
    }

    pub async fn update_git_url(&self, name: &str, git_url: &str) -> Result<(), AppError> {
        let manager = self.named(name)?;
        manager.update_git_url(git_url).await?;
        if let Err(e) = self.loader.save(name, git_url) {
            error!(app = %name, error = %e, "Failed to persist git URL update");
        }
        Ok(())
    }

    /// Stop the app, delete its directories and forget the registration
    pub async fn remove(&self, name: &str) -> Result<Arc<AppManager>, AppError> {
        let manager = self.named(name)?;
        manager.delete().await?;
        if let Err(e) = self.loader.delete(name) {
            error!(app = %name, error = %e, "Failed to remove app from registry");
        }
        self.apps.remove(name);
        Ok(manager)
    }

    /// Stop every app; a failure stopping one never blocks the rest
    pub async fn shutdown_all(&self) {
        for manager in self.all() {
            info!(app = %manager.name(), "Stopping");
            if let Err(e) = manager.stop().await {
                warn!(app = %manager.name(), error = %e, "Error while stopping app");
            }
        }
    }
}

/// Derive an app name from its git URL: last path segment, `.git` stripped
pub fn name_from_url(git_url: &str) -> String {
    let trimmed = git_url.trim_end_matches('/');
    let trimmed = if trimmed.len() >= 4 && trimmed[trimmed.len() - 4..].eq_ignore_ascii_case(".git")
    {
        &trimmed[..trimmed.len() - 4]
    } else {
        trimmed
    };
    let cut = trimmed
        .rfind(['/', '\\'])
        .map(|idx| idx + 1)
        .unwrap_or(0);
    trimmed[cut..].to_string()
}
