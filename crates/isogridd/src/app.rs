//! Subsystem assembly over one store.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use isogrid_core::IsoGridConfig;
use isogrid_graph::{DependencyGraph, DnsCache};
use isogrid_isolation::local::{
    LocalBuilds, LogNotifier, MemoryUsers, OutboxQueue, OwnerPermissions, PinnedSourceControl,
};
use isogrid_isolation::{
    AutoIsolationTrigger, Collaborators, IsolationService, LifecycleMonitor, SessionUser,
    UserDirectory,
};
use isogrid_state::{GithubId, StateStore};

/// Everything a subcommand needs.
pub struct App {
    pub store: StateStore,
    pub service: IsolationService,
    pub monitor: LifecycleMonitor,
    pub trigger: AutoIsolationTrigger,
    pub outbox: OutboxQueue,
    users: MemoryUsers,
}

impl App {
    /// Open the configured on-disk store and assemble around it.
    pub fn open(config: &IsoGridConfig) -> anyhow::Result<Self> {
        let path = &config.store.path;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating store directory {}", dir.display()))?;
        }
        let store = StateStore::open(path)?;
        info!(path = ?path, "state store opened");
        Self::with_store(config, store)
    }

    pub fn with_store(config: &IsoGridConfig, store: StateStore) -> anyhow::Result<Self> {
        let scheme = config.hostname_scheme()?;
        let graph = DependencyGraph::new(store.clone(), scheme, DnsCache::new());
        let outbox = OutboxQueue::new(store.clone());
        let users = MemoryUsers::new(config.users.iter().map(|u| SessionUser {
            github_id: u.github_id,
            username: u.username.clone(),
            org_ids: u.org_ids.clone(),
        }));

        let collaborators = Collaborators {
            source_control: Arc::new(PinnedSourceControl::new(
                config.source_control.branches.clone(),
            )),
            builds: Arc::new(LocalBuilds::new()),
            queue: Arc::new(outbox.clone()),
            notifier: Arc::new(LogNotifier),
            permissions: Arc::new(OwnerPermissions),
            users: Arc::new(users.clone()),
        };
        let service = IsolationService::new(store.clone(), graph, collaborators);

        Ok(Self {
            monitor: LifecycleMonitor::new(service.clone()),
            trigger: AutoIsolationTrigger::new(service.clone()),
            store,
            service,
            outbox,
            users,
        })
    }

    /// Resolve a locally configured user.
    pub async fn user(&self, github_id: GithubId) -> anyhow::Result<SessionUser> {
        self.users
            .find_by_github_id(github_id)
            .await?
            .with_context(|| format!("user {github_id} is not configured"))
    }
}
