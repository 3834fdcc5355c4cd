//! In-process collaborator implementations.
//!
//! Used by the operator binary when running against a local store, and by
//! tests, which assert on the calls each one records.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use isogrid_state::{BuildRef, GithubId, Instance, InstanceId, Owner, StateStore};

use crate::collaborators::*;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Queues ────────────────────────────────────────────────────────

/// Queue that keeps published messages in memory.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    messages: Arc<Mutex<Vec<QueueMessage>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, oldest first.
    pub fn messages(&self) -> Vec<QueueMessage> {
        lock(&self.messages).clone()
    }

    /// Messages of one kind (`"delete-instance"`, ...).
    pub fn of_kind(&self, kind: &str) -> Vec<QueueMessage> {
        lock(&self.messages)
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }

    /// Remove and return every message.
    pub fn take(&self) -> Vec<QueueMessage> {
        std::mem::take(&mut *lock(&self.messages))
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, message: QueueMessage) -> anyhow::Result<()> {
        debug!(kind = message.kind(), "message queued in memory");
        lock(&self.messages).push(message);
        Ok(())
    }
}

/// Queue that appends to the store outbox so messages outlive the process.
#[derive(Clone)]
pub struct OutboxQueue {
    store: StateStore,
}

impl OutboxQueue {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Remove and return every queued message, oldest first.
    pub fn drain(&self) -> anyhow::Result<Vec<QueueMessage>> {
        Ok(self.store.drain_outbox()?)
    }
}

#[async_trait]
impl MessageQueue for OutboxQueue {
    async fn publish(&self, message: QueueMessage) -> anyhow::Result<()> {
        let seq = self.store.push_outbox(&message)?;
        debug!(kind = message.kind(), seq, "message written to outbox");
        Ok(())
    }
}

// ── Notifications ─────────────────────────────────────────────────

/// Records instance-changed events; can be switched to fail every call.
#[derive(Clone, Default)]
pub struct MemoryNotifier {
    events: Arc<Mutex<Vec<(InstanceId, UpdateReason)>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every delivery fails.
    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.failing.store(true, Ordering::Relaxed);
        notifier
    }

    pub fn events(&self) -> Vec<(InstanceId, UpdateReason)> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn instance_updated(
        &self,
        instance: &Instance,
        reason: UpdateReason,
    ) -> anyhow::Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            bail!("notification channel unavailable");
        }
        lock(&self.events).push((instance.id.clone(), reason));
        Ok(())
    }
}

/// Notifier that only logs.
#[derive(Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn instance_updated(
        &self,
        instance: &Instance,
        reason: UpdateReason,
    ) -> anyhow::Result<()> {
        info!(instance_id = %instance.id, name = %instance.name, %reason, "instance updated");
        Ok(())
    }
}

// ── Source control ────────────────────────────────────────────────

/// Source control answering from a fixed `org/repo#branch → sha` table.
#[derive(Clone, Default)]
pub struct PinnedSourceControl {
    branches: Arc<HashMap<String, String>>,
    calls: Arc<AtomicUsize>,
}

impl PinnedSourceControl {
    pub fn new(branches: HashMap<String, String>) -> Self {
        let branches = branches
            .into_iter()
            .map(|(key, sha)| (normalize_branch_key(&key), sha))
            .collect();
        Self {
            branches: Arc::new(branches),
            calls: Arc::default(),
        }
    }

    /// Number of `get_branch` calls served or refused.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

fn normalize_branch_key(key: &str) -> String {
    match key.split_once('#') {
        Some((repo, branch)) => format!("{}#{branch}", repo.to_ascii_lowercase()),
        None => key.to_ascii_lowercase(),
    }
}

#[async_trait]
impl SourceControl for PinnedSourceControl {
    async fn get_branch(&self, repo: &str, branch: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.branches
            .get(&normalize_branch_key(&format!("{repo}#{branch}")))
            .cloned()
            .ok_or_else(|| anyhow!("branch {branch} not found in {repo}"))
    }
}

// ── Builds ────────────────────────────────────────────────────────

/// Build subsystem that mints build ids without building anything.
#[derive(Clone, Default)]
pub struct LocalBuilds {
    calls: Arc<AtomicUsize>,
}

impl LocalBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

fn new_build_id() -> String {
    format!("build-{}", Uuid::new_v4().simple())
}

#[async_trait]
impl BuildSubsystem for LocalBuilds {
    async fn build_from_commit(
        &self,
        source: &Instance,
        repo: &str,
        commit: &str,
    ) -> anyhow::Result<BuildRef> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let build = BuildRef {
            build_id: new_build_id(),
            commit: Some(commit.to_string()),
        };
        debug!(source = %source.id, %repo, %commit, build_id = %build.build_id, "build created");
        Ok(build)
    }

    async fn copy_build(&self, source: &Instance) -> anyhow::Result<BuildRef> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let commit = source
            .build
            .as_ref()
            .and_then(|b| b.commit.clone())
            .or_else(|| source.commit.clone());
        Ok(BuildRef {
            build_id: new_build_id(),
            commit,
        })
    }
}

// ── Permissions and users ─────────────────────────────────────────

/// A user owns a resource owned by themselves or by one of their orgs.
#[derive(Clone, Copy, Default)]
pub struct OwnerPermissions;

#[async_trait]
impl Permissions for OwnerPermissions {
    async fn is_owner_of(&self, user: &SessionUser, owner: &Owner) -> anyhow::Result<bool> {
        Ok(user.github_id == owner.github_id || user.org_ids.contains(&owner.github_id))
    }
}

/// Fixed set of known users.
#[derive(Clone, Default)]
pub struct MemoryUsers {
    users: Arc<HashMap<GithubId, SessionUser>>,
}

impl MemoryUsers {
    pub fn new(users: impl IntoIterator<Item = SessionUser>) -> Self {
        let users = users.into_iter().map(|u| (u.github_id, u)).collect();
        Self {
            users: Arc::new(users),
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryUsers {
    async fn find_by_github_id(&self, github_id: GithubId) -> anyhow::Result<Option<SessionUser>> {
        Ok(self.users.get(&github_id).cloned())
    }
}
