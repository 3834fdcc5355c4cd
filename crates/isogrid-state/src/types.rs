//! Domain types for the IsoGrid instance store.
//!
//! These types represent the persisted state of instances, isolation groups,
//! and auto-isolation configurations. All types are serializable to/from
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for an instance.
pub type InstanceId = String;

/// Unique identifier for an isolation group.
pub type IsolationId = String;

/// GitHub id of a user or organization.
pub type GithubId = u64;

// ── Instance ──────────────────────────────────────────────────────

/// A deployable running service environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    /// Public slug, unique across the store.
    pub short_hash: String,
    pub name: String,
    /// Lowercased `name`; unique per owner.
    pub lower_name: String,
    pub owner: Owner,
    /// GitHub id of the user who created this instance.
    pub created_by: GithubId,
    /// DNS-stable address derived from name and owner.
    pub elastic_hostname: String,
    /// Canonical instance for its repo's primary branch.
    #[serde(default)]
    pub master_pod: bool,
    /// Isolation group this instance belongs to.
    #[serde(default)]
    pub isolated: Option<IsolationId>,
    #[serde(default)]
    pub is_isolation_group_master: bool,
    /// Short hash of the instance this one was forked from.
    #[serde(default)]
    pub parent: Option<String>,
    /// Full repository name (`org/repo`) for repo-backed instances.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    /// `KEY=value` lines; values may embed other instances' hostnames.
    #[serde(default)]
    pub env: Vec<String>,
    /// Find/replace rules applied by the build.
    #[serde(default)]
    pub transform_rules: Vec<ReplaceRule>,
    /// Outgoing "depends-on" edges, denormalized.
    #[serde(default)]
    pub dependencies: Vec<GraphNode>,
    #[serde(default)]
    pub container: Option<ContainerRef>,
    #[serde(default)]
    pub build: Option<BuildRef>,
    /// Set on instances that run automated tests.
    #[serde(default)]
    pub is_testing: bool,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

/// The GitHub user or organization that owns an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Owner {
    pub github_id: GithubId,
    pub username: String,
}

/// Denormalized snapshot of a dependency, embedded in the dependent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GraphNode {
    pub instance_id: InstanceId,
    pub elastic_hostname: String,
    pub name: String,
}

/// A build-time find/replace rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplaceRule {
    pub search: String,
    pub replace: String,
}

/// Container backing an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerRef {
    pub container_id: String,
    pub status: ContainerStatus,
}

/// Lifecycle status reported by the container subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopping,
    Exited,
    Dead,
}

impl ContainerStatus {
    /// Running or on its way down; not yet quiesced.
    pub fn is_active(self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Stopping)
    }
}

/// Build produced by the build/fork subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRef {
    pub build_id: String,
    #[serde(default)]
    pub commit: Option<String>,
}

impl Instance {
    /// A bare, non-isolated instance with no repo, env, or edges.
    pub fn new(
        id: &str,
        short_hash: &str,
        name: &str,
        owner: Owner,
        elastic_hostname: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            short_hash: short_hash.to_string(),
            name: name.to_string(),
            lower_name: name.to_lowercase(),
            created_by: owner.github_id,
            owner,
            elastic_hostname: elastic_hostname.to_string(),
            master_pod: false,
            isolated: None,
            is_isolation_group_master: false,
            parent: None,
            repo: None,
            branch: None,
            commit: None,
            env: Vec::new(),
            transform_rules: Vec::new(),
            dependencies: Vec::new(),
            container: None,
            build: None,
            is_testing: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Whether this instance is the master of the given isolation group.
    pub fn is_master_of(&self, isolation_id: &str) -> bool {
        self.is_isolation_group_master && self.isolated.as_deref() == Some(isolation_id)
    }

    /// A non-master member of an isolation group, forked from `parent`.
    ///
    /// Only such instances carry a `{masterShortHash}--` name prefix.
    pub fn is_isolated_fork(&self) -> bool {
        self.isolated.is_some() && self.parent.is_some() && !self.is_isolation_group_master
    }

    /// Whether this instance has an edge to `target_id`.
    pub fn depends_on(&self, target_id: &str) -> bool {
        self.dependencies.iter().any(|n| n.instance_id == target_id)
    }

    /// Clear both isolation fields.
    pub fn deisolate(&mut self) {
        self.isolated = None;
        self.is_isolation_group_master = false;
    }

    /// Check the per-document isolation invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.is_isolation_group_master && self.isolated.is_none() {
            return Err(format!(
                "instance {} is flagged isolation master without an isolation id",
                self.id
            ));
        }
        Ok(())
    }
}

// ── Isolation group ───────────────────────────────────────────────

/// A master instance plus the forks cloned alongside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IsolationGroup {
    pub id: IsolationId,
    pub master_instance_id: InstanceId,
    pub owner: Owner,
    pub created_by: GithubId,
    pub redeploy_on_killed: bool,
    pub state: IsolationState,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle state of an isolation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationState {
    Active,
    Killing,
    Killed,
}

impl IsolationState {
    pub fn as_str(self) -> &'static str {
        match self {
            IsolationState::Active => "active",
            IsolationState::Killing => "killing",
            IsolationState::Killed => "killed",
        }
    }
}

impl std::fmt::Display for IsolationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Auto-isolation ────────────────────────────────────────────────

/// Declarative list of dependencies to co-isolate with new builds of a master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoIsolationConfig {
    pub id: String,
    /// Master instance the configuration belongs to.
    pub instance_id: InstanceId,
    pub owner: Owner,
    pub created_by: GithubId,
    #[serde(default)]
    pub requested_dependencies: Vec<RequestedDependency>,
    #[serde(default)]
    pub redeploy_on_killed: bool,
}

/// One requested dependency: an explicit instance, or a repo/org/branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedDependency {
    #[serde(default)]
    pub instance: Option<InstanceId>,
    #[serde(default)]
    pub match_branch: bool,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}
