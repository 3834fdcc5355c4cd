//! Fork engine. Clones a source instance into an isolation group.
//!
//! A repo child is rebuilt from the head of a branch; a non-repo child reuses
//! its source's build. Either way the new instance is named
//! `{masterShortHash}--{name}`, records its source's short hash as parent,
//! and starts with a copy of the source's edges (group rewiring fixes them
//! up afterwards).

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use isogrid_core::{HostnameScheme, canonical_name, isolated_name};
use isogrid_state::{BuildRef, Instance, StateStore, epoch_secs};

use crate::collaborators::{BuildSubsystem, SessionUser, SourceControl};
use crate::error::{IsolationError, IsolationResult};
use crate::request::{CloneTarget, RepoChild};

const SHORT_HASH_LEN: usize = 6;
const SHORT_HASH_ATTEMPTS: usize = 8;

/// Where a fork lands and who asked for it.
#[derive(Debug, Clone, Copy)]
pub struct ForkContext<'a> {
    pub master_short_hash: &'a str,
    pub isolation_id: &'a str,
    pub user: &'a SessionUser,
}

impl ForkContext<'_> {
    fn validate(&self) -> IsolationResult<()> {
        if self.master_short_hash.is_empty() {
            return Err(IsolationError::Validation(
                "master short hash is required".to_string(),
            ));
        }
        if self.isolation_id.is_empty() {
            return Err(IsolationError::Validation(
                "isolation id is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Branch a repo child was rebuilt from.
struct BranchPin {
    repo: String,
    branch: String,
    commit: String,
}

#[derive(Clone)]
pub struct ForkEngine {
    store: StateStore,
    scheme: HostnameScheme,
    source_control: Arc<dyn SourceControl>,
    builds: Arc<dyn BuildSubsystem>,
}

impl ForkEngine {
    pub fn new(
        store: StateStore,
        scheme: HostnameScheme,
        source_control: Arc<dyn SourceControl>,
        builds: Arc<dyn BuildSubsystem>,
    ) -> Self {
        Self {
            store,
            scheme,
            source_control,
            builds,
        }
    }

    /// Fork a child onto the head of a branch.
    ///
    /// The source is an explicit instance, or the single master instance
    /// built from `org/repo`; zero matches is `NotFound`, several is
    /// `Ambiguous`. Nothing is created on either failure.
    pub async fn fork_repo_child(
        &self,
        child: &RepoChild,
        ctx: &ForkContext<'_>,
    ) -> IsolationResult<Instance> {
        ctx.validate()?;
        child.validate()?;

        let source = self.resolve_clone_target(&child.target)?;
        let repo = match (&child.target, &source.repo) {
            (CloneTarget::Repo { org, repo }, _) => format!("{org}/{repo}"),
            (CloneTarget::Instance(_), Some(repo)) => repo.clone(),
            (CloneTarget::Instance(id), None) => {
                return Err(IsolationError::Validation(format!(
                    "instance {id} is not built from a repository"
                )));
            }
        };

        let commit = self
            .source_control
            .get_branch(&repo, &child.branch)
            .await?;
        debug!(%repo, branch = %child.branch, %commit, "branch head resolved");
        let build = self
            .builds
            .build_from_commit(&source, &repo, &commit)
            .await?;

        let pin = BranchPin {
            repo,
            branch: child.branch.clone(),
            commit,
        };
        self.create_child(&source, ctx, Some(pin), build)
    }

    /// Fork a child by copying its source's current build. No source-control
    /// lookup.
    pub async fn fork_non_repo_child(
        &self,
        instance_id: &str,
        ctx: &ForkContext<'_>,
    ) -> IsolationResult<Instance> {
        ctx.validate()?;
        if instance_id.is_empty() {
            return Err(IsolationError::Validation(
                "source instance id is required".to_string(),
            ));
        }

        let source = self
            .store
            .get_instance(instance_id)?
            .ok_or_else(|| IsolationError::NotFound(format!("instance {instance_id}")))?;
        let build = self.builds.copy_build(&source).await?;
        self.create_child(&source, ctx, None, build)
    }

    fn resolve_clone_target(&self, target: &CloneTarget) -> IsolationResult<Instance> {
        match target {
            CloneTarget::Instance(id) => self
                .store
                .get_instance(id)?
                .ok_or_else(|| IsolationError::NotFound(format!("instance {id}"))),
            CloneTarget::Repo { org, repo } => {
                let full_repo = format!("{org}/{repo}");
                let mut matches = self
                    .store
                    .find_master_instances_for_repo(&full_repo)?
                    .into_iter()
                    .filter(|i| i.isolated.is_none());
                match (matches.next(), matches.next()) {
                    (Some(source), None) => Ok(source),
                    (None, _) => Err(IsolationError::NotFound(format!(
                        "master instance for {full_repo}"
                    ))),
                    (Some(_), Some(_)) => Err(IsolationError::Ambiguous(format!(
                        "more than one master instance for {full_repo}"
                    ))),
                }
            }
        }
    }

    fn create_child(
        &self,
        source: &Instance,
        ctx: &ForkContext<'_>,
        pin: Option<BranchPin>,
        build: BuildRef,
    ) -> IsolationResult<Instance> {
        let base = if source.is_isolated_fork() {
            canonical_name(&source.name)
        } else {
            source.name.as_str()
        };
        let name = isolated_name(ctx.master_short_hash, base);
        let hostname = self
            .scheme
            .elastic_hostname(&name, &source.owner.username);
        let id = Uuid::new_v4().to_string();
        let short_hash = self.allocate_short_hash()?;

        let mut child = Instance::new(&id, &short_hash, &name, source.owner.clone(), &hostname);
        child.created_by = ctx.user.github_id;
        child.parent = Some(source.short_hash.clone());
        child.isolated = Some(ctx.isolation_id.to_string());
        child.is_isolation_group_master = false;
        child.env = source.env.clone();
        child.transform_rules = source.transform_rules.clone();
        child.dependencies = source.dependencies.clone();
        child.is_testing = source.is_testing;
        match pin {
            Some(pin) => {
                child.repo = Some(pin.repo);
                child.branch = Some(pin.branch);
                child.commit = Some(pin.commit);
            }
            None => {
                child.repo = source.repo.clone();
                child.branch = source.branch.clone();
                child.commit = source.commit.clone();
            }
        }
        child.build = Some(build);
        child.created_at = epoch_secs();
        child.updated_at = child.created_at;

        self.store.put_instance(&child)?;
        info!(
            instance_id = %child.id,
            name = %child.name,
            source = %source.id,
            isolation_id = %ctx.isolation_id,
            branch = child.branch.as_deref().unwrap_or("-"),
            "child forked"
        );
        Ok(child)
    }

    fn allocate_short_hash(&self) -> IsolationResult<String> {
        for _ in 0..SHORT_HASH_ATTEMPTS {
            let candidate: String = Uuid::new_v4()
                .simple()
                .to_string()
                .chars()
                .take(SHORT_HASH_LEN)
                .collect();
            if self.store.find_instance_by_short_hash(&candidate)?.is_none() {
                return Ok(candidate);
            }
        }
        Err(IsolationError::Collaborator(anyhow::anyhow!(
            "no free short hash after {SHORT_HASH_ATTEMPTS} attempts"
        )))
    }
}
