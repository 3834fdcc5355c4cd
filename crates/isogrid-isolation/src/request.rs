//! Isolation requests and their validation.
//!
//! A request names one master and the children to clone alongside it. Each
//! child is either an explicit instance id or an `org`/`repo` pair, with an
//! optional branch (or `match_branch` to follow the master's branch).
//! Validation is pure; planning only needs the master's branch.

use serde::{Deserialize, Serialize};

use isogrid_state::{InstanceId, RequestedDependency};

use crate::error::{IsolationError, IsolationResult};

/// One child of an isolation request.
pub type ChildRequest = RequestedDependency;

/// Input to [`IsolationService::create_isolation_and_emit_instance_updates`](crate::IsolationService::create_isolation_and_emit_instance_updates).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IsolationRequest {
    pub master: InstanceId,
    #[serde(default)]
    pub children: Vec<ChildRequest>,
    #[serde(default)]
    pub redeploy_on_killed: bool,
}

/// What a repo child is cloned from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneTarget {
    Instance(InstanceId),
    Repo { org: String, repo: String },
}

/// A child that must be rebuilt from a source-control branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoChild {
    pub target: CloneTarget,
    pub branch: String,
}

impl RepoChild {
    pub(crate) fn validate(&self) -> IsolationResult<()> {
        let missing = match &self.target {
            CloneTarget::Instance(id) if id.is_empty() => Some("instance"),
            CloneTarget::Repo { org, .. } if org.is_empty() => Some("org"),
            CloneTarget::Repo { repo, .. } if repo.is_empty() => Some("repo"),
            _ if self.branch.is_empty() => Some("branch"),
            _ => None,
        };
        match missing {
            Some(field) => Err(IsolationError::Validation(format!(
                "repo child is missing {field}"
            ))),
            None => Ok(()),
        }
    }
}

/// Children split by how they are forked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkPlan {
    /// Cloned verbatim from their current build.
    pub non_repo: Vec<InstanceId>,
    /// Rebuilt from a branch head.
    pub repo: Vec<RepoChild>,
}

impl IsolationRequest {
    /// Check the request shape without touching the store.
    pub fn validate(&self) -> IsolationResult<()> {
        if self.master.trim().is_empty() {
            return Err(invalid("exactly one master instance is required"));
        }
        for (index, child) in self.children.iter().enumerate() {
            validate_child(index, child, &self.master)?;
        }
        Ok(())
    }

    /// Partition children, substituting `master_branch` for `match_branch`.
    pub fn plan(&self, master_branch: Option<&str>) -> IsolationResult<ForkPlan> {
        let mut plan = ForkPlan::default();
        for (index, child) in self.children.iter().enumerate() {
            let branch = if child.match_branch {
                match master_branch {
                    Some(b) if !b.is_empty() => Some(b.to_string()),
                    _ => {
                        return Err(invalid(format!(
                            "child {index} matches the master's branch but the master has none"
                        )));
                    }
                }
            } else {
                child.branch.clone().filter(|b| !b.is_empty())
            };

            match (&child.instance, branch) {
                (Some(id), None) => plan.non_repo.push(id.clone()),
                (Some(id), Some(branch)) => plan.repo.push(RepoChild {
                    target: CloneTarget::Instance(id.clone()),
                    branch,
                }),
                (None, Some(branch)) => plan.repo.push(RepoChild {
                    target: CloneTarget::Repo {
                        org: child.org.clone().unwrap_or_default(),
                        repo: child.repo.clone().unwrap_or_default(),
                    },
                    branch,
                }),
                (None, None) => {
                    return Err(invalid(format!("child {index} has no branch to build")));
                }
            }
        }
        Ok(plan)
    }
}

fn validate_child(index: usize, child: &ChildRequest, master: &str) -> IsolationResult<()> {
    let has_repo = child.org.is_some() || child.repo.is_some();
    match (&child.instance, has_repo) {
        (Some(_), true) => Err(invalid(format!(
            "child {index} names both an instance and a repository"
        ))),
        (Some(id), false) if id.trim().is_empty() => {
            Err(invalid(format!("child {index} has an empty instance id")))
        }
        (Some(id), false) if id == master => {
            Err(invalid(format!("child {index} is the master itself")))
        }
        (Some(_), false) => Ok(()),
        (None, true) => {
            let org_ok = child.org.as_deref().is_some_and(|s| !s.trim().is_empty());
            let repo_ok = child.repo.as_deref().is_some_and(|s| !s.trim().is_empty());
            let branch_ok =
                child.match_branch || child.branch.as_deref().is_some_and(|s| !s.is_empty());
            if !(org_ok && repo_ok) {
                Err(invalid(format!("child {index} needs both org and repo")))
            } else if !branch_ok {
                Err(invalid(format!(
                    "child {index} needs a branch or match_branch"
                )))
            } else {
                Ok(())
            }
        }
        (None, false) => Err(invalid(format!(
            "child {index} must name an instance or an org/repo"
        ))),
    }
}

fn invalid(message: impl Into<String>) -> IsolationError {
    IsolationError::Validation(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_child(id: &str) -> ChildRequest {
        ChildRequest {
            instance: Some(id.to_string()),
            ..Default::default()
        }
    }

    fn repo_child(org: &str, repo: &str) -> ChildRequest {
        ChildRequest {
            org: Some(org.to_string()),
            repo: Some(repo.to_string()),
            match_branch: true,
            ..Default::default()
        }
    }

    fn request(children: Vec<ChildRequest>) -> IsolationRequest {
        IsolationRequest {
            master: "m".to_string(),
            children,
            redeploy_on_killed: false,
        }
    }

    #[test]
    fn master_is_required() {
        let err = IsolationRequest::default().validate().unwrap_err();
        assert!(matches!(err, IsolationError::Validation(_)));
    }

    #[test]
    fn child_must_pick_one_target_kind() {
        let mut both = repo_child("acme", "api");
        both.instance = Some("i1".to_string());
        assert!(request(vec![both]).validate().is_err());
        assert!(request(vec![ChildRequest::default()]).validate().is_err());
        assert!(request(vec![instance_child("m")]).validate().is_err());
    }

    #[test]
    fn repo_child_needs_branch_source() {
        let mut child = repo_child("acme", "api");
        child.match_branch = false;
        assert!(request(vec![child.clone()]).validate().is_err());

        child.branch = Some("feature".to_string());
        assert!(request(vec![child]).validate().is_ok());
    }

    #[test]
    fn plan_partitions_and_substitutes_master_branch() {
        let mut pinned = instance_child("db");
        pinned.branch = Some("fix".to_string());
        let req = request(vec![
            instance_child("cache"),
            repo_child("acme", "api"),
            pinned,
        ]);
        req.validate().unwrap();

        let plan = req.plan(Some("master")).unwrap();
        assert_eq!(plan.non_repo, vec!["cache"]);
        assert_eq!(
            plan.repo,
            vec![
                RepoChild {
                    target: CloneTarget::Repo {
                        org: "acme".to_string(),
                        repo: "api".to_string(),
                    },
                    branch: "master".to_string(),
                },
                RepoChild {
                    target: CloneTarget::Instance("db".to_string()),
                    branch: "fix".to_string(),
                },
            ]
        );
    }

    #[test]
    fn match_branch_without_master_branch_is_rejected() {
        let req = request(vec![repo_child("acme", "api")]);
        assert!(matches!(req.plan(None), Err(IsolationError::Validation(_))));
    }

    #[test]
    fn repo_child_validation_fails_fast() {
        let child = RepoChild {
            target: CloneTarget::Repo {
                org: "acme".to_string(),
                repo: String::new(),
            },
            branch: "master".to_string(),
        };
        assert!(child.validate().is_err());
    }
}
