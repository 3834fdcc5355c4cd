//! Dependency graph. Owns every mutation of an instance's embedded edges.
//!
//! Edges are stored inside the dependent (`Instance::dependencies`) as
//! [`GraphNode`] snapshots. The graph never trusts a cached view: every
//! reconciliation re-reads the instances it touches, so partial state left
//! by an interrupted operation is corrected on the next pass.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use isogrid_core::HostnameScheme;
use isogrid_state::{GraphNode, Instance, InstanceId, StateStore};

use crate::dns::DnsCache;
use crate::error::{GraphError, GraphResult};

/// One directed edge that was added or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeChange {
    pub source: InstanceId,
    pub target: InstanceId,
}

/// Edges changed by a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EdgeDiff {
    pub added: Vec<EdgeChange>,
    pub removed: Vec<EdgeChange>,
}

impl EdgeDiff {
    /// Number of add/remove operations issued.
    pub fn operations(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations() == 0
    }
}

/// Outcome of detaching a deleted instance from its dependents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewireReport {
    /// Dependents now pointing at the deleted instance's parent.
    pub rewired: Vec<InstanceId>,
    /// Dependents whose edge was dropped (no parent to fall back to).
    pub dropped: Vec<InstanceId>,
    /// Dependents that could not be updated.
    pub failed: Vec<InstanceId>,
}

/// Build the denormalized edge snapshot for a dependency target.
///
/// Fails if the target lacks any identity field; such a target cannot be
/// resolved by hostname and is treated as not found.
pub fn generate_graph_node(instance: &Instance) -> GraphResult<GraphNode> {
    let missing = |field| GraphError::MissingField {
        id: instance.id.clone(),
        field,
    };
    if instance.id.is_empty() {
        return Err(missing("id"));
    }
    if instance.elastic_hostname.is_empty() {
        return Err(missing("elastic_hostname"));
    }
    if instance.name.is_empty() {
        return Err(missing("name"));
    }
    Ok(GraphNode {
        instance_id: instance.id.clone(),
        elastic_hostname: instance.elastic_hostname.to_ascii_lowercase(),
        name: instance.name.clone(),
    })
}

/// Dependency graph over the instance store.
#[derive(Clone)]
pub struct DependencyGraph {
    store: StateStore,
    scheme: HostnameScheme,
    dns: DnsCache,
}

impl DependencyGraph {
    pub fn new(store: StateStore, scheme: HostnameScheme, dns: DnsCache) -> Self {
        Self { store, scheme, dns }
    }

    pub fn dns(&self) -> &DnsCache {
        &self.dns
    }

    pub fn scheme(&self) -> &HostnameScheme {
        &self.scheme
    }

    /// Append an edge `source → target` and invalidate the source's DNS entry.
    ///
    /// An existing edge to the same target is replaced by a fresh snapshot.
    pub fn add_dependency(&self, source_id: &str, target: &Instance) -> GraphResult<Instance> {
        let node = generate_graph_node(target)?;
        let result = self.link(source_id, node);
        self.dns.invalidate(source_id);
        result
    }

    /// Remove the edge `source → target_id`. Returns whether an edge existed.
    ///
    /// The DNS entry is invalidated even when there was nothing to remove.
    pub fn remove_dependency(&self, source_id: &str, target_id: &str) -> GraphResult<bool> {
        let result = self.unlink(source_id, target_id);
        self.dns.invalidate(source_id);
        result
    }

    /// Outgoing edges of an instance.
    pub fn get_dependencies(&self, source_id: &str) -> GraphResult<Vec<GraphNode>> {
        Ok(self.require(source_id)?.dependencies)
    }

    /// Resolve a hostname as `source_id` sees it, through the DNS cache.
    ///
    /// A canonical hostname answers with the isolated fork the source is
    /// wired to, if any.
    pub fn resolve(&self, source_id: &str, hostname: &str) -> GraphResult<Option<GraphNode>> {
        Ok(self.dns.resolve(&self.store, source_id, hostname)?)
    }

    /// Instances with an edge pointing at `target_id`.
    pub fn get_dependents(&self, target_id: &str) -> GraphResult<Vec<Instance>> {
        Ok(self.store.find_dependents(target_id)?)
    }

    /// Replace an instance's edges with the set its env and replace rules
    /// reference.
    ///
    /// Each referenced hostname resolves to the owner's instance answering
    /// at it, or to that instance's fork inside the source's own isolation
    /// group when one exists. Self-references are dropped. Only the
    /// difference against the current edges is written, so a second call
    /// with unchanged env issues no operations. The DNS entry is
    /// invalidated exactly once.
    pub fn set_dependencies_from_environment(
        &self,
        instance_id: &str,
        owner_username: &str,
    ) -> GraphResult<EdgeDiff> {
        let instance = self.require(instance_id)?;
        let hostnames = self.referenced_hostnames(&instance);

        let mut resolved: BTreeMap<InstanceId, Instance> = BTreeMap::new();
        for hostname in &hostnames {
            match self.resolve_hostname(&instance, hostname, owner_username)? {
                Some(target) if target.id == instance.id => {
                    debug!(%instance_id, %hostname, "self reference dropped");
                }
                Some(target) => {
                    resolved.insert(target.id.clone(), target);
                }
                None => debug!(%instance_id, %hostname, "hostname does not resolve"),
            }
        }

        let current: BTreeSet<InstanceId> = instance
            .dependencies
            .iter()
            .map(|n| n.instance_id.clone())
            .collect();

        let mut diff = EdgeDiff::default();
        for (target_id, target) in &resolved {
            if !current.contains(target_id) {
                self.link(instance_id, generate_graph_node(target)?)?;
                diff.added.push(edge(instance_id, target_id));
            }
        }
        for target_id in &current {
            if !resolved.contains_key(target_id) {
                self.unlink(instance_id, target_id)?;
                diff.removed.push(edge(instance_id, target_id));
            }
        }

        self.dns.invalidate(instance_id);
        info!(
            %instance_id,
            hostnames = hostnames.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "dependencies reconciled from environment"
        );
        Ok(diff)
    }

    /// Rewire edges so group members depend on each other instead of the
    /// instances they were forked from.
    ///
    /// For every member edge pointing outside the group, if another member
    /// is that target's fork (or the target itself is a member), the edge is
    /// moved onto the member. Membership is the source of truth; env is not
    /// consulted.
    pub fn match_group_membership(&self, member_ids: &[InstanceId]) -> GraphResult<EdgeDiff> {
        let members = member_ids
            .iter()
            .map(|id| self.require(id))
            .collect::<GraphResult<Vec<_>>>()?;
        let member_set: BTreeSet<&str> = members.iter().map(|m| m.id.as_str()).collect();

        let mut diff = EdgeDiff::default();
        for member in &members {
            let mut additions: Vec<GraphNode> = Vec::new();
            let mut removals: Vec<InstanceId> = Vec::new();

            for node in &member.dependencies {
                if member_set.contains(node.instance_id.as_str()) {
                    continue;
                }
                let Some(target) = self.store.get_instance(&node.instance_id)? else {
                    debug!(member = %member.id, target = %node.instance_id, "dangling edge left in place");
                    continue;
                };
                let Some(counterpart) = isolated_counterpart(&members, &target) else {
                    continue;
                };
                removals.push(node.instance_id.clone());
                let already = member.depends_on(&counterpart.id)
                    || additions.iter().any(|n| n.instance_id == counterpart.id);
                if counterpart.id != member.id && !already {
                    additions.push(generate_graph_node(counterpart)?);
                }
            }

            if additions.is_empty() && removals.is_empty() {
                continue;
            }
            for node in additions {
                let target_id = node.instance_id.clone();
                self.link(&member.id, node)?;
                diff.added.push(edge(&member.id, &target_id));
            }
            for target_id in removals {
                self.unlink(&member.id, &target_id)?;
                diff.removed.push(edge(&member.id, &target_id));
            }
            self.dns.invalidate(&member.id);
        }

        info!(
            members = members.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "group edges matched to membership"
        );
        Ok(diff)
    }

    /// Detach an instance that is being deleted or replaced.
    ///
    /// Every dependent's edge to it is rewritten to point at its parent
    /// (looked up by short hash) when one exists, otherwise dropped. A
    /// failure on one dependent is logged and does not stop the rest.
    pub fn remove_self_from_graph(&self, instance: &Instance) -> GraphResult<RewireReport> {
        let dependents = self.store.find_dependents(&instance.id)?;
        let parent = match &instance.parent {
            Some(hash) => self.store.find_instance_by_short_hash(hash)?,
            None => None,
        };
        let replacement = match parent.as_ref().map(generate_graph_node) {
            Some(Ok(node)) => Some(node),
            Some(Err(e)) => {
                warn!(instance_id = %instance.id, error = %e, "parent unusable as replacement");
                None
            }
            None => None,
        };

        let mut report = RewireReport::default();
        for dependent in &dependents {
            match self.replace_edge(&dependent.id, &instance.id, replacement.as_ref()) {
                Ok(true) => report.rewired.push(dependent.id.clone()),
                Ok(false) => report.dropped.push(dependent.id.clone()),
                Err(e) => {
                    warn!(
                        instance_id = %instance.id,
                        dependent = %dependent.id,
                        error = %e,
                        "failed to detach dependent"
                    );
                    report.failed.push(dependent.id.clone());
                }
            }
        }

        info!(
            instance_id = %instance.id,
            rewired = report.rewired.len(),
            dropped = report.dropped.len(),
            failed = report.failed.len(),
            "instance removed from graph"
        );
        Ok(report)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn require(&self, id: &str) -> GraphResult<Instance> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| GraphError::InstanceNotFound(id.to_string()))
    }

    /// Write an edge without touching the DNS cache.
    fn link(&self, source_id: &str, node: GraphNode) -> GraphResult<Instance> {
        if node.instance_id == source_id {
            return Err(GraphError::SelfDependency(source_id.to_string()));
        }
        let target_id = node.instance_id.clone();
        let updated = self
            .store
            .update_instance(source_id, move |i| {
                i.dependencies.retain(|n| n.instance_id != target_id);
                i.dependencies.push(node);
            })?
            .ok_or_else(|| GraphError::InstanceNotFound(source_id.to_string()))?;
        debug!(%source_id, edges = updated.dependencies.len(), "edge added");
        Ok(updated)
    }

    /// Drop an edge without touching the DNS cache.
    fn unlink(&self, source_id: &str, target_id: &str) -> GraphResult<bool> {
        let mut removed = false;
        self.store
            .update_instance(source_id, |i| {
                let before = i.dependencies.len();
                i.dependencies.retain(|n| n.instance_id != target_id);
                removed = i.dependencies.len() != before;
            })?
            .ok_or_else(|| GraphError::InstanceNotFound(source_id.to_string()))?;
        debug!(%source_id, %target_id, removed, "edge removed");
        Ok(removed)
    }

    /// Swap `old_id` for `replacement` in one dependent, atomically.
    fn replace_edge(
        &self,
        dependent_id: &str,
        old_id: &str,
        replacement: Option<&GraphNode>,
    ) -> GraphResult<bool> {
        let replacement = replacement
            .filter(|n| n.instance_id != dependent_id)
            .cloned();
        let rewired = replacement.is_some();
        self.store
            .update_instance(dependent_id, move |i| {
                i.dependencies.retain(|n| n.instance_id != old_id);
                if let Some(node) = replacement {
                    if !i.depends_on(&node.instance_id) {
                        i.dependencies.push(node);
                    }
                }
            })?
            .ok_or_else(|| GraphError::InstanceNotFound(dependent_id.to_string()))?;
        self.dns.invalidate(dependent_id);
        Ok(rewired)
    }

    fn referenced_hostnames(&self, instance: &Instance) -> BTreeSet<String> {
        let env = instance.env.iter().map(String::as_str);
        let rules = instance
            .transform_rules
            .iter()
            .flat_map(|r| [r.search.as_str(), r.replace.as_str()]);
        self.scheme.extract_all(env.chain(rules))
    }

    /// Resolve a hostname to a live instance from `source`'s point of view.
    fn resolve_hostname(
        &self,
        source: &Instance,
        hostname: &str,
        owner_username: &str,
    ) -> GraphResult<Option<Instance>> {
        let candidates: Vec<Instance> = self
            .store
            .find_instances_by_hostname(hostname)?
            .into_iter()
            .filter(|i| i.owner.username.eq_ignore_ascii_case(owner_username))
            .collect();
        let Some(canonical) = candidates
            .iter()
            .find(|i| i.master_pod)
            .or_else(|| candidates.first())
            .cloned()
        else {
            return Ok(None);
        };

        if let Some(isolation_id) = &source.isolated {
            let members = self.store.list_isolation_members(isolation_id)?;
            if let Some(member) = isolated_counterpart(&members, &canonical) {
                return Ok(Some(member.clone()));
            }
        }
        Ok(Some(canonical))
    }
}

/// The group member standing in for `target`: the target itself if it is a
/// member, else a member forked from it.
fn isolated_counterpart<'a>(members: &'a [Instance], target: &Instance) -> Option<&'a Instance> {
    members.iter().find(|m| m.id == target.id).or_else(|| {
        members
            .iter()
            .find(|m| m.parent.as_deref() == Some(target.short_hash.as_str()))
    })
}

fn edge(source: &str, target: &str) -> EdgeChange {
    EdgeChange {
        source: source.to_string(),
        target: target.to_string(),
    }
}
