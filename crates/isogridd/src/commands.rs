//! Subcommand implementations. Each returns a JSON document for stdout.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use isogrid_isolation::{IsolationRequest, QueueMessage};
use isogrid_state::{
    AutoIsolationConfig, BuildRef, ContainerRef, ContainerStatus, GithubId, Instance, InstanceId,
    Owner, ReplaceRule, epoch_secs,
};

use crate::app::App;

/// Instances and configurations to import.
#[derive(Debug, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub instances: Vec<SeedInstance>,
    #[serde(default)]
    pub auto_isolation_configs: Vec<AutoIsolationConfig>,
}

/// An instance as an operator writes it; hostname and build are derived.
#[derive(Debug, Deserialize)]
pub struct SeedInstance {
    pub id: InstanceId,
    pub short_hash: String,
    pub name: String,
    pub owner: Owner,
    #[serde(default)]
    pub created_by: Option<GithubId>,
    #[serde(default)]
    pub master_pod: bool,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub transform_rules: Vec<ReplaceRule>,
    #[serde(default)]
    pub is_testing: bool,
    #[serde(default)]
    pub container: Option<ContainerRef>,
}

pub fn seed(app: &App, path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let seed: SeedFile = serde_json::from_str(&raw)?;
    let scheme = app.service.graph().scheme();
    let now = epoch_secs();

    let mut seeded = Vec::with_capacity(seed.instances.len());
    for s in seed.instances {
        let hostname = scheme.elastic_hostname(&s.name, &s.owner.username);
        let mut instance = Instance::new(&s.id, &s.short_hash, &s.name, s.owner, &hostname);
        if let Some(created_by) = s.created_by {
            instance.created_by = created_by;
        }
        instance.master_pod = s.master_pod;
        instance.parent = s.parent;
        instance.repo = s.repo;
        instance.branch = s.branch;
        instance.build = Some(BuildRef {
            build_id: format!("seed-{}", s.id),
            commit: s.commit.clone(),
        });
        instance.commit = s.commit;
        instance.env = s.env;
        instance.transform_rules = s.transform_rules;
        instance.is_testing = s.is_testing;
        instance.container = s.container;
        instance.created_at = now;
        instance.updated_at = now;
        app.store.put_instance(&instance)?;
        seeded.push(instance);
    }
    for config in &seed.auto_isolation_configs {
        app.store.put_auto_isolation_config(config)?;
    }

    let mut edges_added = 0;
    for instance in &seeded {
        let diff = app
            .service
            .graph()
            .set_dependencies_from_environment(&instance.id, &instance.owner.username)?;
        edges_added += diff.added.len();
    }

    info!(
        instances = seeded.len(),
        configs = seed.auto_isolation_configs.len(),
        edges_added,
        "seed imported"
    );
    Ok(json!({
        "instances": seeded.len(),
        "auto_isolation_configs": seed.auto_isolation_configs.len(),
        "edges_added": edges_added,
    }))
}

pub async fn isolate(app: &App, request_path: &Path, user: GithubId) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(request_path)
        .with_context(|| format!("reading request {}", request_path.display()))?;
    let request: IsolationRequest = toml::from_str(&raw)?;
    let user = app.user(user).await?;
    let created = app
        .service
        .create_isolation_and_emit_instance_updates(&request, &user)
        .await?;
    Ok(serde_json::to_value(created)?)
}

pub async fn delete(app: &App, isolation_id: &str) -> anyhow::Result<Value> {
    let master = app
        .service
        .delete_isolation_and_emit_instance_updates(isolation_id)
        .await?;
    Ok(serde_json::to_value(master)?)
}

pub async fn kill(app: &App, isolation_id: &str, redeploy: bool) -> anyhow::Result<Value> {
    let isolation = app.service.kill_isolation(isolation_id, redeploy).await?;
    Ok(serde_json::to_value(isolation)?)
}

pub async fn reap(app: &App, isolation_id: &str) -> anyhow::Result<Value> {
    let redeployed = app.service.redeploy_if_all_killed(isolation_id).await?;
    Ok(json!({ "isolation_id": isolation_id, "redeployed": redeployed }))
}

pub async fn redeployed(app: &App, isolation_id: &str) -> anyhow::Result<Value> {
    let isolation = app.service.complete_redeploy(isolation_id).await?;
    Ok(serde_json::to_value(isolation)?)
}

pub async fn container_state(
    app: &App,
    instance_id: &str,
    container_id: &str,
    status: ContainerStatus,
) -> anyhow::Result<Value> {
    let outcome = app
        .monitor
        .on_container_state(instance_id, container_id, status)
        .await?;
    Ok(serde_json::to_value(outcome)?)
}

pub async fn on_push(
    app: &App,
    instance_ids: &[InstanceId],
    pusher: Option<GithubId>,
) -> anyhow::Result<Value> {
    let outcomes = app.trigger.on_instances_created(instance_ids, pusher).await;
    Ok(serde_json::to_value(outcomes)?)
}

pub fn sync_deps(app: &App, instance_id: &str) -> anyhow::Result<Value> {
    let instance = app.store.require_instance(instance_id)?;
    let diff = app
        .service
        .graph()
        .set_dependencies_from_environment(&instance.id, &instance.owner.username)?;
    Ok(serde_json::to_value(diff)?)
}

pub fn dependents(app: &App, instance_id: &str) -> anyhow::Result<Value> {
    let dependents = app.service.graph().get_dependents(instance_id)?;
    Ok(Value::Array(dependents.iter().map(summary).collect()))
}

pub fn resolve(app: &App, instance_id: &str, hostname: &str) -> anyhow::Result<Value> {
    let node = app.service.graph().resolve(instance_id, hostname)?;
    Ok(json!({ "hostname": hostname, "target": node }))
}

pub async fn show(app: &App, isolation_id: &str, user: GithubId) -> anyhow::Result<Value> {
    let user = app.user(user).await?;
    let isolation = app
        .service
        .find_isolation_for_user(isolation_id, &user)
        .await?;
    let members = app.store.list_isolation_members(isolation_id)?;
    let testing = app.service.is_testing_isolation(isolation_id).await?;
    Ok(json!({
        "isolation": isolation,
        "testing": testing,
        "members": members.iter().map(summary).collect::<Vec<_>>(),
    }))
}

/// Take every queued message. `delete-instance` is processed here; the
/// rest belong to subsystems outside this process and are only logged.
///
/// Deletes that fail with a retryable error are queued again once every
/// message has been handled.
pub async fn drain(app: &App) -> anyhow::Result<Value> {
    let messages = app.outbox.drain()?;
    let mut report = Vec::with_capacity(messages.len());
    let mut retry = Vec::new();
    for message in messages {
        let result = match &message {
            QueueMessage::DeleteInstance { instance_id } => {
                match app.service.delete_forked_instance(instance_id).await {
                    Ok(rewire) => json!({ "deleted": instance_id, "rewire": rewire }),
                    Err(e) => {
                        warn!(%instance_id, error = %e, "delete-instance failed");
                        if !e.is_terminal() {
                            retry.push(message.clone());
                        }
                        json!({ "error": e.to_string(), "requeued": !e.is_terminal() })
                    }
                }
            }
            other => {
                info!(kind = other.kind(), "message handed off");
                json!({ "handed_off": true })
            }
        };
        report.push(json!({ "message": message, "result": result }));
    }
    requeue(app, &retry)?;
    Ok(Value::Array(report))
}

/// Push messages back onto the outbox. Every message is attempted; fails if
/// any could not be written.
fn requeue(app: &App, messages: &[QueueMessage]) -> anyhow::Result<usize> {
    let mut failed = 0;
    for message in messages {
        if let Err(e) = app.store.push_outbox(message) {
            warn!(kind = message.kind(), error = %e, "requeue failed");
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} messages could not be requeued", messages.len());
    }
    Ok(messages.len())
}

fn summary(instance: &Instance) -> Value {
    json!({
        "id": instance.id,
        "name": instance.name,
        "elastic_hostname": instance.elastic_hostname,
        "isolated": instance.isolated,
        "is_isolation_group_master": instance.is_isolation_group_master,
    })
}
