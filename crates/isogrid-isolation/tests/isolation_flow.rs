//! End-to-end isolation flows over an in-memory store.
//!
//! Seeds a small stack (web → api → db, all owned by `acme`), wires its
//! edges from env, then drives create / delete / kill / auto-isolation
//! through the public service API with the in-process collaborators.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use isogrid_core::HostnameScheme;
use isogrid_graph::{DependencyGraph, DnsCache};
use isogrid_isolation::local::*;
use isogrid_isolation::*;
use isogrid_state::*;

const DOMAIN: &str = "isogrid.local";

fn acme() -> Owner {
    Owner {
        github_id: 7,
        username: "acme".to_string(),
    }
}

fn dev() -> SessionUser {
    SessionUser {
        github_id: 42,
        username: "dev".to_string(),
        org_ids: vec![7],
    }
}

fn stranger() -> SessionUser {
    SessionUser {
        github_id: 1000,
        username: "mallory".to_string(),
        org_ids: vec![],
    }
}

struct Harness {
    store: StateStore,
    queue: MemoryQueue,
    notifier: MemoryNotifier,
    service: IsolationService,
}

impl Harness {
    fn new() -> Self {
        Self::with_notifier(MemoryNotifier::new())
    }

    fn with_notifier(notifier: MemoryNotifier) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let scheme = HostnameScheme::new(DOMAIN).unwrap();
        let graph = DependencyGraph::new(store.clone(), scheme, DnsCache::new());
        let queue = MemoryQueue::new();
        let source_control = PinnedSourceControl::new(HashMap::from([
            ("acme/api#master".to_string(), "a11ce5".to_string()),
            ("acme/api#feature".to_string(), "fea7ee".to_string()),
            ("acme/web#master".to_string(), "0b0e5e".to_string()),
        ]));
        let collaborators = Collaborators {
            source_control: Arc::new(source_control),
            builds: Arc::new(LocalBuilds::new()),
            queue: Arc::new(queue.clone()),
            notifier: Arc::new(notifier.clone()),
            permissions: Arc::new(OwnerPermissions),
            users: Arc::new(MemoryUsers::new([dev()])),
        };
        let service = IsolationService::new(store.clone(), graph, collaborators);

        let harness = Self {
            store,
            queue,
            notifier,
            service,
        };
        harness.seed();
        harness
    }

    fn seed(&self) {
        self.put_master("web", Some("acme/web"), &[
            "API_URL=http://api-staging-acme.isogrid.local:8080",
            "DB=postgres://db-staging-acme.isogrid.local:5432/web",
        ]);
        self.put_master("api", Some("acme/api"), &["DB=db-staging-acme.isogrid.local"]);
        self.put_master("db", None, &[]);
        for id in ["web-id", "api-id", "db-id"] {
            self.service
                .graph()
                .set_dependencies_from_environment(id, "acme")
                .unwrap();
        }
    }

    fn put_master(&self, name: &str, repo: Option<&str>, env: &[&str]) {
        let scheme = self.service.graph().scheme();
        let mut inst = Instance::new(
            &format!("{name}-id"),
            &format!("{name}1"),
            name,
            acme(),
            &scheme.elastic_hostname(name, "acme"),
        );
        inst.master_pod = true;
        inst.repo = repo.map(str::to_string);
        inst.branch = repo.map(|_| "master".to_string());
        inst.env = env.iter().map(|s| s.to_string()).collect();
        inst.build = Some(BuildRef {
            build_id: format!("build-{name}"),
            commit: None,
        });
        self.store.put_instance(&inst).unwrap();
    }

    fn instance(&self, id: &str) -> Instance {
        self.store.get_instance(id).unwrap().unwrap()
    }

    fn edges(&self, id: &str) -> BTreeSet<String> {
        self.instance(id)
            .dependencies
            .into_iter()
            .map(|n| n.instance_id)
            .collect()
    }

    async fn isolate_web(&self, children: Vec<ChildRequest>) -> CreatedIsolation {
        let request = IsolationRequest {
            master: "web-id".to_string(),
            children,
            redeploy_on_killed: true,
        };
        self.service
            .create_isolation_and_emit_instance_updates(&request, &dev())
            .await
            .unwrap()
    }
}

fn api_following_master() -> ChildRequest {
    ChildRequest {
        org: Some("acme".to_string()),
        repo: Some("api".to_string()),
        match_branch: true,
        ..Default::default()
    }
}

fn db_verbatim() -> ChildRequest {
    ChildRequest {
        instance: Some("db-id".to_string()),
        ..Default::default()
    }
}

fn ids(set: &[&str]) -> BTreeSet<String> {
    set.iter().map(|s| s.to_string()).collect()
}

// ── Create ────────────────────────────────────────────────────────

#[tokio::test]
async fn match_branch_repo_child_is_forked_onto_master_branch() {
    let h = Harness::new();
    let created = h.isolate_web(vec![api_following_master()]).await;

    assert_eq!(created.children.len(), 1);
    let child = &created.children[0];
    assert_eq!(child.name, "web1--api");
    assert_eq!(child.branch.as_deref(), Some("master"));
    assert_eq!(child.commit.as_deref(), Some("a11ce5"));
    assert_eq!(child.isolated.as_deref(), Some(created.isolation.id.as_str()));
    assert!(!child.is_isolation_group_master);
    assert_eq!(child.parent.as_deref(), Some("api1"));

    assert!(created.master.is_master_of(&created.isolation.id));
    assert_eq!(created.isolation.state, IsolationState::Active);
    assert!(created.isolation.redeploy_on_killed);
}

#[tokio::test]
async fn group_edges_follow_membership() {
    let h = Harness::new();
    let created = h.isolate_web(vec![api_following_master(), db_verbatim()]).await;
    let api_fork = created.children.iter().find(|c| c.name == "web1--api").unwrap();
    let db_fork = created.children.iter().find(|c| c.name == "web1--db").unwrap();

    assert_eq!(h.edges("web-id"), ids(&[&api_fork.id, &db_fork.id]));
    assert_eq!(h.edges(&api_fork.id), ids(&[&db_fork.id]));
    assert!(h.edges(&db_fork.id).is_empty());

    // Shared instances keep pointing at shared instances.
    assert_eq!(h.edges("api-id"), ids(&["db-id"]));
}

#[tokio::test]
async fn every_group_has_exactly_one_master() {
    let h = Harness::new();
    let created = h.isolate_web(vec![api_following_master(), db_verbatim()]).await;

    let masters: Vec<Instance> = h
        .store
        .list_isolation_members(&created.isolation.id)
        .unwrap()
        .into_iter()
        .filter(|i| i.is_isolation_group_master)
        .collect();
    assert_eq!(masters.len(), 1);
    assert_eq!(masters[0].id, "web-id");
    assert_eq!(
        h.store
            .find_isolation_master(&created.isolation.id)
            .unwrap()
            .unwrap()
            .id,
        "web-id"
    );
}

#[tokio::test]
async fn create_notifies_members_and_queues_master_redeploy() {
    let h = Harness::new();
    let created = h.isolate_web(vec![db_verbatim()]).await;

    let notified: BTreeSet<String> = h.notifier.events().into_iter().map(|(id, _)| id).collect();
    assert_eq!(notified, ids(&["web-id", &created.children[0].id]));
    assert!(
        h.notifier
            .events()
            .iter()
            .all(|(_, reason)| *reason == UpdateReason::Isolation)
    );
    assert_eq!(
        h.queue.messages(),
        vec![QueueMessage::RedeployInstance {
            instance_id: "web-id".to_string(),
            triggered_by: 42,
        }]
    );
}

#[tokio::test]
async fn failing_notifications_do_not_abort_create() {
    let h = Harness::with_notifier(MemoryNotifier::failing());
    let created = h.isolate_web(vec![db_verbatim()]).await;

    assert_eq!(created.children.len(), 1);
    assert_eq!(h.queue.of_kind("redeploy-instance").len(), 1);
}

#[tokio::test]
async fn already_isolated_master_is_rejected() {
    let h = Harness::new();
    h.isolate_web(vec![db_verbatim()]).await;
    let before = h.store.list_instances().unwrap().len();

    let request = IsolationRequest {
        master: "web-id".to_string(),
        children: vec![db_verbatim()],
        redeploy_on_killed: false,
    };
    let err = h
        .service
        .create_isolation_and_emit_instance_updates(&request, &dev())
        .await
        .unwrap_err();
    assert!(matches!(err, IsolationError::AlreadyIsolated(_)));
    assert_eq!(h.store.list_instances().unwrap().len(), before);
    assert_eq!(h.store.list_isolations().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_child_source_aborts_without_messages_or_edges() {
    let h = Harness::new();
    let web_edges = h.edges("web-id");
    let request = IsolationRequest {
        master: "web-id".to_string(),
        children: vec![ChildRequest {
            instance: Some("ghost".to_string()),
            ..Default::default()
        }],
        redeploy_on_killed: false,
    };

    let err = h
        .service
        .create_isolation_and_emit_instance_updates(&request, &dev())
        .await
        .unwrap_err();
    assert!(matches!(err, IsolationError::NotFound(_)));
    assert!(err.is_terminal());
    assert!(h.queue.messages().is_empty());
    assert!(h.notifier.events().is_empty());
    assert_eq!(h.edges("web-id"), web_edges);
    assert_eq!(h.store.list_instances().unwrap().len(), 3);
}

#[tokio::test]
async fn invalid_request_touches_nothing() {
    let h = Harness::new();
    let request = IsolationRequest {
        master: "web-id".to_string(),
        children: vec![ChildRequest::default()],
        redeploy_on_killed: false,
    };

    let err = h
        .service
        .create_isolation_and_emit_instance_updates(&request, &dev())
        .await
        .unwrap_err();
    assert!(matches!(err, IsolationError::Validation(_)));
    assert!(h.store.list_isolations().unwrap().is_empty());
    assert!(h.instance("web-id").isolated.is_none());
}

// ── Delete ────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_deisolates_master_and_queues_child_deletes() {
    let h = Harness::new();
    let created = h.isolate_web(vec![api_following_master(), db_verbatim()]).await;
    h.queue.take();

    let master = h
        .service
        .delete_isolation_and_emit_instance_updates(&created.isolation.id)
        .await
        .unwrap();
    assert!(master.isolated.is_none());
    assert!(!master.is_isolation_group_master);

    let delete_messages = h.queue.of_kind("delete-instance");
    assert_eq!(delete_messages.len(), 2);
    let deleted: BTreeSet<String> = delete_messages
        .into_iter()
        .filter_map(|m| match m {
            QueueMessage::DeleteInstance { instance_id } => Some(instance_id),
            _ => None,
        })
        .collect();
    let children: BTreeSet<String> = created.children.iter().map(|c| c.id.clone()).collect();
    assert_eq!(deleted, children);
    assert!(!deleted.contains("web-id"));
    assert_eq!(h.queue.of_kind("redeploy-instance").len(), 1);

    assert!(h.store.get_isolation(&created.isolation.id).unwrap().is_none());
    assert_eq!(h.edges("web-id"), ids(&["api-id", "db-id"]));
    assert!(
        h.notifier
            .events()
            .contains(&("web-id".to_string(), UpdateReason::Deisolation))
    );
}

#[tokio::test]
async fn delete_unknown_isolation_is_not_found() {
    let h = Harness::new();
    let err = h.service.delete_isolation("ghost").await.unwrap_err();
    assert!(matches!(err, IsolationError::NotFound(_)));
    assert!(h.queue.messages().is_empty());
}

#[tokio::test]
async fn deleting_a_fork_rewires_dependents_to_its_parent() {
    let h = Harness::new();
    let created = h.isolate_web(vec![api_following_master(), db_verbatim()]).await;
    let api_fork = created.children.iter().find(|c| c.name == "web1--api").unwrap();
    let db_fork = created.children.iter().find(|c| c.name == "web1--db").unwrap();

    let report = h.service.delete_forked_instance(&db_fork.id).await.unwrap();
    let rewired: BTreeSet<String> = report.rewired.into_iter().collect();
    assert_eq!(rewired, ids(&["web-id", &api_fork.id]));
    assert!(h.store.get_instance(&db_fork.id).unwrap().is_none());
    assert_eq!(h.edges(&api_fork.id), ids(&["db-id"]));
    assert!(h.edges("web-id").contains("db-id"));

    let err = h.service.delete_forked_instance("web-id").await.unwrap_err();
    assert!(matches!(err, IsolationError::Validation(_)));
}

// ── Permissions ───────────────────────────────────────────────────

#[tokio::test]
async fn isolation_lookup_checks_ownership() {
    let h = Harness::new();
    let created = h.isolate_web(vec![db_verbatim()]).await;

    let found = h
        .service
        .find_isolation_for_user(&created.isolation.id, &dev())
        .await
        .unwrap();
    assert_eq!(found.id, created.isolation.id);

    let err = h
        .service
        .find_isolation_for_user(&created.isolation.id, &stranger())
        .await
        .unwrap_err();
    assert!(matches!(err, IsolationError::AccessDenied(_)));
}

// ── Lifecycle ─────────────────────────────────────────────────────

#[tokio::test]
async fn redeploy_fires_once_after_every_member_stops() {
    let h = Harness::new();
    let created = h.isolate_web(vec![db_verbatim()]).await;
    let iso = created.isolation.id.clone();
    let monitor = LifecycleMonitor::new(h.service.clone());
    let members = ["web-id".to_string(), created.children[0].id.clone()];
    for id in &members {
        monitor
            .on_container_state(id, &format!("ctr-{id}"), ContainerStatus::Running)
            .await
            .unwrap();
    }
    h.queue.take();

    h.service.kill_isolation(&iso, true).await.unwrap();
    assert_eq!(h.queue.of_kind("kill-instance").len(), 2);

    // Still running: nothing changes.
    assert!(!h.service.redeploy_if_all_killed(&iso).await.unwrap());
    let group = h.store.get_isolation(&iso).unwrap().unwrap();
    assert_eq!(group.state, IsolationState::Killing);

    let first = monitor
        .on_container_state(&members[0], "ctr", ContainerStatus::Exited)
        .await
        .unwrap();
    assert!(!first.redeployed);
    let last = monitor
        .on_container_state(&members[1], "ctr", ContainerStatus::Dead)
        .await
        .unwrap();
    assert!(last.redeployed);

    let group = h.store.get_isolation(&iso).unwrap().unwrap();
    assert_eq!(group.state, IsolationState::Killed);
    assert_eq!(
        h.queue.of_kind("redeploy-isolation"),
        vec![QueueMessage::RedeployIsolation {
            isolation_id: iso.clone()
        }]
    );

    // A late reporter does not fire again.
    assert!(!h.service.redeploy_if_all_killed(&iso).await.unwrap());
    assert_eq!(h.queue.of_kind("redeploy-isolation").len(), 1);
}

#[tokio::test]
async fn kill_without_redeploy_never_transitions() {
    let h = Harness::new();
    let created = h.isolate_web(vec![db_verbatim()]).await;
    h.queue.take();

    let group = h
        .service
        .kill_isolation(&created.isolation.id, false)
        .await
        .unwrap();
    assert_eq!(group.state, IsolationState::Killing);
    assert!(!group.redeploy_on_killed);
    assert!(h.queue.messages().is_empty());
}

// ── Auto-isolation ────────────────────────────────────────────────

fn push_instance(h: &Harness, id: &str, parent: Option<&str>, created_by: GithubId) {
    let mut inst = Instance::new(
        id,
        &format!("{id}-h"),
        id,
        acme(),
        &h.service.graph().scheme().elastic_hostname(id, "acme"),
    );
    inst.parent = parent.map(str::to_string);
    inst.repo = Some("acme/web".to_string());
    inst.branch = Some("feature".to_string());
    inst.created_by = created_by;
    h.store.put_instance(&inst).unwrap();
}

fn configure_web(h: &Harness) {
    h.store
        .put_auto_isolation_config(&AutoIsolationConfig {
            id: "cfg".to_string(),
            instance_id: "web-id".to_string(),
            owner: acme(),
            created_by: 42,
            requested_dependencies: vec![api_following_master(), db_verbatim()],
            redeploy_on_killed: true,
        })
        .unwrap();
}

#[tokio::test]
async fn push_on_configured_master_isolates_new_instance() {
    let h = Harness::new();
    configure_web(&h);
    push_instance(&h, "web-feature", Some("web1"), 42);
    let trigger = AutoIsolationTrigger::new(h.service.clone());

    // Pusher unknown locally: falls back to the creator.
    let outcomes = trigger
        .on_instances_created(&["web-feature".to_string()], Some(999))
        .await;
    let TriggerOutcome::Isolated {
        isolation_id,
        children,
        ..
    } = &outcomes[0]
    else {
        panic!("expected isolation, got {outcomes:?}");
    };
    assert_eq!(*children, 2);

    let master = h.instance("web-feature");
    assert!(master.is_master_of(isolation_id));
    let api_fork = h
        .store
        .list_isolation_members(isolation_id)
        .unwrap()
        .into_iter()
        .find(|i| i.name == "web-feature-h--api")
        .unwrap();
    assert_eq!(api_fork.branch.as_deref(), Some("feature"));
    assert_eq!(api_fork.commit.as_deref(), Some("fea7ee"));
    assert_eq!(api_fork.created_by, 42);
}

#[tokio::test]
async fn push_batch_processes_each_instance_independently() {
    let h = Harness::new();
    configure_web(&h);
    push_instance(&h, "orphan", None, 42);
    push_instance(&h, "api-feature", Some("api1"), 42);
    push_instance(&h, "web-feature", Some("web1"), 42);
    let trigger = AutoIsolationTrigger::new(h.service.clone());

    let batch = ["missing", "orphan", "api-feature", "web-feature"].map(str::to_string);
    let outcomes = trigger.on_instances_created(&batch, None).await;

    assert!(matches!(outcomes[0], TriggerOutcome::Failed { .. }));
    assert!(matches!(outcomes[1], TriggerOutcome::Skipped { .. }));
    assert!(matches!(outcomes[2], TriggerOutcome::Skipped { .. }));
    assert!(matches!(outcomes[3], TriggerOutcome::Isolated { .. }));
    assert_eq!(h.store.list_isolations().unwrap().len(), 1);
}

#[tokio::test]
async fn push_by_unknown_creator_fails() {
    let h = Harness::new();
    configure_web(&h);
    push_instance(&h, "web-feature", Some("web1"), 31337);
    let trigger = AutoIsolationTrigger::new(h.service.clone());

    let outcomes = trigger
        .on_instances_created(&["web-feature".to_string()], None)
        .await;
    assert!(matches!(outcomes[0], TriggerOutcome::Failed { .. }));
    assert!(h.store.list_isolations().unwrap().is_empty());
}
