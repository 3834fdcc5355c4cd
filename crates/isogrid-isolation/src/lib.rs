//! isogrid-isolation: isolation groups over the instance store.
//!
//! Clones a set of interdependent instances into an isolated test group,
//! wires the group's dependency edges to each other, and tears the group
//! down as a unit.
//!
//! # Architecture
//!
//! ```text
//! AutoIsolationTrigger ──► IsolationService ──► ForkEngine ──► SourceControl / BuildSubsystem
//!                               │    ▲
//!                               │    └── LifecycleMonitor (container state → killed → redeploy)
//!                               ├──► DependencyGraph (group rewiring, env reconciliation)
//!                               └──► MessageQueue / Notifier
//! ```
//!
//! Collaborators are trait objects (see [`collaborators`]); [`local`] holds
//! in-process implementations.

pub mod collaborators;
pub mod error;
pub mod fork;
pub mod lifecycle;
pub mod local;
pub mod request;
pub mod service;
pub mod trigger;

pub use collaborators::{
    BuildSubsystem, Collaborators, MessageQueue, Notifier, Permissions, QueueMessage,
    SessionUser, SourceControl, UpdateReason, UserDirectory,
};
pub use error::{IsolationError, IsolationResult};
pub use fork::{ForkContext, ForkEngine};
pub use lifecycle::{ContainerStateOutcome, LifecycleMonitor};
pub use request::{ChildRequest, CloneTarget, ForkPlan, IsolationRequest, RepoChild};
pub use service::{CreatedIsolation, IsolationService};
pub use trigger::{AutoIsolationTrigger, TriggerOutcome};
