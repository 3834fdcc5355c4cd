//! IsoGrid dependency graph.
//!
//! Every instance carries its outgoing "depends-on" edges as an embedded
//! list of [`GraphNode`](isogrid_state::GraphNode) snapshots, so hostname
//! resolution never needs a join. This crate owns every mutation of that
//! list and keeps the per-instance DNS cache coherent with it.
//!
//! # Components
//!
//! - **`graph`**: add/remove edges, env reconciliation, group rewiring,
//!   removal of a deleted instance from its dependents
//! - **`dns`**: per-instance resolution cache keyed by canonical hostname

pub mod dns;
pub mod error;
pub mod graph;

pub use dns::DnsCache;
pub use error::{GraphError, GraphResult};
pub use graph::{DependencyGraph, EdgeChange, EdgeDiff, RewireReport, generate_graph_node};
