//! isogrid-state: embedded instance store for IsoGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for instances, isolation groups, auto-isolation configurations,
//! and the outbox used by the standalone message queue.
//!
//! # Architecture
//!
//! All documents are JSON-serialized into redb's `&[u8]` value columns and
//! keyed by id. There are no multi-document transactions: every write touches
//! exactly one document, and read-modify-write helpers (`update_instance`,
//! `update_isolation_if`) run inside a single write transaction so they are
//! atomic per document.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, epoch_secs};
pub use types::*;
