//! QMesh persistent chat store.
//!
//! SQLite-backed, keyed by `(origin_id, seqno)`, idempotent by
//! construction. The mesh forwarding path never touches this store; the
//! chat layer is its only writer.

#![warn(missing_docs)]

pub mod error;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use store::{ChatStore, InsertOutcome, StoredMessage};
