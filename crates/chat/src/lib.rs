//! QMesh chat layer.
//!
//! Sits between the mesh node and the chat store: encodes and decodes chat
//! payloads, keeps per-channel sequence state, classifies confirmed gaps
//! and repairs them through targeted range or inventory sync.

#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod gap;
pub mod sync;

pub use client::{ChatClient, ChatConfig, NodeMode, RetentionConfig};
pub use error::{ChatError, ChatResult};
pub use gap::{ConfirmedGap, GapDetector};
pub use sync::{ChannelSyncPolicy, SyncConfig, SyncEngine, SyncPolicyMode};

use qmesh_store::{ChatStore, InsertOutcome, StoreError, StoredMessage};

/// Insert a row, absorbing one transient busy condition before giving up.
pub(crate) fn insert_with_retry(
    store: &ChatStore,
    row: &StoredMessage,
) -> Result<InsertOutcome, StoreError> {
    match store.insert(row) {
        Err(StoreError::Busy) => store.insert(row),
        other => other,
    }
}
