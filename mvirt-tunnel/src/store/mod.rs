//! Tunnel descriptor store.
//!
//! The store owns descriptors and the interface-name uniqueness invariant.
//! An interface name is *claimed* by exactly one tunnel id, whether or not that
//! tunnel has been committed yet, so a create still in flight blocks a second
//! create on the same name.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::tunnel::{TunnelDescriptor, TunnelSpec};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unknown tunnel id.
    #[error("tunnel not found: {0}")]
    NotFound(String),

    /// Interface name claimed by another tunnel.
    #[error("interface name '{interface_name}' is already in use by tunnel {holder}")]
    Conflict {
        interface_name: String,
        holder: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be turned back into a descriptor.
    #[error("corrupt tunnel record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store trait for tunnel descriptors.
///
/// Every method is atomic with respect to the others: readers never observe a
/// half-applied commit.
#[async_trait]
pub trait TunnelStore: Send + Sync {
    /// All committed tunnels in creation order.
    async fn list(&self) -> Result<Vec<TunnelDescriptor>>;

    /// A committed tunnel by id.
    async fn get(&self, id: &str) -> Result<TunnelDescriptor>;

    /// Claim the spec's interface name under a fresh id.
    ///
    /// The returned descriptor is not visible to `list`/`get` until committed.
    async fn reserve(&self, spec: TunnelSpec) -> Result<TunnelDescriptor>;

    /// Claim an additional interface name for `id` (rename in progress).
    async fn claim(&self, id: &str, interface_name: &str) -> Result<()>;

    /// Insert or replace a descriptor. Claims of the same id on other names are dropped.
    async fn commit(&self, tunnel: &TunnelDescriptor) -> Result<()>;

    /// Drop claims of `id` that are not backed by its committed descriptor.
    async fn release(&self, id: &str) -> Result<()>;

    /// Remove a committed descriptor and every claim it holds.
    async fn remove(&self, id: &str) -> Result<()>;
}
