use anyhow::Result;
use async_trait::async_trait;
use stratus_common::{PoolFilter, PoolRecord};

pub mod allocator;
pub mod store;

pub use allocator::{Allocation, PoolAllocator};
pub use store::{PoolStore, VmUpdate};

/// Reserve-by-filter matching of free pool records.
#[async_trait]
pub trait PoolReservation: Send + Sync {
    /// Claims a Free record matching `filter` for `agent_id`. `None` means
    /// nothing in the pool fits.
    async fn reserve(&self, filter: &PoolFilter, agent_id: &str) -> Result<Option<PoolRecord>>;

    async fn lookup(&self, cid: i64) -> Result<Option<PoolRecord>>;
}
