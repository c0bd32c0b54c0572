//! # partita-core
//!
//! Partitioned data access: a key is routed to one of a fixed set of
//! partitions, and the operation runs on a connection drawn from that
//! partition's bounded pool.
//!
//! ## Features
//! - **Deterministic routing**: the same key always lands on the same partition.
//! - **Bounded pools**: exhaustion blocks the caller instead of opening more connections.
//! - **Exactly-once release**: pooled handles return themselves on drop.
//! - **Read failover**: reads fall back from replica to primary once; writes never leave the primary.

pub mod config;
pub mod error;
pub mod facade;
pub mod failover;
pub mod logging;
pub mod memory;
pub mod model;
pub mod pool;
pub mod prelude;
pub mod registry;
pub mod router;
pub mod store;

pub use config::{Config, PartitionSpec};
pub use error::{PdalError, PdalResult};
pub use facade::DataAccess;
pub use failover::{FailoverPolicy, ReadPreference};
pub use memory::{MemoryFactory, MemoryStore};
pub use model::{Access, Key, PartitionId, Record, Role};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use registry::{PartitionRegistry, PartitionStats};
pub use router::PartitionRouter;
pub use store::{ConnectionFactory, Endpoint, StoreConnection, StoreError, StoreResult};
