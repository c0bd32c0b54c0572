//! Per-partition pools and the startup bootstrap that creates them.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, PartitionSpec};
use crate::error::{PdalError, PdalResult};
use crate::model::{PartitionId, Role};
use crate::pool::{ConnectionPool, PoolStats};
use crate::router::PartitionRouter;
use crate::store::ConnectionFactory;

struct Partition {
    primary: ConnectionPool,
    replica: Option<ConnectionPool>,
}

/// Pool counts for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStats {
    pub partition: PartitionId,
    pub primary: PoolStats,
    pub replica: Option<PoolStats>,
}

/// Owns every partition's primary pool and optional replica pool.
///
/// Built once by [`PartitionRegistry::bootstrap`]; the partition count
/// never changes afterwards.
pub struct PartitionRegistry {
    router: PartitionRouter,
    partitions: Vec<Partition>,
}

impl PartitionRegistry {
    /// Prepare every partition before any traffic is served.
    ///
    /// For each partition, in order: make sure the namespace and record
    /// table exist on the primary, then warm the primary pool, then try to
    /// warm the replica pool. Any primary failure aborts the bootstrap. A
    /// replica that cannot be reached is left out and its partition reads
    /// from the primary.
    pub fn bootstrap(
        specs: Vec<PartitionSpec>,
        factory: Arc<dyn ConnectionFactory>,
        pool_size: usize,
    ) -> PdalResult<Self> {
        let router = PartitionRouter::new(specs.len() as u32)?;
        let mut partitions = Vec::with_capacity(specs.len());

        for (id, spec) in router.partitions().zip(specs) {
            ensure_schema(&spec, factory.as_ref())
                .map_err(|err| PdalError::bootstrap(id, err))?;

            let primary = ConnectionPool::warm(spec.primary, Arc::clone(&factory), pool_size)
                .map_err(|err| PdalError::bootstrap(id, err))?;

            let replica = match spec.replica {
                Some(endpoint) => {
                    match ConnectionPool::warm(endpoint, Arc::clone(&factory), pool_size) {
                        Ok(pool) => Some(pool),
                        Err(err) => {
                            warn!(partition = %id, error = %err, "replica unavailable, reads will use the primary");
                            None
                        }
                    }
                }
                None => None,
            };

            info!(partition = %id, replica = replica.is_some(), "partition ready");
            partitions.push(Partition { primary, replica });
        }

        info!(partitions = partitions.len(), pool_size, "bootstrap complete");
        Ok(Self { router, partitions })
    }

    /// Bootstrap from loaded configuration.
    pub fn from_config(config: &Config, factory: Arc<dyn ConnectionFactory>) -> PdalResult<Self> {
        Self::bootstrap(config.partitions.clone(), factory, config.pool_size)
    }

    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    pub fn partition_count(&self) -> u32 {
        self.router.partition_count()
    }

    /// The pool serving `role` for `partition`.
    pub fn pool_for(&self, partition: PartitionId, role: Role) -> PdalResult<&ConnectionPool> {
        let entry = self.partitions.get(partition.index());
        let pool = match role {
            Role::Primary => entry.map(|p| &p.primary),
            Role::Replica => entry.and_then(|p| p.replica.as_ref()),
        };
        pool.ok_or(PdalError::NoSuchPool { partition, role })
    }

    pub fn has_replica(&self, partition: PartitionId) -> bool {
        self.partitions
            .get(partition.index())
            .is_some_and(|p| p.replica.is_some())
    }

    pub fn stats(&self) -> Vec<PartitionStats> {
        self.router
            .partitions()
            .zip(&self.partitions)
            .map(|(partition, p)| PartitionStats {
                partition,
                primary: p.primary.stats(),
                replica: p.replica.as_ref().map(ConnectionPool::stats),
            })
            .collect()
    }

    /// Drain and close every pool.
    pub fn shutdown(&self) {
        for p in &self.partitions {
            p.primary.close();
            if let Some(replica) = &p.replica {
                replica.close();
            }
        }
        info!("all partitions shut down");
    }
}

fn ensure_schema(spec: &PartitionSpec, factory: &dyn ConnectionFactory) -> PdalResult<()> {
    let endpoint = &spec.primary;
    let mut conn = factory
        .connect(endpoint)
        .map_err(|err| PdalError::from_store(endpoint, err))?;
    conn.ensure_schema(&endpoint.namespace)
        .map_err(|err| PdalError::from_store(endpoint, err))
}
