//! The public entry point: `put` and `get` by key.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{PdalError, PdalResult};
use crate::failover::FailoverPolicy;
use crate::model::{Access, Key, PartitionId, Record, Role};
use crate::registry::PartitionRegistry;
use crate::store::StoreError;

/// Routes keys to partitions and runs each operation on a pooled
/// connection, failing reads over from replica to primary.
///
/// ```rust,ignore
/// let registry = Arc::new(PartitionRegistry::from_config(&config, factory)?);
/// let data = DataAccess::from_config(&config, registry);
///
/// data.put(&Key::Integer(1), &Record::new(1i64).with("name", "Alice"))?;
/// let alice = data.get(&Key::from("1"))?; // Some(record)
/// let nobody = data.get(&Key::Integer(99))?; // None
/// ```
#[derive(Clone)]
pub struct DataAccess {
    registry: Arc<PartitionRegistry>,
    policy: FailoverPolicy,
    acquire_timeout: Duration,
}

impl DataAccess {
    pub fn new(
        registry: Arc<PartitionRegistry>,
        policy: FailoverPolicy,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            policy,
            acquire_timeout,
        }
    }

    pub fn from_config(config: &Config, registry: Arc<PartitionRegistry>) -> Self {
        Self::new(
            registry,
            FailoverPolicy::new(config.read_preference),
            config.acquire_timeout,
        )
    }

    pub fn registry(&self) -> &PartitionRegistry {
        &self.registry
    }

    /// The partition that owns `key`.
    pub fn route(&self, key: &Key) -> PartitionId {
        self.registry.router().route(key)
    }

    /// Insert `record` under `key` on the owning partition's primary.
    ///
    /// Fails with [`PdalError::Conflict`] when the id already exists and
    /// with [`PdalError::WriteFailed`] for anything else. Writes never
    /// fall back to a replica.
    pub fn put(&self, key: &Key, record: &Record) -> PdalResult<()> {
        if !key.same_record(&record.id) {
            return Err(PdalError::InvalidRecord(format!(
                "key {} does not match record id {}",
                key, record.id
            )));
        }
        let partition = self.route(key);
        let role = self.policy.first_choice(Access::Write, false);
        debug!(%key, %partition, "put");

        let pool = self
            .registry
            .pool_for(partition, role)
            .map_err(|err| PdalError::write_failed(partition, err))?;
        let mut conn = pool
            .acquire(self.acquire_timeout)
            .map_err(|err| PdalError::write_failed(partition, err))?;

        match conn.insert(&pool.endpoint().namespace, record) {
            Ok(()) => Ok(()),
            Err(StoreError::UniqueViolation(_)) => Err(PdalError::Conflict { key: key.clone() }),
            Err(err) => {
                if err.is_transport() {
                    conn.mark_broken();
                }
                Err(PdalError::write_failed(
                    partition,
                    PdalError::from_store(pool.endpoint(), err),
                ))
            }
        }
    }

    /// Look `key` up. `Ok(None)` means the partition holds no such record.
    ///
    /// Reads try the replica first when one is configured, then the
    /// primary once. [`PdalError::ReadFailed`] carries the last failure.
    pub fn get(&self, key: &Key) -> PdalResult<Option<Record>> {
        let partition = self.route(key);
        let mut role = self
            .policy
            .first_choice(Access::Read, self.registry.has_replica(partition));
        debug!(%key, %partition, %role, "get");

        loop {
            match self.read_from(partition, role, key) {
                Ok(found) => return Ok(found),
                Err(err) => match self.policy.next_after(Access::Read, role, &err) {
                    Some(next) => {
                        warn!(%partition, from = %role, to = %next, error = %err, "read failing over");
                        role = next;
                    }
                    None => return Err(PdalError::read_failed(partition, err)),
                },
            }
        }
    }

    fn read_from(&self, partition: PartitionId, role: Role, key: &Key) -> PdalResult<Option<Record>> {
        let pool = self.registry.pool_for(partition, role)?;
        let mut conn = pool.acquire(self.acquire_timeout)?;
        conn.fetch(&pool.endpoint().namespace, key).map_err(|err| {
            if err.is_transport() {
                conn.mark_broken();
            }
            PdalError::from_store(pool.endpoint(), err)
        })
    }
}
