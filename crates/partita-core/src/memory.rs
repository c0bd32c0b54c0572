//! In-process store backend.
//!
//! Good for development and testing. A [`MemoryStore`] behaves like one
//! database server: it holds a table per namespace, can be switched
//! unreachable to simulate an outage, and can stand in as a read-only
//! replica that shares its primary's data.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::model::{Key, Record, Role};
use crate::store::{ConnectionFactory, Endpoint, StoreConnection, StoreError, StoreResult};

type Tables = HashMap<String, HashMap<String, Record>>;

/// One simulated database server.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    reachable: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    read_only: bool,
    latency: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(HashMap::new())),
            reachable: Arc::new(AtomicBool::new(true)),
            connects: Arc::new(AtomicUsize::new(0)),
            read_only: false,
            latency: Duration::ZERO,
        }
    }

    /// A read-only server that sees everything written to `primary`, with
    /// its own reachability switch.
    pub fn replica_of(primary: &MemoryStore) -> Self {
        Self {
            read_only: true,
            ..Self::sharing(primary)
        }
    }

    /// Another server over the same tables. Whether it accepts writes is
    /// decided per connection by the endpoint's role.
    fn sharing(other: &MemoryStore) -> Self {
        Self {
            tables: Arc::clone(&other.tables),
            reachable: Arc::new(AtomicBool::new(true)),
            connects: Arc::new(AtomicUsize::new(0)),
            read_only: false,
            latency: other.latency,
        }
    }

    /// Sleep this long inside every insert and fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of connections opened against this server so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.tables.lock().contains_key(namespace)
    }

    /// Number of records in a namespace.
    pub fn len(&self, namespace: &str) -> usize {
        self.tables.lock().get(namespace).map_or(0, HashMap::len)
    }

    pub fn contains(&self, namespace: &str, key: &Key) -> bool {
        self.tables
            .lock()
            .get(namespace)
            .is_some_and(|table| table.contains_key(&key.canonical()))
    }

    fn check_reachable(&self) -> StoreResult<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(StoreError::Transport("connection refused".to_string()))
        }
    }

    fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
    }
}

/// A connection handed out by [`MemoryFactory`].
pub struct MemoryConnection {
    store: MemoryStore,
    read_only: bool,
    broken: bool,
}

impl MemoryConnection {
    fn guard(&mut self) -> StoreResult<()> {
        if self.broken {
            return Err(StoreError::Transport("connection is closed".to_string()));
        }
        if let Err(err) = self.store.check_reachable() {
            self.broken = true;
            return Err(err);
        }
        Ok(())
    }
}

impl StoreConnection for MemoryConnection {
    fn ensure_schema(&mut self, namespace: &str) -> StoreResult<()> {
        self.guard()?;
        let mut tables = self.store.tables.lock();
        if tables.contains_key(namespace) {
            return Ok(());
        }
        if self.read_only {
            return Err(StoreError::Rejected(format!(
                "cannot create schema {} on a read-only server",
                namespace
            )));
        }
        tables.insert(namespace.to_string(), HashMap::new());
        Ok(())
    }

    fn insert(&mut self, namespace: &str, record: &Record) -> StoreResult<()> {
        self.guard()?;
        if self.read_only {
            return Err(StoreError::Rejected(
                "cannot execute INSERT on a read-only server".to_string(),
            ));
        }
        self.store.simulate_latency();
        let mut tables = self.store.tables.lock();
        let table = tables
            .get_mut(namespace)
            .ok_or_else(|| StoreError::Rejected(format!("schema {} does not exist", namespace)))?;
        let id = record.id.canonical();
        if table.contains_key(&id) {
            return Err(StoreError::UniqueViolation(format!(
                "duplicate key {} in {}",
                id, namespace
            )));
        }
        table.insert(id, record.clone());
        Ok(())
    }

    fn fetch(&mut self, namespace: &str, key: &Key) -> StoreResult<Option<Record>> {
        self.guard()?;
        self.store.simulate_latency();
        let tables = self.store.tables.lock();
        let table = tables
            .get(namespace)
            .ok_or_else(|| StoreError::Rejected(format!("schema {} does not exist", namespace)))?;
        Ok(table.get(&key.canonical()).cloned())
    }

    fn is_healthy(&self) -> bool {
        !self.broken
    }
}

/// Routes endpoint addresses to registered [`MemoryStore`]s.
#[derive(Default)]
pub struct MemoryFactory {
    stores: RwLock<HashMap<String, MemoryStore>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `store` at `address` (`host:port`).
    pub fn register(&self, address: &str, store: MemoryStore) {
        self.stores.write().insert(address.to_string(), store);
    }

    pub fn store(&self, address: &str) -> Option<MemoryStore> {
        self.stores.read().get(address).cloned()
    }

    /// Stand up a store for every address in `config`.
    ///
    /// Every address gets its own reachability switch and connection count,
    /// but all of them serve one set of tables, so a replica sees what its
    /// primary wrote whichever addresses the partitions share. Replica
    /// endpoints connect read-only.
    pub fn provision(config: &Config) -> Self {
        let factory = Self::new();
        let origin = MemoryStore::new();
        let endpoints = config
            .partitions
            .iter()
            .flat_map(|spec| std::iter::once(&spec.primary).chain(spec.replica.as_ref()));
        for endpoint in endpoints {
            let address = endpoint.address();
            if factory.store(&address).is_none() {
                factory.register(&address, MemoryStore::sharing(&origin));
            }
        }
        factory
    }
}

impl ConnectionFactory for MemoryFactory {
    fn connect(&self, endpoint: &Endpoint) -> StoreResult<Box<dyn StoreConnection>> {
        let address = endpoint.address();
        let store = self
            .store(&address)
            .ok_or_else(|| StoreError::Transport(format!("nothing listening at {}", address)))?;
        store.check_reachable()?;
        store.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            read_only: store.read_only || endpoint.role == Role::Replica,
            store,
            broken: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(factory: &MemoryFactory, address: &str) -> StoreResult<Box<dyn StoreConnection>> {
        let (host, port) = address.split_once(':').unwrap();
        factory.connect(&Endpoint::new(Role::Primary, host, port.parse().unwrap()))
    }

    #[test]
    fn test_insert_fetch_and_duplicate() {
        let factory = MemoryFactory::new();
        factory.register("db:1", MemoryStore::new());
        let mut conn = connect(&factory, "db:1").unwrap();

        conn.ensure_schema("p0").unwrap();
        conn.ensure_schema("p0").unwrap();
        conn.insert("p0", &Record::new(1i64).with("name", "Alice")).unwrap();

        let found = conn.fetch("p0", &Key::from("1")).unwrap().unwrap();
        assert_eq!(found.get("name").unwrap(), "Alice");
        assert!(conn.fetch("p0", &Key::Integer(2)).unwrap().is_none());

        let dup = conn.insert("p0", &Record::new(1i64)).unwrap_err();
        assert!(matches!(dup, StoreError::UniqueViolation(_)));
        assert!(conn.is_healthy());
    }

    #[test]
    fn test_unreachable_store_breaks_connection() {
        let store = MemoryStore::new();
        let factory = MemoryFactory::new();
        factory.register("db:1", store.clone());
        let mut conn = connect(&factory, "db:1").unwrap();
        conn.ensure_schema("p0").unwrap();

        store.set_reachable(false);
        assert!(conn.fetch("p0", &Key::Integer(1)).unwrap_err().is_transport());
        assert!(!conn.is_healthy());
        assert!(connect(&factory, "db:1").is_err());

        // A broken connection stays broken after the outage ends.
        store.set_reachable(true);
        assert!(conn.fetch("p0", &Key::Integer(1)).is_err());
        assert!(connect(&factory, "db:1").is_ok());
        assert_eq!(store.connect_count(), 2);
    }

    #[test]
    fn test_replica_is_read_only_and_shares_data() {
        let primary = MemoryStore::new();
        let replica = MemoryStore::replica_of(&primary);
        let factory = MemoryFactory::new();
        factory.register("db:1", primary.clone());
        factory.register("db:2", replica.clone());

        let mut p = connect(&factory, "db:1").unwrap();
        p.ensure_schema("p0").unwrap();
        p.insert("p0", &Record::new(7i64)).unwrap();

        let mut r = connect(&factory, "db:2").unwrap();
        assert!(r.fetch("p0", &Key::Integer(7)).unwrap().is_some());
        assert!(matches!(
            r.insert("p0", &Record::new(8i64)),
            Err(StoreError::Rejected(_))
        ));
        assert!(r.is_healthy());
    }

    #[test]
    fn test_unknown_address_is_transport_error() {
        let factory = MemoryFactory::new();
        let err = connect(&factory, "nowhere:1").err().unwrap();
        assert!(err.is_transport());
    }

    fn provisioned(vars: &[(&str, &str)]) -> (Config, MemoryFactory) {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::from_lookup(|name| vars.get(name).cloned()).unwrap();
        let factory = MemoryFactory::provision(&config);
        (config, factory)
    }

    #[test]
    fn test_provision_replica_sees_primary_writes() {
        let (config, factory) = provisioned(&[
            ("PARTITION_COUNT", "1"),
            ("PARTITION_0_PRIMARY_URL", "postgres://db1:5432/app"),
            ("PARTITION_0_REPLICA_URL", "postgres://db2:5432/app"),
        ]);
        let spec = &config.partitions[0];
        let replica = spec.replica.as_ref().unwrap();

        let mut p = factory.connect(&spec.primary).unwrap();
        p.ensure_schema("partition_0").unwrap();
        p.insert("partition_0", &Record::new(3i64)).unwrap();

        let mut r = factory.connect(replica).unwrap();
        assert!(r.fetch("partition_0", &Key::Integer(3)).unwrap().is_some());
        assert!(matches!(
            r.insert("partition_0", &Record::new(4i64)),
            Err(StoreError::Rejected(_))
        ));
    }

    #[test]
    fn test_provision_address_shared_by_replica_and_later_primary() {
        // Partition 0's replica lives on the server that is partition 1's primary.
        let (config, factory) = provisioned(&[
            ("PARTITION_COUNT", "2"),
            ("PARTITION_0_PRIMARY_URL", "postgres://db1:5432/app"),
            ("PARTITION_0_REPLICA_URL", "postgres://db2:5432/app"),
            ("PARTITION_1_PRIMARY_URL", "postgres://db2:5432/app"),
        ]);
        let primary_1 = &config.partitions[1].primary;

        let mut conn = factory.connect(primary_1).unwrap();
        conn.ensure_schema("partition_1").unwrap();
        conn.insert("partition_1", &Record::new(1i64)).unwrap();

        let mut replica_0 = factory.connect(config.partitions[0].replica.as_ref().unwrap()).unwrap();
        assert!(replica_0.ensure_schema("partition_0").is_err());
        assert_eq!(factory.store("db2:5432").unwrap().connect_count(), 2);
    }
}
