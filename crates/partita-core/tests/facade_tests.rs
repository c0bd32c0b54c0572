use partita_core::{
    DataAccess, Endpoint, FailoverPolicy, Key, MemoryFactory, MemoryStore, PartitionId,
    PartitionRegistry, PartitionSpec, PdalError, ReadPreference, Record, Role,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Cluster {
    primary: MemoryStore,
    replica: MemoryStore,
    data: DataAccess,
}

fn cluster(pool_size: usize, with_replica: bool) -> Cluster {
    cluster_with(pool_size, with_replica, MemoryStore::new(), ReadPreference::ReplicaFirst)
}

fn cluster_with(
    pool_size: usize,
    with_replica: bool,
    primary: MemoryStore,
    read_preference: ReadPreference,
) -> Cluster {
    let replica = MemoryStore::replica_of(&primary);
    let factory = MemoryFactory::new();
    factory.register("primary:5432", primary.clone());
    factory.register("replica:5433", replica.clone());

    let specs = (0..2)
        .map(|i| {
            let namespace = format!("partition_{}", i);
            PartitionSpec {
                primary: Endpoint::new(Role::Primary, "primary", 5432).with_namespace(&namespace),
                replica: with_replica
                    .then(|| Endpoint::new(Role::Replica, "replica", 5433).with_namespace(&namespace)),
            }
        })
        .collect();
    let registry = PartitionRegistry::bootstrap(specs, Arc::new(factory), pool_size).unwrap();
    let data = DataAccess::new(
        Arc::new(registry),
        FailoverPolicy::new(read_preference),
        Duration::from_millis(200),
    );
    Cluster {
        primary,
        replica,
        data,
    }
}

fn alice() -> Record {
    Record::new(1i64)
        .with("name", "Alice")
        .with("email", "a@example.com")
}

fn assert_all_released(data: &DataAccess) {
    for stats in data.registry().stats() {
        assert_eq!(stats.primary.checked_out, 0, "{:?}", stats);
        assert_eq!(
            stats.primary.available(),
            stats.primary.capacity,
            "{:?}",
            stats
        );
        if let Some(replica) = stats.replica {
            assert_eq!(replica.checked_out, 0, "{:?}", stats);
        }
    }
}

#[test]
fn test_end_to_end_two_partitions() {
    let c = cluster(2, false);

    assert_eq!(c.data.route(&Key::Integer(1)), PartitionId(1));
    assert_eq!(c.data.route(&Key::Integer(2)), PartitionId(0));

    c.data.put(&Key::Integer(1), &alice()).unwrap();
    c.data
        .put(&Key::Integer(2), &Record::new(2i64).with("name", "Bob"))
        .unwrap();

    assert!(c.primary.contains("partition_1", &Key::Integer(1)));
    assert!(c.primary.contains("partition_0", &Key::Integer(2)));
    assert!(!c.primary.contains("partition_0", &Key::Integer(1)));

    let found = c.data.get(&Key::Integer(1)).unwrap();
    assert_eq!(found, Some(alice()));
    // Numeric text finds the same record.
    assert_eq!(c.data.get(&Key::from("1")).unwrap(), Some(alice()));

    assert_eq!(c.data.get(&Key::Integer(99)).unwrap(), None);
    assert_all_released(&c.data);
}

#[test]
fn test_text_keys() {
    let c = cluster(1, false);
    let key = Key::from("alice@example.com");
    let record = Record::new("alice@example.com").with("name", "Alice");

    c.data.put(&key, &record).unwrap();
    assert_eq!(c.data.get(&key).unwrap(), Some(record));
    assert_eq!(c.data.get(&Key::from("bob@example.com")).unwrap(), None);
}

#[test]
fn test_duplicate_put_conflicts_and_releases() {
    let c = cluster(2, false);

    c.data.put(&Key::Integer(1), &alice()).unwrap();
    let err = c.data.put(&Key::Integer(1), &alice()).unwrap_err();

    assert!(matches!(err, PdalError::Conflict { key: Key::Integer(1) }));
    assert!(!err.is_retryable());
    assert_all_released(&c.data);
    assert_eq!(c.primary.len("partition_1"), 1);
}

#[test]
fn test_key_must_match_record_id() {
    let c = cluster(1, false);
    let err = c.data.put(&Key::Integer(2), &alice()).unwrap_err();
    assert!(matches!(err, PdalError::InvalidRecord(_)));

    // "1" and 1 are the same id.
    c.data.put(&Key::from("1"), &alice()).unwrap();
    assert_all_released(&c.data);
}

#[test]
fn test_get_uses_replica_when_primary_is_down() {
    let c = cluster(2, true);
    c.data.put(&Key::Integer(1), &alice()).unwrap();

    c.primary.set_reachable(false);
    assert_eq!(c.data.get(&Key::Integer(1)).unwrap(), Some(alice()));
    assert_all_released(&c.data);
}

#[test]
fn test_get_falls_back_to_primary_when_replica_is_down() {
    let c = cluster(2, true);
    c.data.put(&Key::Integer(1), &alice()).unwrap();

    c.replica.set_reachable(false);
    assert_eq!(c.data.get(&Key::Integer(1)).unwrap(), Some(alice()));

    // The replica connection that failed was discarded, not returned.
    let stats = c.data.registry().stats();
    let replica = stats[1].replica.unwrap();
    assert_eq!(replica.vacant, 1);
    assert_eq!(replica.checked_out, 0);
    assert_all_released(&c.data);
}

#[test]
fn test_get_falls_back_to_primary_when_replica_pool_is_busy() {
    let c = cluster(1, true);
    c.data.put(&Key::Integer(1), &alice()).unwrap();

    let replica_pool = c.data.registry().pool_for(PartitionId(1), Role::Replica).unwrap();
    let held = replica_pool.acquire(Duration::from_millis(10)).unwrap();

    assert_eq!(c.data.get(&Key::Integer(1)).unwrap(), Some(alice()));
    let replica = c.data.registry().stats()[1].replica.unwrap();
    assert_eq!((replica.idle, replica.checked_out), (0, 1));

    drop(held);
    let replica = c.data.registry().stats()[1].replica.unwrap();
    assert_eq!((replica.idle, replica.vacant, replica.checked_out), (1, 0, 0));
    assert_all_released(&c.data);
}

#[test]
fn test_get_fails_when_both_are_down() {
    let c = cluster(2, true);
    c.data.put(&Key::Integer(1), &alice()).unwrap();

    c.primary.set_reachable(false);
    c.replica.set_reachable(false);
    let err = c.data.get(&Key::Integer(1)).unwrap_err();

    match &err {
        PdalError::ReadFailed { partition, .. } => assert_eq!(*partition, PartitionId(1)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.root().code(), "TRANSPORT_ERROR");
    assert!(err.is_retryable());
    assert_all_released(&c.data);
}

#[test]
fn test_primary_only_reads_skip_replica() {
    let c = cluster_with(1, true, MemoryStore::new(), ReadPreference::PrimaryOnly);
    c.data.put(&Key::Integer(1), &alice()).unwrap();

    c.replica.set_reachable(false);
    assert_eq!(c.data.get(&Key::Integer(1)).unwrap(), Some(alice()));
    // The replica pool was never touched.
    let replica = c.data.registry().stats()[1].replica.unwrap();
    assert_eq!(replica.idle, 1);
}

#[test]
fn test_write_never_falls_back_to_replica() {
    let c = cluster(2, true);
    c.primary.set_reachable(false);

    let err = c.data.put(&Key::Integer(1), &alice()).unwrap_err();
    match &err {
        PdalError::WriteFailed { partition, .. } => assert_eq!(*partition, PartitionId(1)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.root().code(), "TRANSPORT_ERROR");
    assert!(err.is_retryable());

    // The replica was not touched and the broken connection was dropped.
    c.primary.set_reachable(true);
    assert!(!c.primary.contains("partition_1", &Key::Integer(1)));
    let primary = c.data.registry().stats()[1].primary;
    assert_eq!((primary.idle, primary.vacant), (1, 1));
    assert_all_released(&c.data);

    // Once the primary is back the same write goes through.
    c.data.put(&Key::Integer(1), &alice()).unwrap();
}

#[test]
fn test_exhausted_pool_fails_write() {
    let c = cluster(1, false);
    let pool = c.data.registry().pool_for(PartitionId(1), Role::Primary).unwrap();
    let held = pool.acquire(Duration::from_millis(10)).unwrap();

    let err = c.data.put(&Key::Integer(1), &alice()).unwrap_err();
    assert!(matches!(err, PdalError::WriteFailed { .. }));
    assert_eq!(err.root().code(), "POOL_EXHAUSTED");

    drop(held);
    c.data.put(&Key::Integer(1), &alice()).unwrap();
    assert_all_released(&c.data);
}

#[test]
fn test_concurrent_puts_on_small_pool() {
    let primary = MemoryStore::new().with_latency(Duration::from_millis(2));
    let c = cluster_with(2, false, primary, ReadPreference::ReplicaFirst);
    let data = &c.data;

    thread::scope(|s| {
        for worker in 0..8i64 {
            s.spawn(move || {
                for i in 0..10i64 {
                    let id = worker * 100 + i;
                    let record = Record::new(id).with("worker", worker);
                    data.put(&Key::Integer(id), &record)
                        .expect("put under contention should succeed");
                }
            });
        }
    });

    assert_eq!(c.primary.len("partition_0") + c.primary.len("partition_1"), 80);
    assert_all_released(&c.data);
    for stats in c.data.registry().stats() {
        assert_eq!(stats.primary.idle, 2);
    }
}
