//! Bounded, blocking connection pool for one endpoint.
//!
//! Every pool has a fixed number of slots. A slot is either idle (holding
//! an open connection), vacant (its connection was discarded and will be
//! reopened on the next acquire), or checked out. `idle + vacant +
//! checked_out == capacity` at all times.
//!
//! When nothing is idle or vacant, [`ConnectionPool::acquire`] parks the
//! calling thread on a condition variable until a release wakes it or the
//! timeout runs out. Each release wakes exactly one waiter.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{PdalError, PdalResult};
use crate::store::{ConnectionFactory, Endpoint, StoreConnection};

/// Point-in-time slot counts of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub vacant: usize,
    pub checked_out: usize,
}

impl PoolStats {
    /// Slots an acquire could take without waiting.
    pub fn available(&self) -> usize {
        self.idle + self.vacant
    }
}

struct PoolState {
    idle: VecDeque<Box<dyn StoreConnection>>,
    vacant: usize,
    checked_out: usize,
    closed: bool,
}

/// A fixed-capacity set of connections to one [`Endpoint`].
pub struct ConnectionPool {
    endpoint: Endpoint,
    factory: Arc<dyn ConnectionFactory>,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ConnectionPool {
    /// Create a pool whose slots all start vacant.
    /// Connections are opened on first use.
    pub fn lazy(
        endpoint: Endpoint,
        factory: Arc<dyn ConnectionFactory>,
        capacity: usize,
    ) -> PdalResult<Self> {
        if capacity == 0 {
            return Err(PdalError::Config(format!(
                "pool for {} needs a capacity of at least 1",
                endpoint
            )));
        }
        Ok(Self {
            endpoint,
            factory,
            capacity,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(capacity),
                vacant: capacity,
                checked_out: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    /// Create a pool and eagerly open every connection.
    pub fn warm(
        endpoint: Endpoint,
        factory: Arc<dyn ConnectionFactory>,
        capacity: usize,
    ) -> PdalResult<Self> {
        let pool = Self::lazy(endpoint, factory, capacity)?;
        let mut opened = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            let conn = pool
                .factory
                .connect(&pool.endpoint)
                .map_err(|err| PdalError::from_store(&pool.endpoint, err))?;
            opened.push_back(conn);
        }
        {
            let mut state = pool.state.lock();
            state.idle = opened;
            state.vacant = 0;
        }
        info!(endpoint = %pool.endpoint, capacity, "pool warmed");
        Ok(pool)
    }

    /// Check a connection out, waiting up to `timeout` for one to free up.
    ///
    /// On timeout the pool is left exactly as it was and
    /// [`PdalError::PoolExhausted`] is returned.
    pub fn acquire(&self, timeout: Duration) -> PdalResult<PooledConnection<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PdalError::PoolClosed {
                    endpoint: self.endpoint.to_string(),
                });
            }
            if let Some(conn) = state.idle.pop_front() {
                state.checked_out += 1;
                debug!(endpoint = %self.endpoint, idle = state.idle.len(), "connection acquired");
                return Ok(PooledConnection::new(self, conn));
            }
            if state.vacant > 0 {
                state.vacant -= 1;
                state.checked_out += 1;
                drop(state);
                return self.reopen();
            }
            if self.available.wait_until(&mut state, deadline).timed_out()
                && state.idle.is_empty()
                && state.vacant == 0
                && !state.closed
            {
                warn!(endpoint = %self.endpoint, ?timeout, "pool exhausted");
                return Err(PdalError::PoolExhausted {
                    endpoint: self.endpoint.to_string(),
                    timeout,
                });
            }
        }
    }

    /// Return a connection to the pool. Equivalent to dropping the handle.
    pub fn release(&self, handle: PooledConnection<'_>) {
        debug_assert!(
            std::ptr::eq(handle.pool, self),
            "handle released to a pool it did not come from"
        );
        drop(handle);
    }

    /// Drop every idle connection and refuse further acquires. Handles
    /// still checked out are closed when they come back.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle = state.idle.len();
            state.vacant += idle;
            state.idle.drain(..).collect()
        };
        self.available.notify_all();
        info!(endpoint = %self.endpoint, drained = drained.len(), "pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: self.capacity,
            idle: state.idle.len(),
            vacant: state.vacant,
            checked_out: state.checked_out,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Fill a vacant slot that the caller already counted as checked out.
    fn reopen(&self) -> PdalResult<PooledConnection<'_>> {
        match self.factory.connect(&self.endpoint) {
            Ok(conn) => {
                debug!(endpoint = %self.endpoint, "connection reopened");
                Ok(PooledConnection::new(self, conn))
            }
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    state.checked_out -= 1;
                    state.vacant += 1;
                }
                self.available.notify_one();
                Err(PdalError::from_store(&self.endpoint, err))
            }
        }
    }

    fn give_back(&self, conn: Box<dyn StoreConnection>, broken: bool) {
        let discard = broken || !conn.is_healthy();
        let discarded = {
            let mut state = self.state.lock();
            state.checked_out -= 1;
            if discard || state.closed {
                state.vacant += 1;
                Some(conn)
            } else {
                state.idle.push_back(conn);
                None
            }
        };
        self.available.notify_one();
        if discard {
            debug!(endpoint = %self.endpoint, "broken connection discarded");
        }
        // Closing may touch the network; keep it outside the lock.
        drop(discarded);
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A checked-out connection.
///
/// Dropping the handle releases it, so every exit path of the caller
/// returns the connection exactly once. Call [`mark_broken`] after a
/// transport failure so the pool discards it instead.
///
/// [`mark_broken`]: PooledConnection::mark_broken
pub struct PooledConnection<'p> {
    pool: &'p ConnectionPool,
    // Only `None` while the handle is being dropped.
    conn: Option<Box<dyn StoreConnection>>,
    broken: bool,
}

impl<'p> PooledConnection<'p> {
    fn new(pool: &'p ConnectionPool, conn: Box<dyn StoreConnection>) -> Self {
        Self {
            pool,
            conn: Some(conn),
            broken: false,
        }
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn endpoint(&self) -> &'p Endpoint {
        &self.pool.endpoint
    }
}

impl fmt::Debug for PooledConnection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("endpoint", &self.pool.endpoint)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Deref for PooledConnection<'_> {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("PooledConnection used after return to pool")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("PooledConnection used after return to pool")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.broken);
        }
    }
}
