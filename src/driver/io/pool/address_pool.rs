use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::lock_api::MutexGuard;
use parking_lot::{Condvar, Mutex, RawMutex};

use super::super::bolt::message_parameters::HelloParameters;
use super::super::bolt::{self, OnServerErrorCb, TcpConnection, TcpRW};
use super::PoolConfig;
use crate::address::Address;
use crate::error::{DriverError, Result};

/// The bounded pool of connections to one server address.
///
/// At all times `idle + borrowed + reservations <= max_connection_pool_size`;
/// a reservation is the permit to open a new connection outside the lock.
#[derive(Debug)]
pub(crate) struct AddressPool(Arc<InnerPool>);

#[derive(Debug)]
pub(crate) struct InnerPool {
    address: Arc<Address>,
    config: Arc<PoolConfig>,
    synced: Mutex<SyncedPoolData>,
    made_room_condition: Condvar,
}

#[derive(Debug)]
struct SyncedPoolData {
    idle: VecDeque<TcpConnection>,
    borrowed: usize,
    reservations: usize,
}

impl InnerPool {
    fn new(address: Arc<Address>, config: Arc<PoolConfig>) -> Self {
        Self {
            address,
            config,
            synced: Mutex::new(SyncedPoolData {
                idle: VecDeque::new(),
                borrowed: 0,
                reservations: 0,
            }),
            made_room_condition: Condvar::new(),
        }
    }

    /// Trade the reservation for a freshly opened, authenticated connection.
    fn acquire_new(&self, deadline: Option<Instant>) -> Result<TcpConnection> {
        let connection = self.open_new(deadline);
        let mut sync = self.synced.lock();
        sync.reservations -= 1;
        let connection = connection?;
        sync.borrowed += 1;
        Ok(connection)
    }

    fn open_new(&self, deadline: Option<Instant>) -> Result<TcpConnection> {
        let mut connection = self.open_socket(deadline)?;
        connection.hello(HelloParameters::new(
            &self.config.user_agent,
            &self.config.auth,
            self.config.routing_context.as_ref(),
        ))?;
        connection.write_all(deadline)?;
        connection.read_all(deadline, None)?;
        Ok(connection)
    }

    fn open_socket(&self, deadline: Option<Instant>) -> Result<TcpConnection> {
        let mut last_err = None;
        let address = Arc::clone(&self.address);
        for address in address.fully_resolve(self.config.resolver.as_deref())? {
            last_err = match address {
                Ok(address) => match bolt::open(
                    address,
                    deadline,
                    self.config.connection_timeout,
                    self.config.keep_alive,
                    self.config.tls_config.as_ref().map(Arc::clone),
                ) {
                    Ok(connection) => return Ok(connection),
                    Err(err) => {
                        info!("failed to open connection: {err}");
                        Some(Err(err))
                    }
                },
                Err(err) => {
                    info!("failed to resolve address: {err}");
                    Some(Err(DriverError::connect_err(err)))
                }
            }
        }
        last_err.expect("fully_resolve returned an empty iterator")
    }
}

impl AddressPool {
    pub(crate) fn new(address: Arc<Address>, config: Arc<PoolConfig>) -> Self {
        Self(Arc::new(InnerPool::new(address, config)))
    }

    /// Acquire an idle connection or a reservation to create one, waiting
    /// (FIFO via the condition variable) until room frees up or the deadline
    /// passes.
    pub(crate) fn acquire(&self, deadline: Option<Instant>) -> Result<UnpreparedConnection> {
        {
            let mut synced = self.synced.lock();
            loop {
                if let Some(connection) = self.acquire_idle_locked(&mut synced) {
                    return Ok(UnpreparedConnection::new(
                        Some(connection),
                        Arc::clone(&self.0),
                    ));
                }
                if self.has_room(&synced) {
                    synced.reservations += 1;
                    break;
                }
                self.wait_for_room(deadline, &mut synced)?;
            }
        }
        Ok(UnpreparedConnection::new(None, Arc::clone(&self.0)))
    }

    /// Like [`AddressPool::acquire`], but `None` instead of waiting when the
    /// pool is exhausted.
    pub(crate) fn acquire_no_wait(&self) -> Option<UnpreparedConnection> {
        {
            let mut synced = self.synced.lock();
            if let Some(connection) = self.acquire_idle_locked(&mut synced) {
                return Some(UnpreparedConnection::new(
                    Some(connection),
                    Arc::clone(&self.0),
                ));
            }
            if self.has_room(&synced) {
                synced.reservations += 1;
            } else {
                return None;
            }
        }
        Some(UnpreparedConnection::new(None, Arc::clone(&self.0)))
    }

    fn wait_for_room(
        &self,
        deadline: Option<Instant>,
        synced: &mut MutexGuard<RawMutex, SyncedPoolData>,
    ) -> Result<()> {
        match deadline {
            None => self.made_room_condition.wait(synced),
            Some(deadline) => {
                if self
                    .made_room_condition
                    .wait_until(synced, deadline)
                    .timed_out()
                {
                    return Err(DriverError::acquisition_timeout(
                        "waiting for room in the connection pool",
                    ));
                }
            }
        }
        Ok(())
    }

    fn has_room(&self, synced: &SyncedPoolData) -> bool {
        synced.idle.len() + synced.borrowed + synced.reservations
            < self.config.max_connection_pool_size
    }

    fn acquire_idle_locked(&self, synced: &mut SyncedPoolData) -> Option<TcpConnection> {
        let connection = synced.idle.pop_front();
        if connection.is_some() {
            synced.borrowed += 1;
        }
        connection
    }

    pub(crate) fn in_use(&self) -> usize {
        let synced = self.synced.lock();
        synced.borrowed + synced.reservations
    }

    fn release(inner_pool: &Arc<InnerPool>, mut connection: TcpConnection) {
        let mut lock = inner_pool.synced.lock();
        lock.borrowed -= 1;
        if connection.needs_reset() {
            let res = connection
                .reset()
                .and_then(|_| connection.write_all(None))
                .and_then(|_| connection.read_all(None, None));
            if res.is_err() {
                info!("ignoring failure during reset, dropping connection");
            }
        }
        if !connection.closed() {
            lock.idle.push_back(connection);
        }
        inner_pool.made_room_condition.notify_one();
    }
}

impl Deref for AddressPool {
    type Target = InnerPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// An acquisition that still has to produce a usable connection: either by
/// opening one (a reservation) or by health-checking the idle connection it
/// holds.
#[derive(Debug)]
pub(crate) struct UnpreparedConnection {
    pool: Arc<InnerPool>,
    connection: Option<TcpConnection>,
}

impl UnpreparedConnection {
    fn new(connection: Option<TcpConnection>, pool: Arc<InnerPool>) -> Self {
        Self { pool, connection }
    }

    /// Returns `Ok(None)` when the held connection turned out to be unusable
    /// (stale or failing its liveness check); the caller is expected to try
    /// again.
    pub(crate) fn prepare(
        mut self,
        deadline: Option<Instant>,
        idle_time_before_connection_test: Option<Duration>,
        on_server_error: OnServerErrorCb<TcpRW>,
    ) -> Result<Option<PooledConnection>> {
        let connection = self.connection.take();
        let pool = Arc::clone(&self.pool);
        let Some(mut connection) = connection else {
            let connection = self.pool.acquire_new(deadline)?;
            return Ok(Some(PooledConnection::new(connection, pool)));
        };
        if let Some(max_lifetime) = self.pool.config.max_connection_lifetime {
            if connection.is_older_than(max_lifetime) {
                connection.debug_log(|| String::from("connection reached max lifetime"));
                connection.close();
                AddressPool::release(&self.pool, connection);
                return Ok(None);
            }
        }
        if let Some(timeout) = idle_time_before_connection_test {
            if let Err(err) =
                Self::liveness_check(&mut connection, timeout, deadline, on_server_error)
            {
                connection.debug_log(|| format!("liveness check failed: {err}"));
                AddressPool::release(&self.pool, connection);
                return Ok(None);
            }
        }
        Ok(Some(PooledConnection::new(connection, pool)))
    }

    fn liveness_check(
        connection: &mut TcpConnection,
        timeout: Duration,
        deadline: Option<Instant>,
        on_server_error: OnServerErrorCb<TcpRW>,
    ) -> Result<()> {
        if connection.is_idle_for(timeout) {
            connection.debug_log(|| String::from("liveness check"));
            connection.reset()?;
            connection.write_all(None)?;
            connection.read_all(deadline, on_server_error)?;
        }
        Ok(())
    }
}

impl Drop for UnpreparedConnection {
    fn drop(&mut self) {
        // A reservation (no connection held) is accounted for by
        // `acquire_new` inside `prepare`; `prepare` is always called.
        let Some(connection) = self.connection.take() else {
            return;
        };
        AddressPool::release(&self.pool, connection);
    }
}

/// A connection checked out of an [`AddressPool`]; returns itself on drop.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    pool: Arc<InnerPool>,
    connection: Option<TcpConnection>,
}

impl PooledConnection {
    fn new(connection: TcpConnection, pool: Arc<InnerPool>) -> Self {
        Self {
            pool,
            connection: Some(connection),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let connection = self
            .connection
            .take()
            .expect("connection is Some from init to drop");
        AddressPool::release(&self.pool, connection);
    }
}

impl Deref for PooledConnection {
    type Target = TcpConnection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("connection is Some from init to drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("connection is Some from init to drop")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::driver::config::auth::AuthToken;

    fn test_pool(max_size: usize) -> AddressPool {
        AddressPool::new(
            Arc::new(Address::from(("localhost", 7687))),
            Arc::new(PoolConfig {
                routing_context: None,
                tls_config: None,
                user_agent: String::from("test"),
                auth: Arc::new(AuthToken::new_none_auth()),
                max_connection_lifetime: Some(Duration::from_secs(3600)),
                max_connection_pool_size: max_size,
                connection_timeout: Some(Duration::from_secs(1)),
                keep_alive: None,
                connection_acquisition_timeout: Some(Duration::from_secs(1)),
                resolver: None,
            }),
        )
    }

    #[test]
    fn hands_out_at_most_max_size_permits() {
        let pool = test_pool(2);
        let first = pool.acquire_no_wait();
        let second = pool.acquire_no_wait();
        assert!(first.is_some());
        assert!(second.is_some());
        assert_eq!(pool.in_use(), 2);
        // idle + borrowed + reservations is capped
        assert!(pool.acquire_no_wait().is_none());
    }

    #[test]
    fn acquiring_with_expired_deadline_times_out() {
        let pool = test_pool(1);
        let _permit = pool.acquire_no_wait().expect("pool has room");
        let deadline = Instant::now() - Duration::from_millis(1);
        let res = pool.acquire(Some(deadline));
        assert!(matches!(res, Err(DriverError::Timeout { .. })));
    }
}
