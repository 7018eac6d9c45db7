mod address_pool;
mod routing;

use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::io::{Read, Write};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use atomic_refcell::AtomicRefCell;
use itertools::Itertools;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLockReadGuard};
use rustls::ClientConfig;

use super::bolt::message_parameters::RouteParameters;
use super::bolt::{ConnectionData, ResponseCallbacks};
use crate::address::{Address, AddressResolver};
use crate::bookmarks::Bookmarks;
use crate::driver::config::auth::AuthToken;
use crate::driver::config::KeepAliveConfig;
use crate::driver::RoutingControl;
use crate::error::{DriverError, Result, ServerError};
use crate::sync::MostlyReadLock;
use crate::value::Value;

use address_pool::{AddressPool, PooledConnection, UnpreparedConnection};
use routing::RoutingTable;

// a reasonable common upper bound for cluster sizes, not a hard limit
const DEFAULT_CLUSTER_SIZE: usize = 7;

type Addresses = Vec<Arc<Address>>;
type RoutingTables = HashMap<Option<Arc<String>>, RoutingTable>;
type RoutingPools = HashMap<Arc<Address>, AddressPool>;

#[derive(Debug)]
pub(crate) struct PoolConfig {
    pub(crate) routing_context: Option<HashMap<String, Value>>,
    pub(crate) tls_config: Option<Arc<ClientConfig>>,
    pub(crate) user_agent: String,
    pub(crate) auth: Arc<AuthToken>,
    pub(crate) max_connection_lifetime: Option<Duration>,
    pub(crate) max_connection_pool_size: usize,
    pub(crate) connection_timeout: Option<Duration>,
    pub(crate) keep_alive: Option<KeepAliveConfig>,
    pub(crate) connection_acquisition_timeout: Option<Duration>,
    pub(crate) resolver: Option<Box<dyn AddressResolver>>,
}

impl PoolConfig {
    pub(crate) fn connection_acquisition_deadline(&self) -> Option<Instant> {
        self.connection_acquisition_timeout.map(|t| Instant::now() + t)
    }
}

/// The driver's connection pool: direct (one address) or routing (one
/// [`AddressPool`] per cluster member plus the routing-table cache).
#[derive(Debug)]
pub(crate) struct Pool {
    pub(crate) config: Arc<PoolConfig>,
    pools: Pools,
}

impl Pool {
    pub(crate) fn new(address: Arc<Address>, config: PoolConfig) -> Self {
        let config = Arc::new(config);
        let pools = Pools::new(address, Arc::clone(&config));
        Self { config, pools }
    }

    #[inline]
    pub(crate) fn is_routing(&self) -> bool {
        self.config.routing_context.is_some()
    }

    /// Fetch a routing table with an empty database hint and report which
    /// database the server considers home.
    pub(crate) fn resolve_home_db(&self, args: UpdateRtArgs) -> Result<Option<Arc<String>>> {
        let Pools::Routing(pools) = &self.pools else {
            panic!("don't call resolve_home_db on a direct pool")
        };
        assert!(args.db.is_none(), "don't call resolve_home_db with a database");
        let mut resolved_db = None;
        {
            let resolved_db = &mut resolved_db;
            drop(pools.routing_tables.update(move |mut rts| {
                *resolved_db = pools.update_rts(args, &mut rts)?;
                Ok(())
            })?);
        }
        Ok(resolved_db)
    }

    pub(crate) fn acquire(&self, args: AcquireConfig) -> Result<LeasedConnection<'_>> {
        Ok(LeasedConnection {
            connection: Some(match &self.pools {
                Pools::Direct(single_pool) => {
                    let mut connection = None;
                    while connection.is_none() {
                        connection = single_pool.acquire(args.update_rt_args.deadline)?.prepare(
                            args.update_rt_args.deadline,
                            args.update_rt_args.idle_time_before_connection_test,
                            None,
                        )?;
                    }
                    connection.expect("loop above asserts existence")
                }
                Pools::Routing(routing_pool) => routing_pool.acquire(args)?,
            }),
            pool: self,
        })
    }

    fn handle_server_error<RW: Read + Write>(
        &self,
        data: &mut ConnectionData<RW>,
        error: &mut ServerError,
    ) -> Result<()> {
        let Pools::Routing(pool) = &self.pools else {
            return Ok(());
        };
        pool.handle_server_error(data.address(), error)
    }

    fn deactivate_server(&self, address: &Address) {
        if let Pools::Routing(routing_pool) = &self.pools {
            routing_pool.deactivate_server(address)
        }
    }
}

#[derive(Debug)]
enum Pools {
    Direct(AddressPool),
    Routing(RoutingPool),
}

impl Pools {
    fn new(address: Arc<Address>, config: Arc<PoolConfig>) -> Self {
        match config.routing_context {
            None => Pools::Direct(AddressPool::new(address, config)),
            Some(_) => Pools::Routing(RoutingPool::new(address, config)),
        }
    }
}

/// The lease a session holds on a pooled connection.
///
/// I/O goes through [`LeasedConnection::write_all`]/[`read_one`]/[`read_all`]
/// so the pool can observe transport failures and server errors (dropping
/// dead cluster members from the routing table).
#[derive(Debug)]
pub(crate) struct LeasedConnection<'pool> {
    connection: Option<PooledConnection>,
    pool: &'pool Pool,
}

impl LeasedConnection<'_> {
    fn wrap_io(&mut self, mut io_op: impl FnMut(&mut Self) -> Result<()>) -> Result<()> {
        let was_broken = self.deref().unexpectedly_closed();
        let res = io_op(self);
        if !was_broken && self.deref().unexpectedly_closed() {
            self.pool.deactivate_server(&self.deref().address())
        }
        res
    }

    #[inline]
    pub(crate) fn write_all(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.wrap_io(|this| this.deref_mut().write_all(deadline))
    }

    #[inline]
    pub(crate) fn read_one(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.wrap_io(|this| {
            let pool = this.pool;
            let mut cb =
                move |data: &mut ConnectionData<_>, error: &mut ServerError| {
                    pool.handle_server_error(data, error)
                };
            this.connection
                .as_mut()
                .expect("connection is Some from init to drop")
                .deref_mut()
                .read_one(deadline, Some(&mut cb))
        })
    }

    #[inline]
    pub(crate) fn read_all(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.wrap_io(|this| {
            let pool = this.pool;
            let mut cb =
                move |data: &mut ConnectionData<_>, error: &mut ServerError| {
                    pool.handle_server_error(data, error)
                };
            this.connection
                .as_mut()
                .expect("connection is Some from init to drop")
                .deref_mut()
                .read_all(deadline, Some(&mut cb))
        })
    }
}

impl Deref for LeasedConnection<'_> {
    type Target = PooledConnection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("connection is Some from init to drop")
    }
}

impl DerefMut for LeasedConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("connection is Some from init to drop")
    }
}

impl Drop for LeasedConnection<'_> {
    fn drop(&mut self) {
        let connection = self
            .connection
            .take()
            .expect("connection is Some from init to drop");
        match &self.pool.pools {
            Pools::Direct(_) => drop(connection),
            Pools::Routing(pool) => {
                let _lock = pool.wait_cond.0.lock();
                drop(connection);
                pool.wait_cond.1.notify_all();
            }
        }
    }
}

#[derive(Debug)]
struct RoutingPool {
    pools: MostlyReadLock<RoutingPools>,
    wait_cond: Arc<(Mutex<()>, Condvar)>,
    routing_tables: MostlyReadLock<RoutingTables>,
    address: Arc<Address>,
    config: Arc<PoolConfig>,
}

impl RoutingPool {
    fn new(address: Arc<Address>, config: Arc<PoolConfig>) -> Self {
        assert!(config.routing_context.is_some());
        Self {
            pools: MostlyReadLock::new(HashMap::with_capacity(DEFAULT_CLUSTER_SIZE)),
            wait_cond: Arc::new((Mutex::new(()), Condvar::new())),
            routing_tables: MostlyReadLock::new(HashMap::new()),
            address,
            config,
        }
    }

    fn acquire(&self, args: AcquireConfig) -> Result<PooledConnection> {
        debug!(
            "acquiring {:?} connection towards {}",
            args.mode,
            args.update_rt_args
                .db
                .map(|db| format!("{:?}", db.db))
                .unwrap_or_else(|| String::from("the default database"))
        );
        let (mut targets, db) = self.choose_addresses_from_fresh_rt(args)?;
        let deadline = args.update_rt_args.deadline;
        'target: for target in &targets {
            while let Some(connection) = self.acquire_routing_address_no_wait(target) {
                let mut on_server_error = |data: &mut ConnectionData<_>, error: &mut _| {
                    self.handle_server_error(data.address(), error)
                };
                match connection.prepare(
                    deadline,
                    args.update_rt_args.idle_time_before_connection_test,
                    Some(&mut on_server_error),
                ) {
                    Ok(Some(connection)) => return Ok(connection),
                    Ok(None) => continue,
                    Err(DriverError::Disconnect { .. }) => {
                        self.deactivate_server(target);
                        continue 'target;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // all fitting servers are maxed out: wait for a connection to return
        let mut cond_lock = self.wait_cond.0.lock();
        loop {
            targets = self.choose_addresses(args, &db)?;
            // a connection might have been returned while the lock was not
            // held, so try again before waiting
            let connection = targets
                .iter()
                .filter_map(|target| self.acquire_routing_address_no_wait(target))
                .next();
            if let Some(connection) = connection {
                drop(cond_lock);
                let mut on_server_error = |data: &mut ConnectionData<_>, error: &mut _| {
                    self.handle_server_error(data.address(), error)
                };
                match connection.prepare(
                    deadline,
                    args.update_rt_args.idle_time_before_connection_test,
                    Some(&mut on_server_error),
                ) {
                    Ok(Some(connection)) => return Ok(connection),
                    Ok(None) => {
                        cond_lock = self.wait_cond.0.lock();
                        continue;
                    }
                    Err(DriverError::Disconnect { .. }) => {
                        self.deactivate_server(&targets[0]);
                        cond_lock = self.wait_cond.0.lock();
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            match deadline {
                None => self.wait_cond.1.wait(&mut cond_lock),
                Some(deadline) => {
                    if self
                        .wait_cond
                        .1
                        .wait_until(&mut cond_lock, deadline)
                        .timed_out()
                    {
                        return Err(DriverError::acquisition_timeout(
                            "waiting for room in the connection pool",
                        ));
                    }
                }
            }
        }
    }

    /// Guarantees that the returned list is not empty.
    fn choose_addresses_from_fresh_rt(
        &self,
        args: AcquireConfig,
    ) -> Result<(Addresses, Option<Arc<String>>)> {
        let (lock, db) = self.get_fresh_rt(args)?;
        let rt = lock.get(&db).expect("created above");
        Ok((self.servers_by_usage(rt.servers_for_mode(args.mode))?, db))
    }

    /// Guarantees that the returned list is not empty.
    fn choose_addresses(&self, args: AcquireConfig, db: &Option<Arc<String>>) -> Result<Addresses> {
        let rts = self.routing_tables.read();
        self.servers_by_usage(
            rts.get(db)
                .map(|rt| rt.servers_for_mode(args.mode))
                .unwrap_or(&[]),
        )
    }

    fn acquire_routing_address_no_wait(
        &self,
        target: &Arc<Address>,
    ) -> Option<UnpreparedConnection> {
        let pools = self.ensure_pool_exists(target);
        pools
            .get(target)
            .expect("just created above")
            .acquire_no_wait()
    }

    fn acquire_routing_address(
        &self,
        target: &Arc<Address>,
        args: UpdateRtArgs,
    ) -> Result<PooledConnection> {
        let mut connection = None;
        while connection.is_none() {
            let unprepared = {
                let pools = self.ensure_pool_exists(target);
                pools
                    .get(target)
                    .expect("just created above")
                    .acquire(args.deadline)
            }?;
            let mut on_server_error = |data: &mut ConnectionData<_>, error: &mut _| {
                self.handle_server_error(data.address(), error)
            };
            connection = unprepared.prepare(
                args.deadline,
                args.idle_time_before_connection_test,
                Some(&mut on_server_error),
            )?;
        }
        Ok(connection.expect("loop above asserts existence"))
    }

    fn ensure_pool_exists(&self, target: &Arc<Address>) -> RwLockReadGuard<'_, RoutingPools> {
        self.pools
            .maybe_write(
                |pools| !pools.contains_key(target),
                |mut pools| {
                    pools.insert(
                        Arc::clone(target),
                        AddressPool::new(Arc::clone(target), Arc::clone(&self.config)),
                    );
                    Ok(())
                },
            )
            .expect("updater is infallible")
    }

    fn get_fresh_rt(
        &self,
        args: AcquireConfig,
    ) -> Result<(RwLockReadGuard<'_, RoutingTables>, Option<Arc<String>>)> {
        let rt_args = args.update_rt_args;
        let db_key = rt_args.rt_key();
        let db_name = AtomicRefCell::new(rt_args.db_request());
        let db_name_ref = &db_name;
        let lock = self.routing_tables.maybe_write(
            |rts| {
                let needs_update = rts
                    .get(&db_key)
                    .map(|rt| !rt.is_fresh(args.mode))
                    .unwrap_or(true);
                if !needs_update {
                    db_name_ref.borrow_mut().clone_from(&db_key);
                }
                needs_update
            },
            |mut rts| {
                let key = rt_args.rt_key();
                let rt = rts.entry(key).or_insert_with(|| self.empty_rt());
                if !rt.is_fresh(args.mode) {
                    let mut new_db = self.update_rts(rt_args, &mut rts)?;
                    if new_db.is_some() && db_name_ref.borrow().is_none() {
                        std::mem::swap(&mut *db_name_ref.borrow_mut(), &mut new_db);
                    }
                }
                Ok(())
            },
        )?;
        Ok((lock, db_name.into_inner()))
    }

    /// Order the role's addresses least-used first.
    /// Guarantees that the returned list is not empty.
    fn servers_by_usage(&self, addresses: &[Arc<Address>]) -> Result<Addresses> {
        Ok(match addresses.len() {
            0 => return Err(DriverError::disconnect("routing options depleted")),
            1 => vec![Arc::clone(&addresses[0])],
            _ => {
                let pools = self.pools.read();
                addresses
                    .iter()
                    .map(|addr| (addr, pools.get(addr).map(|p| p.in_use()).unwrap_or(0)))
                    .sorted_unstable_by_key(|(_, usage)| *usage)
                    .map(|(addr, _)| Arc::clone(addr))
                    .collect()
            }
        })
    }

    fn update_rts(
        &self,
        args: UpdateRtArgs,
        rts: &mut RoutingTables,
    ) -> Result<Option<Arc<String>>> {
        debug!("fetching new routing table for {:?}", args.db);
        let rt_key = args.rt_key();
        let rt = rts.entry(rt_key).or_insert_with(|| self.empty_rt());
        let prefer_initial_router = rt.initialized_without_writers;
        let routers = rt
            .routers
            .iter()
            .filter(|&r| r != &self.address)
            .map(Arc::clone)
            .collect::<Vec<_>>();
        let mut new_rt;
        if prefer_initial_router {
            new_rt = self.fetch_rt_from_routers(&[Arc::clone(&self.address)], args, rts)?;
            if new_rt.is_err() && !routers.is_empty() {
                new_rt = self.fetch_rt_from_routers(&routers, args, rts)?;
            }
        } else {
            new_rt = self.fetch_rt_from_routers(&routers, args, rts)?;
            if new_rt.is_err() {
                new_rt = self.fetch_rt_from_routers(&[Arc::clone(&self.address)], args, rts)?;
            }
        }
        match new_rt {
            Err(err) => {
                error!("failed to update routing table; last error: {err}");
                Err(DriverError::disconnect(format!(
                    "unable to retrieve routing information; last error: {err}"
                )))
            }
            Ok(mut new_rt) => {
                let db = match args.db {
                    Some(args_db) if !args_db.guess => {
                        let db = Some(Arc::clone(&args_db.db));
                        new_rt.database.clone_from(&db);
                        db
                    }
                    _ => new_rt.database.clone(),
                };
                debug!("storing new routing table for {db:?}: {new_rt:?}");
                rts.insert(db.as_ref().map(Arc::clone), new_rt);
                self.clean_up_pools(rts);
                if let Some(cb) = args.db_resolution_cb {
                    cb(db.as_ref().map(Arc::clone));
                }
                Ok(db)
            }
        }
    }

    /// `Ok(Err(_))` is a discovery failure worth trying the next router for;
    /// `Err(_)` aborts discovery.
    fn fetch_rt_from_routers(
        &self,
        routers: &[Arc<Address>],
        args: UpdateRtArgs,
        rts: &mut RoutingTables,
    ) -> Result<Result<RoutingTable>> {
        let mut last_err = None;
        for router in routers {
            for resolution in Arc::clone(router).fully_resolve(self.config.resolver.as_deref())? {
                let Ok(resolved) = resolution else {
                    self.deactivate_server_locked_rts(router, rts);
                    continue;
                };
                match Self::wrap_discovery_error(
                    self.acquire_routing_address(&resolved, args)
                        .and_then(|mut con| self.fetch_rt_from_router(&mut con, args)),
                )? {
                    Ok(rt) => return Ok(Ok(rt)),
                    Err(err) => last_err = Some(err),
                };
                self.deactivate_server_locked_rts(&resolved, rts);
            }
        }
        Ok(Err(last_err.unwrap_or_else(|| {
            DriverError::disconnect("no known routers left")
        })))
    }

    fn fetch_rt_from_router(
        &self,
        con: &mut PooledConnection,
        args: UpdateRtArgs,
    ) -> Result<RoutingTable> {
        let rt = Arc::new(AtomicRefCell::new(None));
        con.route(
            RouteParameters::new(
                self.config
                    .routing_context
                    .as_ref()
                    .expect("routing pools always have a routing context"),
                args.bookmarks,
                args.db_request_str(),
                args.imp_user,
            ),
            ResponseCallbacks::new().with_on_success({
                let rt = Arc::clone(&rt);
                move |meta| {
                    let mut res = match RoutingTable::try_parse(meta) {
                        Ok(new_rt) => Some(Ok(new_rt)),
                        Err(e) => {
                            warn!("failed to parse routing table: {e}");
                            Some(Err(DriverError::protocol_error(format!("{e}"))))
                        }
                    };
                    std::mem::swap(&mut *rt.borrow_mut(), &mut res);
                    Ok(())
                }
            }),
        )?;
        con.write_all(None)?;
        con.read_all(None, None)?;
        let rt = Arc::try_unwrap(rt).expect("read_all flushes all response callbacks");
        let rt = rt.into_inner().ok_or_else(|| {
            DriverError::protocol_error(
                "server did not reply with SUCCESS or FAILURE to the routing request",
            )
        })?;
        if let Ok(rt) = &rt {
            if rt.routers.is_empty() {
                debug!("received routing table without routers -> discarded");
                // Not strictly a disconnect, but it signals that this table
                // must not be used, the router should be invalidated, and the
                // next one tried.
                return Err(DriverError::disconnect(
                    "received routing table without routers",
                ));
            }
            if rt.readers.is_empty() {
                debug!("received routing table without readers -> discarded");
                return Err(DriverError::disconnect(
                    "received routing table without readers",
                ));
            }
            // An empty writer list is usually transient (leader election) and
            // must not invalidate the router that reported it.
        }
        rt
    }

    fn empty_rt(&self) -> RoutingTable {
        RoutingTable::new(Arc::clone(&self.address))
    }

    /// Drop per-address pools for servers no routing table mentions anymore.
    fn clean_up_pools(&self, rts: &mut RoutingTables) {
        drop(self.pools.update(|mut pools| {
            let used_addresses = rts
                .values()
                .flat_map(|rt| {
                    [&rt.readers, &rt.routers, &rt.writers]
                        .into_iter()
                        .flatten()
                        .map(Arc::clone)
                })
                .collect::<HashSet<_>>();
            pools.retain(|address, _| used_addresses.contains(address));
            Ok(())
        }));
    }

    fn deactivate_server(&self, address: &Address) {
        drop(self.routing_tables.update(|mut rts| {
            drop(self.pools.update(|mut pools| {
                Self::deactivate_server_locked(address, &mut rts, &mut pools);
                Ok(())
            }));
            Ok(())
        }));
    }

    fn deactivate_server_locked_rts(&self, address: &Address, rts: &mut RoutingTables) {
        drop(self.pools.update(|mut pools| {
            Self::deactivate_server_locked(address, rts, &mut pools);
            Ok(())
        }));
    }

    fn deactivate_server_locked(
        address: &Address,
        rts: &mut RoutingTables,
        pools: &mut RoutingPools,
    ) {
        debug!("deactivating address: {address:?}");
        rts.values_mut().for_each(|rt| rt.deactivate(address));
        pools.remove(address);
    }

    fn deactivate_writer(&self, address: &Address) {
        drop(self.routing_tables.update(|mut rts| {
            debug!("deactivating writer: {address:?}");
            rts.values_mut().for_each(|rt| rt.deactivate_writer(address));
            Ok(())
        }));
    }

    fn handle_server_error(&self, address: &Arc<Address>, error: &mut ServerError) -> Result<()> {
        if error.deactivates_server() {
            self.deactivate_server(address);
        } else if error.invalidates_writer() {
            self.deactivate_writer(address);
        }
        Ok(())
    }

    fn wrap_discovery_error<T>(res: Result<T>) -> Result<Result<T>> {
        match res {
            Ok(t) => Ok(Ok(t)),
            Err(e) => {
                if e.fatal_during_discovery() {
                    Err(e)
                } else {
                    info!("ignored error during discovery: {e:?}");
                    Ok(Err(e))
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct AcquireConfig<'a> {
    pub(crate) mode: RoutingControl,
    pub(crate) update_rt_args: UpdateRtArgs<'a>,
}

#[derive(Copy, Clone)]
pub(crate) struct UpdateRtArgs<'a> {
    pub(crate) db: Option<&'a UpdateRtDb>,
    pub(crate) bookmarks: Option<&'a Bookmarks>,
    pub(crate) imp_user: Option<&'a str>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) idle_time_before_connection_test: Option<Duration>,
    pub(crate) db_resolution_cb: Option<&'a dyn Fn(Option<Arc<String>>)>,
}

impl Debug for UpdateRtArgs<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateRtArgs")
            .field("db", &self.db)
            .field("bookmarks", &self.bookmarks)
            .field("imp_user", &self.imp_user)
            .field("deadline", &self.deadline)
            .field(
                "idle_time_before_connection_test",
                &self.idle_time_before_connection_test,
            )
            .field(
                "db_resolution_cb",
                &self.db_resolution_cb.as_ref().map(|_| "..."),
            )
            .finish()
    }
}

impl UpdateRtArgs<'_> {
    fn rt_key(&self) -> Option<Arc<String>> {
        self.db.as_ref().map(|db| Arc::clone(&db.db))
    }

    fn db_request_str(&self) -> Option<&str> {
        self.db.as_ref().and_then(|db| match db.guess {
            true => None,
            false => Some(db.db.as_str()),
        })
    }

    fn db_request(&self) -> Option<Arc<String>> {
        self.db.as_ref().and_then(|db| match db.guess {
            true => None,
            false => Some(Arc::clone(&db.db)),
        })
    }
}

/// The database a session targets, and whether that is an unconfirmed guess
/// (carried over home-database resolution) or explicit.
#[derive(Debug, Clone)]
pub(crate) struct UpdateRtDb {
    pub(crate) db: Arc<String>,
    pub(crate) guess: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::config::auth::AuthToken;

    fn routing_pool() -> RoutingPool {
        RoutingPool::new(
            Arc::new(Address::from(("router", 7687))),
            Arc::new(PoolConfig {
                routing_context: Some(HashMap::new()),
                tls_config: None,
                user_agent: String::from("test"),
                auth: Arc::new(AuthToken::new_none_auth()),
                max_connection_lifetime: None,
                max_connection_pool_size: 100,
                connection_timeout: None,
                keep_alive: None,
                connection_acquisition_timeout: None,
                resolver: None,
            }),
        )
    }

    #[test]
    fn server_selection_is_a_permutation_of_the_role_list() {
        let pool = routing_pool();
        let addresses: Addresses = ["a:7687", "b:7687", "c:7687"]
            .into_iter()
            .map(|a| Arc::new(Address::from(a)))
            .collect();
        let chosen = pool.servers_by_usage(&addresses).unwrap();
        assert_eq!(chosen.len(), addresses.len());
        for address in &addresses {
            assert_eq!(chosen.iter().filter(|a| *a == address).count(), 1, "{address}");
        }
    }

    #[test]
    fn empty_role_list_means_no_routing_options() {
        let pool = routing_pool();
        let res = pool.servers_by_usage(&[]);
        assert!(matches!(res, Err(DriverError::Disconnect { .. })));
    }
}
