pub(crate) mod bookmarks;
pub(crate) mod config;
pub(crate) mod retry;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Instant;

use atomic_refcell::AtomicRefCell;
use log::{debug, info};

use super::io::bolt::message_parameters::{BeginParameters, RunParameters};
use super::io::bolt::{BoltMeta, ResponseCallbacks};
use super::io::pool::{AcquireConfig, LeasedConnection, Pool, UpdateRtArgs, UpdateRtDb};
use super::record_stream::{ErrorPropagator, RecordStream, SharedErrorPropagator};
use super::transaction::{InnerTransaction, Transaction, TransactionTimeout};
use super::{EagerResult, ReducedDriverConfig, RoutingControl};
use crate::error::Result;
use crate::value::Value;
use bookmarks::{bookmark_managers, BookmarkManager, Bookmarks};
pub use config::SessionConfig;
use retry::RetryPolicy;

// imports for docs
#[allow(unused)]
use super::Driver;
#[allow(unused)]
use retry::ExponentialBackoff;

/// A logical conversation scope: a series of transactions with shared
/// bookmarks, database, and access-mode defaults.
///
/// Sessions automatically provide causal chaining: every transaction can read
/// the writes of any previous transaction in the same session. Chains across
/// sessions are built by passing [`Session::last_bookmarks()`] along or by
/// sharing a [`BookmarkManager`].
///
/// A session is **not** meant for concurrent use: it runs at most one
/// transaction at a time (auto-commit included) and is therefore handed out
/// as `&mut self`. Sessions are cheap to create; use one per unit of work.
///
/// See [`Driver::session()`].
#[derive(Debug)]
pub struct Session<'driver> {
    config: SessionConfig,
    pool: &'driver Pool,
    driver_config: &'driver ReducedDriverConfig,
    target_db: Arc<AtomicRefCell<SessionTargetDb>>,
    session_bookmarks: SessionBookmarks,
    current_acquisition_deadline: Option<Instant>,
}

impl<'driver> Session<'driver> {
    pub(super) fn new(
        config: SessionConfig,
        pool: &'driver Pool,
        driver_config: &'driver ReducedDriverConfig,
    ) -> Self {
        let bookmarks = config.bookmarks.clone();
        let manager = config.bookmark_manager.clone();
        let target_db = Arc::new(AtomicRefCell::new(SessionTargetDb::new_init(
            config.database.clone(),
        )));
        Session {
            config,
            pool,
            driver_config,
            target_db,
            session_bookmarks: SessionBookmarks::new(bookmarks, manager),
            current_acquisition_deadline: None,
        }
    }

    /// Prepare a query that manages its own transaction (auto-commit).
    ///
    /// This mode is required for queries like `CALL {...} IN TRANSACTION`.
    /// Its drawback: the only commit guarantee is that the transaction went
    /// through once all results have been consumed.
    pub fn auto_commit<'session>(
        &'session mut self,
        query: impl Into<String>,
    ) -> AutoCommitBuilder<'driver, 'session, DefaultReceiver> {
        AutoCommitBuilder::new(self, query.into())
    }

    /// Prepare an explicit transaction.
    pub fn transaction<'session>(&'session mut self) -> TransactionBuilder<'driver, 'session> {
        TransactionBuilder::new(self)
    }

    /// Run `receiver` in a managed read transaction, retrying per
    /// `retry_policy`. See [`TransactionBuilder::run_with_retry()`].
    pub fn execute_read<R, P: RetryPolicy>(
        &mut self,
        retry_policy: P,
        receiver: impl FnMut(Transaction) -> Result<R>,
    ) -> StdResult<R, P::Error> {
        self.transaction()
            .with_routing_control(RoutingControl::Read)
            .run_with_retry(retry_policy, receiver)
    }

    /// Run `receiver` in a managed write transaction, retrying per
    /// `retry_policy`. See [`TransactionBuilder::run_with_retry()`].
    pub fn execute_write<R, P: RetryPolicy>(
        &mut self,
        retry_policy: P,
        receiver: impl FnMut(Transaction) -> Result<R>,
    ) -> StdResult<R, P::Error> {
        self.transaction()
            .with_routing_control(RoutingControl::Write)
            .run_with_retry(retry_policy, receiver)
    }

    /// The bookmarks this session's own commits produced, or the ones it was
    /// initialized with until the first commit.
    ///
    /// Bookmarks obtained from a [`BookmarkManager`] are deliberately not
    /// included; chain through the manager instead.
    #[inline]
    pub fn last_bookmarks(&self) -> Arc<Bookmarks> {
        self.session_bookmarks.get_current_bookmarks()
    }

    fn auto_commit_run<R, FRes: FnOnce(&mut RecordStream) -> Result<R>>(
        &mut self,
        builder: AutoCommitBuilder<'driver, '_, FRes>,
    ) -> Result<R> {
        let mode = self.effective_mode(builder.mode);
        let connection = self.acquire_connection(mode)?;
        let fetch_size = self.fetch_size();
        let mut record_stream =
            RecordStream::new(Rc::new(RefCell::new(connection)), fetch_size, true, None);
        let bookmarks = self.session_bookmarks.get_bookmarks_for_work()?;
        let target_db = self.target_db.borrow().as_db();
        let imp_user = self.config.impersonated_user.clone();
        let res = record_stream
            .run(
                RunParameters::new_auto_commit_run(
                    builder.query.as_str(),
                    Some(&builder.parameters),
                    Some(&bookmarks),
                    builder.timeout.raw(),
                    Some(&builder.meta),
                    Some(mode.as_protocol_str()),
                    target_db.as_deref().map(String::as_str),
                    imp_user.as_deref().map(String::as_str),
                ),
                Some(Box::new(self.make_db_meta_resolution_cb())),
            )
            .and_then(|_| (builder.receiver)(&mut record_stream));
        let res = match res {
            Ok(r) => {
                record_stream.consume()?;
                Ok(r)
            }
            Err(e) => {
                let _ = record_stream.consume();
                Err(e)
            }
        };
        if let Some(bookmark) = record_stream.into_bookmark() {
            self.session_bookmarks.update_bookmarks(bookmark)?;
        }
        res
    }

    fn transaction_run<R, FTx: FnOnce(Transaction) -> Result<R>>(
        &mut self,
        builder: &TransactionBuilder<'driver, '_>,
        receiver: FTx,
    ) -> Result<R> {
        let mode = self.effective_mode(builder.mode);
        let connection = self.acquire_connection(mode)?;
        let fetch_size = self.fetch_size();
        let error_propagator = SharedErrorPropagator::default();
        let mut tx = InnerTransaction::new(connection, fetch_size, Arc::clone(&error_propagator));
        let bookmarks = self.session_bookmarks.get_bookmarks_for_work()?;
        let target_db = self.target_db.borrow().as_db();
        let imp_user = self.config.impersonated_user.clone();
        let parameters = BeginParameters::new(
            Some(&bookmarks),
            builder.timeout.raw(),
            Some(&builder.meta),
            Some(mode.as_protocol_str()),
            target_db.as_deref().map(String::as_str),
            imp_user.as_deref().map(String::as_str),
        );
        let callbacks = ResponseCallbacks::new()
            .with_on_success({
                let mut db_cb = self.make_db_meta_resolution_cb();
                move |mut meta| {
                    db_cb(&mut meta);
                    Ok(())
                }
            })
            .with_on_failure(ErrorPropagator::make_on_error_cb(error_propagator));
        tx.begin(parameters, callbacks)?;
        let res = receiver(Transaction::new(&mut tx));
        let res = match res {
            Ok(_) => {
                tx.close()?;
                res
            }
            Err(_) => {
                if let Err(e) = tx.close() {
                    info!(
                        "while propagating a user-code error: \
                         ignored tx.close() error: {e}"
                    );
                }
                res
            }
        };
        if let Some(bookmark) = tx.into_bookmark() {
            self.session_bookmarks.update_bookmarks(bookmark)?;
        }
        res
    }

    fn effective_mode(&self, builder_mode: Option<RoutingControl>) -> RoutingControl {
        builder_mode
            .or(self.config.default_access_mode)
            .unwrap_or(RoutingControl::Write)
    }

    fn resolve_db(&mut self) -> Result<()> {
        {
            let mut target_db = self.target_db.borrow_mut();
            if target_db.pinned
                || target_db
                    .target
                    .as_ref()
                    .map(|t| !t.guess)
                    .unwrap_or_default()
                || !self.pool.is_routing()
            {
                debug!(
                    "targeting fixed db: {:?}",
                    target_db.target.as_ref().map(|t| t.db.as_str())
                );
                target_db.pinned = true;
                return Ok(());
            }
        }
        debug!("resolving home db");
        self.pool
            .resolve_home_db(UpdateRtArgs {
                db: None,
                bookmarks: Some(&*self.session_bookmarks.get_bookmarks_for_work()?),
                imp_user: self.config.impersonated_user.as_deref().map(String::as_str),
                deadline: self.current_acquisition_deadline,
                idle_time_before_connection_test: self
                    .driver_config
                    .idle_time_before_connection_test,
                db_resolution_cb: Some(&self.make_db_resolution_cb()),
            })
            .map(drop)
    }

    fn make_db_meta_resolution_cb(&self) -> impl FnMut(&mut BoltMeta) + Send + Sync + 'static {
        let base_cb = self.make_db_resolution_cb();
        move |meta| {
            let db = match meta.remove("db") {
                Some(Value::String(db)) => Some(Arc::new(db)),
                _ => None,
            };
            base_cb(db);
        }
    }

    fn make_db_resolution_cb_if_needed(
        &self,
    ) -> Option<impl Fn(Option<Arc<String>>) + Send + Sync + 'static> {
        if !self.pool.is_routing() {
            return None;
        }
        {
            let target_db = self.target_db.borrow();
            if target_db.pinned || !target_db.target.as_ref().map(|t| t.guess).unwrap_or(true) {
                return None;
            }
        }
        Some(self.make_db_resolution_cb())
    }

    fn make_db_resolution_cb(&self) -> impl Fn(Option<Arc<String>>) + Send + Sync + 'static {
        let target_db = Arc::clone(&self.target_db);
        move |db| {
            let mut target_db = target_db.borrow_mut();
            if !target_db.pinned {
                debug!("pinning db: {:?}", db.as_ref().map(|d| d.as_str()));
                *target_db = SessionTargetDb::new_pinned(db);
            }
        }
    }

    pub(super) fn acquire_connection(
        &mut self,
        mode: RoutingControl,
    ) -> Result<LeasedConnection<'driver>> {
        self.current_acquisition_deadline = self.pool.config.connection_acquisition_deadline();
        self.resolve_db()?;
        let bookmarks = self.session_bookmarks.get_bookmarks_for_work()?;
        let target = self.target_db.borrow().target.clone();
        self.pool.acquire(AcquireConfig {
            mode,
            update_rt_args: UpdateRtArgs {
                db: target.as_ref(),
                bookmarks: Some(&bookmarks),
                imp_user: self.config.impersonated_user.as_deref().map(String::as_str),
                deadline: self.current_acquisition_deadline,
                idle_time_before_connection_test: self
                    .driver_config
                    .idle_time_before_connection_test,
                db_resolution_cb: self
                    .make_db_resolution_cb_if_needed()
                    .as_ref()
                    .map(|cb| cb as _),
            },
        })
    }

    #[inline]
    fn fetch_size(&self) -> i64 {
        self.config
            .fetch_size
            .unwrap_or(self.driver_config.fetch_size)
    }
}

/// Builder for auto-commit queries, see [`Session::auto_commit()`].
pub struct AutoCommitBuilder<'driver, 'session, FRes> {
    session: Option<&'session mut Session<'driver>>,
    query: String,
    parameters: HashMap<String, Value>,
    meta: HashMap<String, Value>,
    timeout: TransactionTimeout,
    mode: Option<RoutingControl>,
    receiver: FRes,
}

fn default_receiver(res: &mut RecordStream) -> Result<EagerResult> {
    res.try_as_eager_result().map(|r| {
        r.expect("the default receiver does not consume the stream before collecting it")
    })
}

pub(crate) type DefaultReceiver = fn(&mut RecordStream) -> Result<EagerResult>;

impl<'driver, 'session> AutoCommitBuilder<'driver, 'session, DefaultReceiver> {
    fn new(session: &'session mut Session<'driver>, query: String) -> Self {
        Self {
            session: Some(session),
            query,
            parameters: Default::default(),
            meta: Default::default(),
            timeout: Default::default(),
            mode: None,
            receiver: default_receiver,
        }
    }
}

impl<'driver, 'session, R, FRes: FnOnce(&mut RecordStream) -> Result<R>>
    AutoCommitBuilder<'driver, 'session, FRes>
{
    /// Query parameters.
    ///
    /// Always prefer parameters over string manipulation: they rule out
    /// injection attacks and allow the server to cache the query plan.
    #[inline]
    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Use no query parameters (the *default*).
    #[inline]
    pub fn without_parameters(mut self) -> Self {
        self.parameters = Default::default();
        self
    }

    /// Attach transaction metadata, visible in the server's query log and in
    /// `SHOW TRANSACTIONS`.
    #[inline]
    pub fn with_transaction_meta(mut self, meta: HashMap<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Use no transaction metadata (the *default*).
    #[inline]
    pub fn without_transaction_meta(mut self) -> Self {
        self.meta = Default::default();
        self
    }

    /// Instruct the server to abort the transaction after the given timeout.
    #[inline]
    pub fn with_transaction_timeout(mut self, timeout: TransactionTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether to send the query to a reader or a writer of the cluster.
    ///
    /// Defaults to [`SessionConfig::with_default_access_mode()`], which in
    /// turn defaults to [`RoutingControl::Write`].
    #[inline]
    pub fn with_routing_control(mut self, mode: RoutingControl) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Process the result stream with a custom receiver instead of collecting
    /// it into an [`EagerResult`].
    ///
    /// Whatever the receiver leaves in the stream is discarded when it
    /// returns.
    #[inline]
    pub fn with_receiver<R_, FRes_: FnOnce(&mut RecordStream) -> Result<R_>>(
        self,
        receiver: FRes_,
    ) -> AutoCommitBuilder<'driver, 'session, FRes_> {
        AutoCommitBuilder {
            session: self.session,
            query: self.query,
            parameters: self.parameters,
            meta: self.meta,
            timeout: self.timeout,
            mode: self.mode,
            receiver,
        }
    }

    /// Run the query and hand the result to the configured receiver.
    pub fn run(mut self) -> Result<R> {
        let session = self.session.take().expect("builder consumed only once");
        session.auto_commit_run(self)
    }
}

impl<FRes> Debug for AutoCommitBuilder<'_, '_, FRes> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoCommitBuilder")
            .field("session", &self.session.as_ref().map(|_| "..."))
            .field("query", &self.query)
            .field("parameters", &self.parameters)
            .field("meta", &self.meta)
            .field("timeout", &self.timeout)
            .field("mode", &self.mode)
            .field("receiver", &"...")
            .finish()
    }
}

/// Builder for explicit transactions, see [`Session::transaction()`].
pub struct TransactionBuilder<'driver, 'session> {
    session: Option<&'session mut Session<'driver>>,
    meta: HashMap<String, Value>,
    timeout: TransactionTimeout,
    mode: Option<RoutingControl>,
}

impl<'driver, 'session> TransactionBuilder<'driver, 'session> {
    fn new(session: &'session mut Session<'driver>) -> Self {
        Self {
            session: Some(session),
            meta: Default::default(),
            timeout: Default::default(),
            mode: None,
        }
    }

    /// Attach transaction metadata, visible in the server's query log and in
    /// `SHOW TRANSACTIONS`.
    #[inline]
    pub fn with_transaction_meta(mut self, meta: HashMap<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Use no transaction metadata (the *default*).
    #[inline]
    pub fn without_transaction_meta(mut self) -> Self {
        self.meta = Default::default();
        self
    }

    /// Instruct the server to abort the transaction after the given timeout.
    #[inline]
    pub fn with_transaction_timeout(mut self, timeout: TransactionTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether to run the transaction on a reader or a writer of the cluster.
    ///
    /// Defaults to [`SessionConfig::with_default_access_mode()`], which in
    /// turn defaults to [`RoutingControl::Write`].
    ///
    /// Writers are also known as leaders or primaries, readers as followers,
    /// secondaries, or read replicas.
    #[inline]
    pub fn with_routing_control(mut self, mode: RoutingControl) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Run the transaction; the work happens in `receiver`.
    ///
    /// The `receiver` gets a [`Transaction`] to run queries on and to commit
    /// or roll back. Especially against clustered setups, prefer
    /// [`TransactionBuilder::run_with_retry()`]: transient failures (leader
    /// switches, load balancers cutting connections, ...) are to be expected
    /// there.
    pub fn run<R>(mut self, receiver: impl FnOnce(Transaction) -> Result<R>) -> Result<R> {
        let session = self.session.take().expect("builder consumed only once");
        session.transaction_run(&self, receiver)
    }

    /// Run the transaction as a managed transaction function: on failures
    /// deemed retryable by `retry_policy`, the work is rolled back and
    /// `receiver` is invoked again on a freshly acquired connection (possibly
    /// to a different server).
    pub fn run_with_retry<R, P: RetryPolicy>(
        mut self,
        retry_policy: P,
        mut receiver: impl FnMut(Transaction) -> Result<R>,
    ) -> StdResult<R, P::Error> {
        let session = self.session.take().expect("builder consumed only once");
        retry_policy.execute(|| session.transaction_run(&self, &mut receiver))
    }
}

impl Debug for TransactionBuilder<'_, '_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionBuilder")
            .field("session", &self.session.as_ref().map(|_| "..."))
            .field("meta", &self.meta)
            .field("timeout", &self.timeout)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Tracks which bookmarks the session sends with its work and which ones
/// [`Session::last_bookmarks()`] may expose.
///
/// The states keep bookmarks coming from a [`BookmarkManager`] separate from
/// those produced by this session's own commits: only the latter (plus the
/// initially configured ones, until replaced) are ever handed out.
#[derive(Debug)]
enum SessionBookmarks {
    Unmanaged {
        bookmarks: Arc<Bookmarks>,
    },
    ManagedInit {
        bookmarks: Arc<Bookmarks>,
        manager: Arc<dyn BookmarkManager>,
    },
    ManagedGet {
        bookmarks: Arc<Bookmarks>,
        previous_bookmarks: Arc<Bookmarks>,
        manager: Arc<dyn BookmarkManager>,
    },
    ManagedUpdated {
        bookmarks: Arc<Bookmarks>,
        previous_bookmarks: Arc<Bookmarks>,
        manager: Arc<dyn BookmarkManager>,
    },
}

impl SessionBookmarks {
    fn new(bookmarks: Option<Arc<Bookmarks>>, manager: Option<Arc<dyn BookmarkManager>>) -> Self {
        match manager {
            None => Self::Unmanaged {
                bookmarks: bookmarks.unwrap_or_default(),
            },
            Some(manager) => Self::ManagedInit {
                bookmarks: bookmarks.unwrap_or_default(),
                manager,
            },
        }
    }

    fn get_current_bookmarks(&self) -> Arc<Bookmarks> {
        match self {
            Self::Unmanaged { bookmarks }
            | Self::ManagedInit { bookmarks, .. }
            | Self::ManagedGet { bookmarks, .. }
            | Self::ManagedUpdated { bookmarks, .. } => Arc::clone(bookmarks),
        }
    }

    /// The bookmarks to send with the next piece of work: the session's own
    /// augmented with the manager's.
    fn get_bookmarks_for_work(&mut self) -> Result<Arc<Bookmarks>> {
        match self {
            Self::Unmanaged { bookmarks } => Ok(Arc::clone(bookmarks)),
            Self::ManagedInit { bookmarks, manager }
            | Self::ManagedGet {
                bookmarks, manager, ..
            } => {
                let manager_bookmarks = bookmark_managers::get_bookmarks(&**manager)?;
                let previous_bookmarks = Arc::new(&*manager_bookmarks + &**bookmarks);
                *self = Self::ManagedGet {
                    bookmarks: Arc::clone(bookmarks),
                    previous_bookmarks: Arc::clone(&previous_bookmarks),
                    manager: Arc::clone(manager),
                };
                Ok(previous_bookmarks)
            }
            Self::ManagedUpdated {
                manager,
                previous_bookmarks,
                ..
            } => {
                *previous_bookmarks = bookmark_managers::get_bookmarks(&**manager)?;
                Ok(Arc::clone(previous_bookmarks))
            }
        }
    }

    /// A commit succeeded: `bookmark` replaces the session's bookmark set and
    /// the manager (if any) is informed of the previous-then-new pair.
    fn update_bookmarks(&mut self, bookmark: String) -> Result<()> {
        match self {
            Self::Unmanaged { bookmarks } => {
                *bookmarks = Arc::new(Bookmarks::from_raw([bookmark]));
            }
            Self::ManagedInit { .. } => {
                panic!("cannot update bookmarks before the first get")
            }
            Self::ManagedGet {
                bookmarks,
                previous_bookmarks,
                manager,
            } => {
                *bookmarks = Arc::new(Bookmarks::from_raw([bookmark]));
                bookmark_managers::update_bookmarks(
                    &**manager,
                    Arc::clone(previous_bookmarks),
                    Arc::clone(bookmarks),
                )?;
                *self = Self::ManagedUpdated {
                    bookmarks: Arc::clone(bookmarks),
                    previous_bookmarks: Arc::clone(previous_bookmarks),
                    manager: Arc::clone(manager),
                };
            }
            Self::ManagedUpdated {
                bookmarks,
                previous_bookmarks,
                manager,
            } => {
                *bookmarks = Arc::new(Bookmarks::from_raw([bookmark]));
                bookmark_managers::update_bookmarks(
                    &**manager,
                    Arc::clone(previous_bookmarks),
                    Arc::clone(bookmarks),
                )?;
            }
        }
        Ok(())
    }
}

/// The database the session targets: an explicit choice, a home-database
/// guess, or pinned after resolution.
#[derive(Debug, Default)]
struct SessionTargetDb {
    target: Option<UpdateRtDb>,
    pinned: bool,
}

impl SessionTargetDb {
    fn new_init(target: Option<Arc<String>>) -> Self {
        Self {
            target: target.map(|db| UpdateRtDb { db, guess: false }),
            pinned: false,
        }
    }

    fn new_pinned(target: Option<Arc<String>>) -> Self {
        Self {
            target: target.map(|db| UpdateRtDb { db, guess: false }),
            pinned: true,
        }
    }

    fn as_db(&self) -> Option<Arc<String>> {
        if self.pinned || self.target.as_ref().map(|t| !t.guess).unwrap_or_default() {
            self.target.as_ref().map(|t| Arc::clone(&t.db))
        } else {
            None
        }
    }
}
