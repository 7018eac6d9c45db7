use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::result;
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;

use super::io::bolt::message_parameters::{BeginParameters, RunParameters};
use super::io::bolt::ResponseCallbacks;
use super::io::pool::LeasedConnection;
use super::record_stream::{GetSingleRecordError, RecordStream, SharedErrorPropagator};
use super::{EagerResult, Record};
use crate::error::{DriverError, Result};
use crate::summary::Summary;
use crate::value::Value;

/// An explicit transaction.
///
/// Statements are executed with [`Transaction::query()`]; the transaction
/// ends with [`Transaction::commit()`] or [`Transaction::rollback()`]
/// (dropping it rolls back, swallowing errors).
///
/// Once any associated function of the transaction or of a
/// [`TransactionRecordStream`] spawned from it fails, the transaction is
/// closed.
#[derive(Debug)]
pub struct Transaction<'driver, 'tx> {
    inner_tx: &'tx mut InnerTransaction<'driver>,
    drop_result: RefCell<Result<()>>,
}

impl<'driver, 'tx> Transaction<'driver, 'tx> {
    pub(crate) fn new(inner: &'tx mut InnerTransaction<'driver>) -> Self {
        Self {
            inner_tx: inner,
            drop_result: RefCell::new(Ok(())),
        }
    }

    /// Prepare a query to be executed in this transaction.
    pub fn query<Q: AsRef<str>>(&'tx self, query: Q) -> TransactionQueryBuilder<'driver, 'tx, Q> {
        TransactionQueryBuilder::new(self, query)
    }

    fn run<Q: AsRef<str>>(
        &'tx self,
        builder: TransactionQueryBuilder<'driver, 'tx, Q>,
    ) -> Result<TransactionRecordStream<'driver, 'tx>> {
        let query = builder.query.as_ref();
        Ok(TransactionRecordStream(
            self.inner_tx.run(query, &builder.parameters)?,
            self,
        ))
    }

    /// Commit the transaction.
    pub fn commit(self) -> Result<()> {
        self.drop_result.into_inner()?;
        self.inner_tx.commit()
    }

    /// Roll the transaction back.
    ///
    /// This also happens when the transaction is dropped, except that
    /// dropping swallows errors.
    pub fn rollback(self) -> Result<()> {
        match self.drop_result.into_inner() {
            Ok(_) => self.inner_tx.rollback(),
            // the transaction already failed, there is nothing to roll back
            Err(_) => Ok(()),
        }
    }
}

/// A result cursor bound to a [`Transaction`].
///
/// All record streams spawned from a transaction must be dropped before the
/// transaction can end. Prefer [`TransactionRecordStream::consume()`] over
/// dropping: a drop swallows outstanding errors.
#[derive(Debug)]
pub struct TransactionRecordStream<'driver, 'tx>(
    RecordStream<'driver>,
    &'tx Transaction<'driver, 'tx>,
);

impl Drop for TransactionRecordStream<'_, '_> {
    fn drop(&mut self) {
        if let Err(err) = self.0.consume() {
            if self.1.drop_result.borrow().is_ok() {
                let _ = self.1.drop_result.replace(Err(err));
            }
        }
    }
}

impl<'driver> TransactionRecordStream<'driver, '_> {
    /// See [`RecordStream::consume`] (except that this consumes `self`).
    pub fn consume(mut self) -> Result<Option<Summary>> {
        self.0.consume()
    }

    /// See [`RecordStream::keys`].
    pub fn keys(&self) -> Vec<Arc<String>> {
        self.0.keys()
    }

    /// See [`RecordStream::single`].
    pub fn single(&mut self) -> result::Result<Result<Record>, GetSingleRecordError> {
        self.0.single()
    }

    /// See [`RecordStream::peek`].
    pub fn peek(&mut self) -> Option<Result<Record>> {
        self.0.peek()
    }

    /// See [`RecordStream::try_as_eager_result`].
    pub fn try_as_eager_result(&mut self) -> Result<Option<EagerResult>> {
        self.0.try_as_eager_result()
    }
}

impl Iterator for TransactionRecordStream<'_, '_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

#[derive(Debug)]
pub(crate) struct InnerTransaction<'driver> {
    connection: Rc<RefCell<LeasedConnection<'driver>>>,
    bookmark: Arc<AtomicRefCell<Option<String>>>,
    error_propagator: SharedErrorPropagator,
    fetch_size: i64,
    closed: bool,
}

impl<'driver> InnerTransaction<'driver> {
    pub(crate) fn new(
        connection: LeasedConnection<'driver>,
        fetch_size: i64,
        error_propagator: SharedErrorPropagator,
    ) -> Self {
        Self {
            connection: Rc::new(RefCell::new(connection)),
            bookmark: Default::default(),
            error_propagator,
            fetch_size,
            closed: false,
        }
    }

    pub(crate) fn begin(
        &mut self,
        parameters: BeginParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        let mut cx = self.connection.borrow_mut();
        cx.begin(parameters, callbacks)?;
        cx.write_all(None)?;
        cx.read_all(None)?;
        drop(cx);
        self.check_error()
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        self.closed = true;
        self.check_error()?;
        let mut cx = self.connection.borrow_mut();
        let bookmark = Arc::clone(&self.bookmark);
        cx.write_all(None)?;
        cx.read_all(None)?;
        cx.commit(ResponseCallbacks::new().with_on_success(move |mut meta| {
            if let Some(Value::String(bms)) = meta.remove("bookmark") {
                *bookmark.borrow_mut() = Some(bms);
            };
            Ok(())
        }))?;
        cx.write_all(None)?;
        DriverError::wrap_commit(cx.read_all(None))
    }

    pub(crate) fn rollback(&mut self) -> Result<()> {
        self.closed = true;
        if self.error_propagator.borrow().error().is_some() {
            // the transaction already failed, there is nothing to roll back
            return Ok(());
        }
        let mut cx = self.connection.borrow_mut();
        cx.rollback()?;
        cx.write_all(None)?;
        cx.read_all(None)
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        if self.check_error().is_err() || self.connection.borrow_mut().closed() {
            self.closed = true;
        }
        if !self.closed {
            return self.rollback();
        }
        Ok(())
    }

    pub(crate) fn into_bookmark(self) -> Option<String> {
        self.bookmark.borrow_mut().take()
    }

    pub(crate) fn run(
        &self,
        query: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<RecordStream<'driver>> {
        let cx = Rc::clone(&self.connection);
        let mut record_stream = RecordStream::new(
            cx,
            self.fetch_size,
            false,
            Some(Arc::clone(&self.error_propagator)),
        );
        record_stream.run(
            RunParameters::new_transaction_run(query, Some(parameters)),
            None,
        )?;
        Ok(record_stream)
    }

    fn check_error(&self) -> Result<()> {
        match self.error_propagator.borrow().error() {
            None => Ok(()),
            Some(err) => Err(DriverError::Server {
                error: Box::new((**err).clone()),
            }),
        }
    }
}

/// Builder for queries executed in a transaction, see [`Transaction::query()`].
pub struct TransactionQueryBuilder<'driver, 'tx, Q: AsRef<str>> {
    tx: &'tx Transaction<'driver, 'tx>,
    query: Q,
    parameters: HashMap<String, Value>,
}

impl<'driver, 'tx, Q: AsRef<str>> TransactionQueryBuilder<'driver, 'tx, Q> {
    fn new(tx: &'tx Transaction<'driver, 'tx>, query: Q) -> Self {
        Self {
            tx,
            query,
            parameters: Default::default(),
        }
    }

    /// Query parameters.
    ///
    /// Always prefer parameters over string manipulation: they rule out
    /// injection attacks and allow the server to cache the query plan.
    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Use no query parameters (the *default*).
    pub fn without_parameters(mut self) -> Self {
        self.parameters = Default::default();
        self
    }

    /// Run the query as configured.
    pub fn run(self) -> Result<TransactionRecordStream<'driver, 'tx>> {
        self.tx.run(self)
    }
}

impl<Q: AsRef<str>> Debug for TransactionQueryBuilder<'_, '_, Q> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionQueryBuilder")
            .field("tx", &self.tx)
            .field("query", &self.query.as_ref())
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// When the server should give up on a transaction.
///
///  * [`TransactionTimeout::none`]: never
///  * [`TransactionTimeout::from_millis`]: after the given duration
///  * [`TransactionTimeout::default`]: per the server's configuration
#[derive(Debug, Clone, Copy)]
pub struct TransactionTimeout {
    timeout: InternalTransactionTimeout,
}

impl TransactionTimeout {
    /// A timeout in milliseconds, overriding the server-side default.
    ///
    /// Returns [`None`] for timeouts `<= 0` as the server does not consider
    /// them valid.
    ///
    /// ```
    /// use boltdrive::transaction::TransactionTimeout;
    ///
    /// assert!(TransactionTimeout::from_millis(-1).is_none());
    /// assert!(TransactionTimeout::from_millis(0).is_none());
    /// assert!(TransactionTimeout::from_millis(1).is_some());
    /// ```
    #[inline]
    pub fn from_millis(timeout: i64) -> Option<Self> {
        if timeout <= 0 {
            return None;
        }
        Some(Self {
            timeout: InternalTransactionTimeout::Custom(timeout),
        })
    }

    /// Instruct the server to never time the transaction out.
    #[inline]
    pub fn none() -> Self {
        Self {
            timeout: InternalTransactionTimeout::None,
        }
    }

    #[inline]
    pub(crate) fn raw(&self) -> Option<i64> {
        self.timeout.raw()
    }
}

impl Default for TransactionTimeout {
    /// Use the timeout configured on the server.
    #[inline]
    fn default() -> Self {
        Self {
            timeout: InternalTransactionTimeout::Default,
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
enum InternalTransactionTimeout {
    None,
    #[default]
    Default,
    Custom(i64),
}

impl InternalTransactionTimeout {
    #[inline]
    fn raw(&self) -> Option<i64> {
        match self {
            Self::None => Some(0),
            Self::Default => None,
            Self::Custom(timeout) => Some(*timeout),
        }
    }
}
