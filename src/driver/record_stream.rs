use std::cell::RefCell;
use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::mem;
use std::rc::Rc;
use std::result;
use std::sync::{Arc, Weak};

use atomic_refcell::AtomicRefCell;
use duplicate::duplicate_item;
use thiserror::Error;

use super::io::bolt::message_parameters::{DiscardParameters, PullParameters, RunParameters};
use super::io::bolt::{BoltMeta, BoltRecordFields, ResponseCallbacks};
use super::io::pool::LeasedConnection;
use super::summary::Summary;
use super::Record;
use crate::error::{DriverError, Result, ServerError};
use crate::value::Value;

/// A lazy stream of [`Record`]s.
///
/// Iterating the stream drives `PULL` batches of the configured fetch size
/// over the connection on demand; [`RecordStream::consume()`] discards
/// whatever has not been fetched and yields the [`Summary`].
#[derive(Debug)]
pub struct RecordStream<'driver> {
    connection: Rc<RefCell<LeasedConnection<'driver>>>,
    fetch_size: i64,
    auto_commit: bool,
    listener: Arc<AtomicRefCell<RecordListener>>,
}

impl<'driver> RecordStream<'driver> {
    pub(crate) fn new(
        connection: Rc<RefCell<LeasedConnection<'driver>>>,
        fetch_size: i64,
        auto_commit: bool,
        error_propagator: Option<SharedErrorPropagator>,
    ) -> Self {
        let listener = Arc::new(AtomicRefCell::new(RecordListener::new(
            &connection.borrow(),
            error_propagator.clone(),
        )));
        if let Some(error_propagator) = error_propagator {
            error_propagator
                .borrow_mut()
                .add_listener(Arc::downgrade(&listener));
        }
        Self {
            connection,
            fetch_size,
            auto_commit,
            listener,
        }
    }

    /// Send RUN (and the first PULL), flush, and read up to the first batch.
    pub(crate) fn run(
        &mut self,
        parameters: RunParameters,
        mut run_meta_hook: Option<Box<dyn FnMut(&mut BoltMeta) + Send + Sync>>,
    ) -> Result<()> {
        if let RecordListenerState::ForeignError(e) = &self.listener.borrow().state {
            return Err(DriverError::Server {
                error: Box::new(e.clone_with_reason(FOREIGN_ERROR_REASON)),
            });
        }

        let mut callbacks = self.failure_callbacks();
        let listener = Arc::downgrade(&self.listener);
        callbacks = callbacks.with_on_success(move |mut meta| {
            if let Some(hook) = run_meta_hook.as_mut() {
                hook(&mut meta);
            }
            if let Some(listener) = listener.upgrade() {
                return listener.borrow_mut().run_success_cb(meta);
            }
            Ok(())
        });

        let mut res = self.connection.borrow_mut().run(parameters, callbacks);
        if self.auto_commit {
            res = res.and_then(|_| self.connection.borrow_mut().write_all(None));
            res = match res.and_then(|_| self.pull(true)) {
                Err(e) => {
                    self.listener.borrow_mut().state = RecordListenerState::Done;
                    return Err(e);
                }
                Ok(res) => Ok(res),
            }
        } else {
            res = res.and_then(|_| self.pull(true));
        }

        if let Err(e) = res.and_then(|_| {
            // read until only the response to PULL is left
            let mut connection = self.connection.borrow_mut();
            let mut res = Ok(());
            while res.is_ok() && connection.expected_reply_len() > 1 {
                res = connection.read_one(None);
            }
            res
        }) {
            self.listener.borrow_mut().state = RecordListenerState::Done;
            return Err(self.failed_commit(e));
        };

        {
            let state = &mut self.listener.borrow_mut().state;
            match state {
                RecordListenerState::Error(_) => {
                    let state = mem::replace(state, RecordListenerState::Done);
                    let RecordListenerState::Error(e) = state else {
                        unreachable!("checked state to be error above");
                    };
                    return Err(self.failed_commit(e));
                }
                RecordListenerState::ForeignError(_) => {
                    let state = mem::replace(state, RecordListenerState::Done);
                    let RecordListenerState::ForeignError(e) = state else {
                        unreachable!("checked state to be foreign error above");
                    };
                    return Err(DriverError::Server {
                        error: Box::new(e.clone_with_reason(FOREIGN_ERROR_REASON)),
                    });
                }
                RecordListenerState::Ignored => {
                    *state = RecordListenerState::Done;
                    return Err(DriverError::protocol_error("record stream was ignored"));
                }
                _ => {}
            }
        }

        let mut connection = self.connection.borrow_mut();
        if let Err(err) = connection.read_all(None) {
            let err = self.failed_commit(err);
            self.listener.borrow_mut().state = RecordListenerState::Error(err);
        } else {
            assert!(!connection.has_buffered_message());
            assert!(!connection.expects_reply());
        }

        Ok(())
    }

    /// Fully consume the stream and return the [`Summary`].
    ///
    /// Returns [`None`] if the stream has been consumed before or an earlier
    /// failure voided the summary.
    pub fn consume(&mut self) -> Result<Option<Summary>> {
        self.exhaust()?;
        Ok(self.listener.borrow_mut().summary.take())
    }

    /// The keys of the result's records.
    pub fn keys(&self) -> Vec<Arc<String>> {
        self.listener
            .borrow()
            .keys
            .as_ref()
            .expect(
                "keys are present after RUN's SUCCESS; \
                 a stream is never handed out before that",
            )
            .to_vec()
    }

    /// Exhaust the stream, expecting exactly one record.
    ///
    /// Stream errors take precedence and are returned as `Ok(Err(_))`; a
    /// record count other than one is reported as `Err(GetSingleRecordError)`.
    pub fn single(&mut self) -> result::Result<Result<Record>, GetSingleRecordError> {
        match self.next() {
            Some(Ok(record)) => match self.next() {
                None => Ok(Ok(record)),
                Some(Err(e)) => Ok(Err(e)),
                Some(Ok(_)) => match self.exhaust() {
                    Ok(()) => Err(GetSingleRecordError::TooManyRecords),
                    Err(e) => Ok(Err(e)),
                },
            },
            Some(Err(e)) => Ok(Err(e)),
            None => Err(GetSingleRecordError::NoRecords),
        }
    }

    /// Peek at the next record without removing it from the stream.
    pub fn peek(&mut self) -> Option<Result<Record>> {
        loop {
            {
                let listener = self.listener.borrow();
                if !listener.buffer.is_empty() {
                    break;
                }
                if listener.state.is_done() || listener.state.is_success() {
                    break;
                }
            }
            // buffer one more record (or reach the end of the stream)
            match self.next() {
                None => break,
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(record)) => {
                    self.listener.borrow_mut().buffer.push_front(record);
                    break;
                }
            }
        }
        let listener = self.listener.borrow();
        listener.buffer.front().map(|record| {
            Ok(Record::new(
                &record.keys().collect::<Vec<_>>(),
                record.values().cloned().collect(),
            ))
        })
    }

    /// Collect the remaining stream into an [`EagerResult`].
    ///
    /// Returns [`None`] if the stream has already been consumed.
    pub fn try_as_eager_result(&mut self) -> Result<Option<super::EagerResult>> {
        let keys = self.keys();
        let records = self.collect::<Result<_>>()?;
        let summary = self.consume()?;
        let Some(summary) = summary else {
            return Ok(None);
        };
        Ok(Some(super::EagerResult {
            keys,
            records,
            summary,
        }))
    }

    pub(crate) fn into_bookmark(self) -> Option<String> {
        Arc::try_unwrap(self.listener)
            .expect("stream exclusively owns its listener after use")
            .into_inner()
            .bookmark
    }

    fn exhaust(&mut self) -> Result<()> {
        if self.listener.borrow().state.is_streaming() {
            let mut listener = self.listener.borrow_mut();
            listener.buffer.clear();
            listener.state = RecordListenerState::Discarding;
        }
        let res = self.try_for_each(|e| e.map(drop));
        self.wrap_commit(res)?;
        Ok(())
    }

    fn pull(&mut self, flush: bool) -> Result<()> {
        let callbacks = self.pull_callbacks();
        self.connection
            .borrow_mut()
            .pull(PullParameters::new(self.fetch_size, self.qid()), callbacks)?;
        if flush {
            self.connection.borrow_mut().write_all(None)?;
        }
        Ok(())
    }

    fn discard(&mut self, flush: bool) -> Result<()> {
        let callbacks = self.discard_callbacks();
        self.connection
            .borrow_mut()
            .discard(DiscardParameters::new(-1, self.qid()), callbacks)?;
        if flush {
            self.connection.borrow_mut().write_all(None)?;
        }
        Ok(())
    }

    fn pull_callbacks(&self) -> ResponseCallbacks {
        let callbacks = self.discard_callbacks();
        let listener = Arc::downgrade(&self.listener);
        callbacks.with_on_record(move |data| {
            if let Some(listener) = listener.upgrade() {
                return listener.borrow_mut().record_cb(data);
            }
            Ok(())
        })
    }

    fn discard_callbacks(&self) -> ResponseCallbacks {
        let callbacks = self.failure_callbacks();
        let listener = Arc::downgrade(&self.listener);
        callbacks.with_on_success(move |meta| {
            if let Some(listener) = listener.upgrade() {
                return listener.borrow_mut().stream_end_cb(meta);
            }
            Ok(())
        })
    }

    fn failure_callbacks(&self) -> ResponseCallbacks {
        let mut callbacks = ResponseCallbacks::new();
        let listener = Arc::downgrade(&self.listener);
        callbacks = callbacks.with_on_failure(move |error| {
            if let Some(listener) = listener.upgrade() {
                return listener
                    .borrow_mut()
                    .failure_cb(Arc::downgrade(&listener), error);
            }
            Ok(())
        });
        let listener = Arc::downgrade(&self.listener);
        callbacks.with_on_ignored(move || {
            if let Some(listener) = listener.upgrade() {
                return listener.borrow_mut().ignored_cb();
            }
            Ok(())
        })
    }

    fn qid(&self) -> i64 {
        self.listener.borrow().qid.unwrap_or(-1)
    }

    fn failed_commit(&self, err: DriverError) -> DriverError {
        match self.auto_commit {
            true => err.failed_commit(),
            false => err,
        }
    }

    fn wrap_commit<T>(&self, res: Result<T>) -> Result<T> {
        match self.auto_commit {
            true => DriverError::wrap_commit(res),
            false => res,
        }
    }
}

impl Iterator for RecordStream<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        fn needs_pull(listener: &Arc<AtomicRefCell<RecordListener>>) -> bool {
            let listener = listener.borrow();
            listener.buffer.is_empty() && listener.state.is_streaming()
        }

        fn needs_discard(listener: &Arc<AtomicRefCell<RecordListener>>) -> bool {
            let listener = listener.borrow();
            listener.buffer.is_empty() && listener.state.is_discarding()
        }

        if self.listener.borrow().state.is_done() {
            return None;
        }

        loop {
            if matches!(
                self.listener.borrow().state,
                RecordListenerState::Streaming | RecordListenerState::Discarding
            ) && self.connection.borrow().expects_reply()
            {
                if let Err(err) = self.connection.borrow_mut().read_one(None) {
                    self.listener
                        .borrow_mut()
                        .set_error(self.failed_commit(err));
                }
            }
            if let Some(record) = self.listener.borrow_mut().buffer.pop_front() {
                return Some(Ok(record));
            }
            if needs_pull(&self.listener) {
                if let Err(err) = self.pull(true) {
                    self.listener
                        .borrow_mut()
                        .set_error(self.failed_commit(err));
                } else {
                    continue;
                }
            } else if needs_discard(&self.listener) {
                if let Err(err) = self.discard(true) {
                    self.listener
                        .borrow_mut()
                        .set_error(self.failed_commit(err));
                } else {
                    continue;
                }
            }
            let mut listener = self.listener.borrow_mut();
            match listener.state {
                RecordListenerState::Error(_) => {
                    let state = mem::replace(&mut listener.state, RecordListenerState::Done);
                    let RecordListenerState::Error(e) = state else {
                        unreachable!("checked state to be error above");
                    };
                    return Some(Err(e));
                }
                RecordListenerState::ForeignError(_) => {
                    let state = mem::replace(&mut listener.state, RecordListenerState::Done);
                    let RecordListenerState::ForeignError(e) = state else {
                        unreachable!("checked state to be foreign error above");
                    };
                    return Some(Err(DriverError::Server {
                        error: Box::new(e.clone_with_reason(FOREIGN_ERROR_REASON)),
                    }));
                }
                RecordListenerState::Ignored => {
                    listener.state = RecordListenerState::Done;
                    return Some(Err(DriverError::protocol_error(
                        "record stream was ignored",
                    )));
                }
                RecordListenerState::Success => {
                    listener.state = RecordListenerState::Done;
                    return None;
                }
                RecordListenerState::Done => return None,
                _ => {}
            }
        }
    }
}

impl FusedIterator for RecordStream<'_> {}

const FOREIGN_ERROR_REASON: &str =
    "failure in another query of this transaction caused the transaction to be closed";

#[derive(Debug)]
enum RecordListenerState {
    Streaming,
    Discarding,
    Error(DriverError),
    /// another result stream of the same transaction has failed
    ForeignError(Arc<ServerError>),
    Ignored,
    Success,
    Done,
}

impl RecordListenerState {
    #[allow(dead_code)] // cover all states
    #[duplicate_item(
        fn_name               variant;
        [ is_streaming ]      [ Streaming ];
        [ is_discarding ]     [ Discarding ];
        [ is_error ]          [ Error(_) ];
        [ is_foreign_error ]  [ ForeignError(_) ];
        [ is_ignored ]        [ Ignored ];
        [ is_success ]        [ Success ];
        [ is_done ]           [ Done ];
    )]
    fn fn_name(&self) -> bool {
        matches!(self, RecordListenerState::variant)
    }
}

#[derive(Debug)]
struct RecordListener {
    buffer: VecDeque<Record>,
    keys: Option<Vec<Arc<String>>>,
    qid: Option<i64>,
    state: RecordListenerState,
    summary: Option<Summary>,
    bookmark: Option<String>,
    error_propagator: Option<SharedErrorPropagator>,
}

impl RecordListener {
    fn new(connection: &LeasedConnection, error_propagator: Option<SharedErrorPropagator>) -> Self {
        let summary = Summary::new(
            connection.address(),
            connection.server_agent(),
            connection.protocol_version(),
        );
        Self {
            buffer: VecDeque::new(),
            keys: None,
            qid: None,
            state: RecordListenerState::Streaming,
            summary: Some(summary),
            bookmark: None,
            error_propagator,
        }
    }

    fn run_success_cb(&mut self, mut meta: BoltMeta) -> Result<()> {
        if self.keys.is_some() {
            return Ok(());
        }
        if let Some(qid) = meta.remove("qid") {
            let Value::Integer(qid) = qid else {
                return Err(DriverError::protocol_error(
                    "SUCCESS after RUN 'qid' was not an integer",
                ));
            };
            self.qid = Some(qid);
        }
        let Some(Value::List(fields)) = meta.remove("fields") else {
            return Err(DriverError::protocol_error(
                "SUCCESS after RUN did not contain a list of 'fields'",
            ));
        };
        let fields = fields
            .into_iter()
            .map(|field| match field {
                Value::String(field) => Ok(Arc::new(field)),
                _ => Err(DriverError::protocol_error(
                    "SUCCESS after RUN 'fields' contained a non-string",
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        self.keys = Some(fields);
        if let Some(summary) = self.summary.as_mut() {
            summary.load_run_meta(&mut meta)?;
        }
        Ok(())
    }

    fn failure_cb(&mut self, me: Weak<AtomicRefCell<Self>>, error: ServerError) -> Result<()> {
        if let Some(error_propagator) = &self.error_propagator {
            error_propagator
                .borrow_mut()
                .propagate_error(Some(me), &error);
        }
        self.state = RecordListenerState::Error(error.into());
        self.summary = None;
        Ok(())
    }

    fn ignored_cb(&mut self) -> Result<()> {
        if !self.state.is_foreign_error() {
            self.state = RecordListenerState::Ignored;
        }
        self.summary = None;
        Ok(())
    }

    fn record_cb(&mut self, fields: BoltRecordFields) -> Result<()> {
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| DriverError::protocol_error("RECORD received before RUN SUCCESS"))?;
        if keys.len() != fields.len() {
            return Err(DriverError::protocol_error(format!(
                "RECORD contained {} entries but {} keys were announced",
                fields.len(),
                keys.len()
            )));
        }
        self.buffer.push_back(Record::new(keys, fields));
        Ok(())
    }

    /// SUCCESS of PULL/DISCARD: either `has_more` or the stream has ended and
    /// carries the bookmark and summary metadata.
    fn stream_end_cb(&mut self, mut meta: BoltMeta) -> Result<()> {
        let Some(Value::Boolean(true)) = meta.remove("has_more") else {
            self.state = RecordListenerState::Success;
            if let Some(Value::String(bookmark)) = meta.remove("bookmark") {
                self.bookmark = Some(bookmark);
            };
            if let Some(summary) = self.summary.as_mut() {
                summary.load_pull_meta(&mut meta)?;
            }
            return Ok(());
        };
        Ok(())
    }

    fn set_error(&mut self, error: DriverError) {
        self.state = RecordListenerState::Error(error);
        self.summary = None;
    }

    fn set_foreign_error(&mut self, error: Arc<ServerError>) {
        self.state = RecordListenerState::ForeignError(error);
        self.summary = None;
    }
}

/// Distributes a FAILURE observed on one result stream of a transaction to
/// all sibling streams and the transaction itself.
#[derive(Debug, Default)]
pub(crate) struct ErrorPropagator {
    listeners: Vec<Weak<AtomicRefCell<RecordListener>>>,
    error: Option<Arc<ServerError>>,
}

pub(crate) type SharedErrorPropagator = Arc<AtomicRefCell<ErrorPropagator>>;

impl ErrorPropagator {
    fn add_listener(&mut self, listener: Weak<AtomicRefCell<RecordListener>>) {
        if let Some(error) = &self.error {
            if let Some(listener) = listener.upgrade() {
                listener.borrow_mut().set_foreign_error(Arc::clone(error));
            } else {
                // no need to track a dead listener
                return;
            }
        }
        self.listeners.push(listener);
    }

    fn propagate_error(
        &mut self,
        source: Option<Weak<AtomicRefCell<RecordListener>>>,
        error: &ServerError,
    ) {
        let error = Arc::new(error.clone());
        for listener in &self.listeners {
            if let Some(source) = source.as_ref() {
                if source.ptr_eq(listener) {
                    continue;
                }
            }
            if let Some(listener) = listener.upgrade() {
                listener.borrow_mut().set_foreign_error(Arc::clone(&error));
            }
        }
        self.error = Some(error);
    }

    pub(crate) fn error(&self) -> &Option<Arc<ServerError>> {
        &self.error
    }

    /// An `on_failure` callback feeding this propagator; the error is
    /// swallowed here and surfaced via the registered listeners (or
    /// `InnerTransaction::check_error`).
    pub(crate) fn make_on_error_cb(
        this: SharedErrorPropagator,
    ) -> impl FnMut(ServerError) -> Result<()> + Send + Sync + 'static {
        move |err| {
            this.borrow_mut().propagate_error(None, &err);
            Ok(())
        }
    }
}

/// Misuse of [`RecordStream::single()`]: the stream did not hold exactly one
/// record.
#[derive(Debug, Error)]
pub enum GetSingleRecordError {
    #[error("no records were found")]
    NoRecords,
    #[error("more than one record was found")]
    TooManyRecords,
}

impl From<GetSingleRecordError> for DriverError {
    fn from(err: GetSingleRecordError) -> Self {
        Self::InvalidConfig {
            message: format!("GetSingleRecordError: {err}"),
        }
    }
}
