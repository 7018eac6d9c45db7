use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

use crate::error::{DriverError, Result, ServerError};
use crate::value::Value;

/// Client messages the server answers, in FIFO order.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub(crate) enum ResponseMessage {
    Hello,
    Reset,
    Run,
    Discard,
    Pull,
    Begin,
    Commit,
    Rollback,
    Route,
}

/// An expected server reply paired with the callbacks to invoke for it.
#[derive(Debug)]
pub(crate) struct BoltResponse {
    pub(crate) message: ResponseMessage,
    pub(crate) callbacks: ResponseCallbacks,
}

impl BoltResponse {
    pub(crate) fn new(message: ResponseMessage, callbacks: ResponseCallbacks) -> Self {
        Self { message, callbacks }
    }

    pub(crate) fn from_message(message: ResponseMessage) -> Self {
        Self::new(message, ResponseCallbacks::new())
    }
}

type OptBox<T> = Option<Box<T>>;
pub(crate) type BoltMeta = HashMap<String, Value>;
pub(crate) type BoltRecordFields = Vec<Value>;

/// Callbacks for the possible replies to one request.
///
/// Without an `on_failure` callback, a FAILURE reply surfaces as
/// `DriverError::Server`. IGNORED is silently accepted unless a callback is
/// installed; the request that put the connection into the failed state has
/// already surfaced the error.
pub(crate) struct ResponseCallbacks {
    on_success_cb: OptBox<dyn FnMut(BoltMeta) -> Result<()> + Send + Sync>,
    on_failure_cb: OptBox<dyn FnMut(ServerError) -> Result<()> + Send + Sync>,
    on_ignored_cb: OptBox<dyn FnMut() -> Result<()> + Send + Sync>,
    on_record_cb: OptBox<dyn FnMut(BoltRecordFields) -> Result<()> + Send + Sync>,
}

impl ResponseCallbacks {
    pub(crate) fn new() -> Self {
        Self {
            on_success_cb: None,
            on_failure_cb: None,
            on_ignored_cb: None,
            on_record_cb: None,
        }
    }

    pub(crate) fn with_on_success<F: FnMut(BoltMeta) -> Result<()> + Send + Sync + 'static>(
        mut self,
        cb: F,
    ) -> Self {
        self.on_success_cb = Some(Box::new(cb));
        self
    }

    /// Run `pre_hook` over the SUCCESS metadata before the main callback.
    pub(crate) fn with_on_success_pre_hook<
        F: FnMut(&BoltMeta) -> Result<()> + Send + Sync + 'static,
    >(
        mut self,
        mut pre_hook: F,
    ) -> Self {
        self.on_success_cb = match self.on_success_cb {
            None => Some(Box::new(move |meta| pre_hook(&meta))),
            Some(mut cb) => Some(Box::new(move |meta| {
                pre_hook(&meta)?;
                cb(meta)
            })),
        };
        self
    }

    pub(crate) fn with_on_failure<F: FnMut(ServerError) -> Result<()> + Send + Sync + 'static>(
        mut self,
        cb: F,
    ) -> Self {
        self.on_failure_cb = Some(Box::new(cb));
        self
    }

    pub(crate) fn with_on_ignored<F: FnMut() -> Result<()> + Send + Sync + 'static>(
        mut self,
        cb: F,
    ) -> Self {
        self.on_ignored_cb = Some(Box::new(cb));
        self
    }

    pub(crate) fn with_on_record<
        F: FnMut(BoltRecordFields) -> Result<()> + Send + Sync + 'static,
    >(
        mut self,
        cb: F,
    ) -> Self {
        self.on_record_cb = Some(Box::new(cb));
        self
    }

    pub(crate) fn on_success(&mut self, meta: Value) -> Result<()> {
        match meta {
            Value::Map(meta) => match self.on_success_cb.as_mut() {
                None => Ok(()),
                Some(cb) => cb(meta),
            },
            _ => Err(DriverError::protocol_error(
                "SUCCESS metadata was not a map",
            )),
        }
    }

    pub(crate) fn on_failure(&mut self, error: ServerError) -> Result<()> {
        match self.on_failure_cb.as_mut() {
            None => Err(error.into()),
            Some(cb) => cb(error),
        }
    }

    pub(crate) fn on_ignored(&mut self) -> Result<()> {
        self.on_ignored_cb.as_mut().map(|cb| cb()).unwrap_or(Ok(()))
    }

    pub(crate) fn on_record(&mut self, data: Value) -> Result<()> {
        match data {
            Value::List(values) => match self.on_record_cb.as_mut() {
                None => Ok(()),
                Some(cb) => cb(values),
            },
            _ => Err(DriverError::protocol_error("RECORD data was not a list")),
        }
    }
}

impl Debug for ResponseCallbacks {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCallbacks")
            .field("on_success", &self.on_success_cb.as_ref().map(|_| "..."))
            .field("on_failure", &self.on_failure_cb.as_ref().map(|_| "..."))
            .field("on_ignored", &self.on_ignored_cb.as_ref().map(|_| "..."))
            .field("on_record", &self.on_record_cb.as_ref().map(|_| "..."))
            .finish()
    }
}
