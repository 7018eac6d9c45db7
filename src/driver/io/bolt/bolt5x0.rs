use std::collections::HashMap;
use std::io::{Read, Write};
use std::mem;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use super::message_parameters::{
    BeginParameters, DiscardParameters, HelloParameters, PullParameters, RouteParameters,
    RunParameters,
};
use super::{
    BoltMeta, BoltProtocol, BoltResponse, ConnectionData, ConnectionState, ResponseCallbacks,
    ResponseMessage,
};
use crate::bookmarks::Bookmarks;
use crate::error::{DriverError, Result};
use crate::value::Value;

const SERVER_AGENT_KEY: &str = "server";
const HINTS_KEY: &str = "hints";
const RECV_TIMEOUT_KEY: &str = "connection.recv_timeout_seconds";

pub(super) const TAG_HELLO: u8 = 0x01;
pub(super) const TAG_GOODBYE: u8 = 0x02;
pub(super) const TAG_RESET: u8 = 0x0F;
pub(super) const TAG_RUN: u8 = 0x10;
pub(super) const TAG_BEGIN: u8 = 0x11;
pub(super) const TAG_COMMIT: u8 = 0x12;
pub(super) const TAG_ROLLBACK: u8 = 0x13;
pub(super) const TAG_DISCARD: u8 = 0x2F;
pub(super) const TAG_PULL: u8 = 0x3F;
pub(super) const TAG_ROUTE: u8 = 0x66;

#[derive(Debug, Default)]
pub(super) struct Bolt5x0 {}

impl Bolt5x0 {
    pub(super) fn bookmarks_value(bookmarks: &Bookmarks) -> Value {
        Value::List(bookmarks.raw().map(Value::from).collect())
    }

    /// `extra` entries shared by RUN (auto-commit) and BEGIN.
    pub(super) fn tx_extra(parameters: &BeginParameters) -> HashMap<String, Value> {
        let BeginParameters {
            bookmarks,
            tx_timeout,
            tx_metadata,
            mode,
            db,
            imp_user,
        } = *parameters;
        let mut extra = HashMap::new();
        if let Some(bookmarks) = bookmarks {
            if !bookmarks.is_empty() {
                extra.insert("bookmarks".into(), Self::bookmarks_value(bookmarks));
            }
        }
        if let Some(tx_timeout) = tx_timeout {
            extra.insert("tx_timeout".into(), Value::Integer(tx_timeout));
        }
        if let Some(tx_metadata) = tx_metadata {
            if !tx_metadata.is_empty() {
                extra.insert("tx_metadata".into(), Value::Map(tx_metadata.clone()));
            }
        }
        if let Some(mode) = mode {
            // write mode is the protocol default and omitted
            if mode != "w" {
                extra.insert("mode".into(), Value::from(mode));
            }
        }
        if let Some(db) = db {
            extra.insert("db".into(), Value::from(db));
        }
        if let Some(imp_user) = imp_user {
            extra.insert("imp_user".into(), Value::from(imp_user));
        }
        extra
    }

    pub(super) fn pull_discard_extra<RW: Read + Write>(
        data: &ConnectionData<RW>,
        n: i64,
        qid: i64,
    ) -> HashMap<String, Value> {
        let mut extra = HashMap::with_capacity(2);
        extra.insert("n".into(), Value::Integer(n));
        if !data.can_omit_qid(qid) {
            extra.insert("qid".into(), Value::Integer(qid));
        }
        extra
    }

    pub(super) fn hello_extra(parameters: &HelloParameters) -> HashMap<String, Value> {
        let HelloParameters {
            user_agent,
            auth,
            routing_context,
        } = *parameters;
        let mut extra = HashMap::with_capacity(2 + auth.data().len());
        extra.insert("user_agent".into(), Value::from(user_agent));
        if let Some(routing_context) = routing_context {
            extra.insert("routing".into(), Value::Map(routing_context.clone()));
        }
        for (key, value) in auth.data() {
            extra.insert(key.clone(), value.clone());
        }
        extra
    }

    pub(super) fn log_hello<RW: Read + Write>(
        data: &ConnectionData<RW>,
        parameters: &HelloParameters,
    ) {
        // credentials are never logged
        debug!(
            "{}C: HELLO {{user_agent: {:?}, scheme: {:?}{}}}",
            data.log_prefix(),
            parameters.user_agent,
            parameters
                .auth
                .data()
                .get("scheme")
                .and_then(Value::as_string)
                .map(String::as_str)
                .unwrap_or("none"),
            match parameters.routing_context {
                Some(context) => format!(", routing: {context:?}"),
                None => String::new(),
            },
        );
    }

    /// Register the reply handler for HELLO: captures the server agent and
    /// connection metadata, and (protocol >= 4) applies the server's receive
    /// timeout hint to the socket.
    pub(super) fn enqueue_hello_response<RW: Read + Write>(
        data: &mut ConnectionData<RW>,
        apply_hints: bool,
    ) {
        let meta_store = Arc::clone(&data.meta);
        let server_agent = Arc::clone(&data.server_agent);
        let socket = Arc::clone(&data.socket);

        data.responses.push_back(BoltResponse::new(
            ResponseMessage::Hello,
            ResponseCallbacks::new().with_on_success(move |mut meta| {
                if let Some((key, value)) = meta.remove_entry(SERVER_AGENT_KEY) {
                    match value {
                        Value::String(value) => {
                            *server_agent.borrow_mut() = Arc::new(value);
                        }
                        _ => {
                            warn!("server sent unexpected server_agent type {:?}", &value);
                            meta.insert(key, value);
                        }
                    }
                }
                if apply_hints {
                    Self::apply_connection_hints(&meta, (*socket).as_ref());
                }
                mem::swap(&mut *meta_store.borrow_mut(), &mut meta);
                Ok(())
            }),
        ));
    }

    fn apply_connection_hints(meta: &BoltMeta, socket: Option<&TcpStream>) {
        let Some(hints) = meta.get(HINTS_KEY) else {
            return;
        };
        let Value::Map(hints) = hints else {
            warn!("server sent unexpected {HINTS_KEY} type {hints:?}");
            return;
        };
        let Some(timeout) = hints.get(RECV_TIMEOUT_KEY) else {
            return;
        };
        match timeout {
            Value::Integer(timeout) if *timeout > 0 => {
                if let Some(socket) = socket {
                    let timeout = Duration::from_secs(*timeout as u64);
                    if let Err(err) = socket.set_read_timeout(Some(timeout)) {
                        warn!("failed to apply {RECV_TIMEOUT_KEY} hint: {err}");
                    }
                }
            }
            _ => {
                warn!("server sent unexpected {RECV_TIMEOUT_KEY} value {timeout:?}");
            }
        }
    }

    /// Install a hook that records the statement id announced in RUN's
    /// SUCCESS, allowing subsequent PULL/DISCARD to omit a redundant qid.
    pub(super) fn track_last_qid<RW: Read + Write>(
        data: &ConnectionData<RW>,
        callbacks: ResponseCallbacks,
    ) -> ResponseCallbacks {
        let last_qid = Arc::clone(&data.last_qid);
        callbacks.with_on_success_pre_hook(move |meta| match meta.get("qid") {
            Some(Value::Integer(qid)) => {
                *last_qid.borrow_mut() = Some(*qid);
                Ok(())
            }
            None => {
                *last_qid.borrow_mut() = None;
                Ok(())
            }
            Some(v) => Err(DriverError::protocol_error(format!(
                "server sent non-integer qid: {v:?}"
            ))),
        })
    }
}

impl BoltProtocol for Bolt5x0 {
    fn hello<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: HelloParameters,
    ) -> Result<()> {
        Self::log_hello(data, &parameters);
        let extra = Self::hello_extra(&parameters);
        data.enqueue_request(TAG_HELLO, &[Value::Map(extra)], None)?;
        Self::enqueue_hello_response(data, true);
        Ok(())
    }

    fn goodbye<RW: Read + Write>(&mut self, data: &mut ConnectionData<RW>) -> Result<()> {
        data.enqueue_request(TAG_GOODBYE, &[], None)?;
        data.connection_state = ConnectionState::Closed;
        debug!("{}C: GOODBYE", data.log_prefix());
        Ok(())
    }

    fn reset<RW: Read + Write>(&mut self, data: &mut ConnectionData<RW>) -> Result<()> {
        data.enqueue_request(
            TAG_RESET,
            &[],
            Some(BoltResponse::from_message(ResponseMessage::Reset)),
        )?;
        debug!("{}C: RESET", data.log_prefix());
        Ok(())
    }

    fn run<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: RunParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        let RunParameters {
            query,
            parameters: params,
            bookmarks,
            tx_timeout,
            tx_metadata,
            mode,
            db,
            imp_user,
        } = parameters;
        let extra = Self::tx_extra(&BeginParameters::new(
            bookmarks,
            tx_timeout,
            tx_metadata,
            mode,
            db,
            imp_user,
        ));
        let params = params.cloned().unwrap_or_default();
        debug!(
            "{}C: RUN {query:?} {params:?} {extra:?}",
            data.log_prefix()
        );
        let callbacks = Self::track_last_qid(data, callbacks);
        data.enqueue_request(
            TAG_RUN,
            &[
                Value::from(query),
                Value::Map(params),
                Value::Map(extra),
            ],
            Some(BoltResponse::new(ResponseMessage::Run, callbacks)),
        )
    }

    fn discard<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: DiscardParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        let extra = Self::pull_discard_extra(data, parameters.n, parameters.qid);
        debug!("{}C: DISCARD {extra:?}", data.log_prefix());
        data.enqueue_request(
            TAG_DISCARD,
            &[Value::Map(extra)],
            Some(BoltResponse::new(ResponseMessage::Discard, callbacks)),
        )
    }

    fn pull<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: PullParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        let extra = Self::pull_discard_extra(data, parameters.n, parameters.qid);
        debug!("{}C: PULL {extra:?}", data.log_prefix());
        data.enqueue_request(
            TAG_PULL,
            &[Value::Map(extra)],
            Some(BoltResponse::new(ResponseMessage::Pull, callbacks)),
        )
    }

    fn begin<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: BeginParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        let extra = Self::tx_extra(&parameters);
        debug!("{}C: BEGIN {extra:?}", data.log_prefix());
        data.enqueue_request(
            TAG_BEGIN,
            &[Value::Map(extra)],
            Some(BoltResponse::new(ResponseMessage::Begin, callbacks)),
        )
    }

    fn commit<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        debug!("{}C: COMMIT", data.log_prefix());
        data.enqueue_request(
            TAG_COMMIT,
            &[],
            Some(BoltResponse::new(ResponseMessage::Commit, callbacks)),
        )
    }

    fn rollback<RW: Read + Write>(&mut self, data: &mut ConnectionData<RW>) -> Result<()> {
        debug!("{}C: ROLLBACK", data.log_prefix());
        data.enqueue_request(
            TAG_ROLLBACK,
            &[],
            Some(BoltResponse::from_message(ResponseMessage::Rollback)),
        )
    }

    fn route<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: RouteParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        let RouteParameters {
            routing_context,
            bookmarks,
            db,
            imp_user,
        } = parameters;
        let bookmarks = bookmarks
            .map(Self::bookmarks_value)
            .unwrap_or_else(|| Value::List(Vec::new()));
        let mut extra = HashMap::with_capacity(2);
        if let Some(db) = db {
            extra.insert("db".into(), Value::from(db));
        }
        if let Some(imp_user) = imp_user {
            extra.insert("imp_user".into(), Value::from(imp_user));
        }
        debug!(
            "{}C: ROUTE {routing_context:?} {bookmarks:?} {extra:?}",
            data.log_prefix()
        );
        data.enqueue_request(
            TAG_ROUTE,
            &[
                Value::Map(routing_context.clone()),
                bookmarks,
                Value::Map(extra),
            ],
            Some(BoltResponse::new(ResponseMessage::Route, callbacks)),
        )
    }
}
