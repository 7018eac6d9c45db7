mod bolt3;
mod bolt4x4;
mod bolt5x0;
mod chunk;
mod handshake;
mod message;
pub(crate) mod message_parameters;
mod packstream;
mod response;
mod socket;
mod state;

use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use atomic_refcell::AtomicRefCell;
use enum_dispatch::enum_dispatch;
use log::debug;

use super::deadline::DeadlineIO;
use crate::address::Address;
use crate::error::{DriverError, Result, ServerError};
use crate::value::Value;

use bolt3::Bolt3;
use bolt4x4::Bolt4x4;
use bolt5x0::Bolt5x0;
use chunk::{write_chunked, Dechunker};
pub(crate) use handshake::open;
use message::BoltMessage;
use message_parameters::{
    BeginParameters, DiscardParameters, HelloParameters, PullParameters, RouteParameters,
    RunParameters,
};
use packstream::PackStreamError;
pub(crate) use response::{BoltMeta, BoltRecordFields, BoltResponse, ResponseCallbacks};
use response::ResponseMessage;
use state::{BoltState, BoltStateTracker};

pub(crate) type TcpRW = socket::Socket<socket::BufTcpStream>;
pub(crate) type TcpConnection = BoltConnection<TcpRW>;

pub(crate) type OnServerErrorCb<'a, 'b, RW> =
    Option<&'a mut (dyn FnMut(&mut ConnectionData<RW>, &mut ServerError) -> Result<()> + 'b)>;

/// Dispatch over the negotiated protocol version.
#[enum_dispatch]
pub(crate) trait BoltProtocol: Debug {
    fn hello<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: HelloParameters,
    ) -> Result<()>;
    fn goodbye<RW: Read + Write>(&mut self, data: &mut ConnectionData<RW>) -> Result<()>;
    fn reset<RW: Read + Write>(&mut self, data: &mut ConnectionData<RW>) -> Result<()>;
    fn run<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: RunParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()>;
    fn discard<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: DiscardParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()>;
    fn pull<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: PullParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()>;
    fn begin<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: BeginParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()>;
    fn commit<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        callbacks: ResponseCallbacks,
    ) -> Result<()>;
    fn rollback<RW: Read + Write>(&mut self, data: &mut ConnectionData<RW>) -> Result<()>;
    fn route<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: RouteParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()>;
}

#[enum_dispatch(BoltProtocol)]
#[derive(Debug)]
enum Protocol {
    V3(Bolt3),
    V4x4(Bolt4x4),
    V5x0(Bolt5x0),
}

impl Protocol {
    fn for_version(version: (u8, u8)) -> Self {
        match version {
            (5, 0) => Bolt5x0::default().into(),
            (4, 4) => Bolt4x4::default().into(),
            (3, 0) => Bolt3::default().into(),
            _ => panic!("implement protocol for version {version:?}"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ConnectionState {
    Healthy,
    Broken,
    Closed,
}

/// A single physical Bolt connection.
///
/// Requests are buffered locally ([`BoltConnection::write_all`] flushes them)
/// and replies are matched to requests in FIFO order
/// ([`BoltConnection::read_one`]/[`BoltConnection::read_all`]).
#[derive(Debug)]
pub(crate) struct BoltConnection<RW: Read + Write> {
    data: ConnectionData<RW>,
    protocol: Protocol,
}

impl<RW: Read + Write> BoltConnection<RW> {
    fn new(
        version: (u8, u8),
        stream: RW,
        socket: Arc<Option<TcpStream>>,
        local_port: Option<u16>,
        address: Arc<Address>,
    ) -> Self {
        Self {
            data: ConnectionData::new(version, stream, socket, local_port, address),
            protocol: Protocol::for_version(version),
        }
    }

    pub(crate) fn close(&mut self) {
        if self.data.closed() {
            return;
        }
        self.data.connection_state = ConnectionState::Closed;
        self.data.message_buff.clear();
        self.data.responses.clear();
        if self.goodbye().is_err() {
            return;
        }
        let _ = self
            .data
            .write_all(Some(Instant::now() + Duration::from_millis(100)));
    }

    pub(crate) fn closed(&self) -> bool {
        self.data.closed()
    }

    /// Broken outside a server-reported failure: the transport died.
    pub(crate) fn unexpectedly_closed(&self) -> bool {
        self.data.connection_state == ConnectionState::Broken
            && self.data.bolt_state.state() != BoltState::Failed
    }

    pub(crate) fn protocol_version(&self) -> (u8, u8) {
        self.data.version
    }

    pub(crate) fn address(&self) -> Arc<Address> {
        Arc::clone(&self.data.address)
    }

    pub(crate) fn server_agent(&self) -> Arc<String> {
        Arc::clone(&self.data.server_agent.borrow())
    }

    pub(crate) fn hello(&mut self, parameters: HelloParameters) -> Result<()> {
        self.protocol.hello(&mut self.data, parameters)
    }

    pub(crate) fn goodbye(&mut self) -> Result<()> {
        self.protocol.goodbye(&mut self.data)
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        self.protocol.reset(&mut self.data)
    }

    pub(crate) fn run(
        &mut self,
        parameters: RunParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.protocol.run(&mut self.data, parameters, callbacks)
    }

    pub(crate) fn discard(
        &mut self,
        parameters: DiscardParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.protocol.discard(&mut self.data, parameters, callbacks)
    }

    pub(crate) fn pull(
        &mut self,
        parameters: PullParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.protocol.pull(&mut self.data, parameters, callbacks)
    }

    pub(crate) fn begin(
        &mut self,
        parameters: BeginParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.protocol.begin(&mut self.data, parameters, callbacks)
    }

    pub(crate) fn commit(&mut self, callbacks: ResponseCallbacks) -> Result<()> {
        self.protocol.commit(&mut self.data, callbacks)
    }

    pub(crate) fn rollback(&mut self) -> Result<()> {
        self.protocol.rollback(&mut self.data)
    }

    pub(crate) fn route(
        &mut self,
        parameters: RouteParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.protocol.route(&mut self.data, parameters, callbacks)
    }

    pub(crate) fn write_all(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.data.idle_since = Instant::now();
        self.data.write_all(deadline)?;
        self.data.flush(deadline)
    }

    pub(crate) fn read_all(
        &mut self,
        deadline: Option<Instant>,
        mut on_server_error: OnServerErrorCb<RW>,
    ) -> Result<()> {
        let on_server_error = &mut on_server_error;
        while self.expects_reply() {
            self.read_one(deadline, on_server_error.as_deref_mut())?;
        }
        Ok(())
    }

    pub(crate) fn read_one(
        &mut self,
        deadline: Option<Instant>,
        on_server_error: OnServerErrorCb<RW>,
    ) -> Result<()> {
        let mut reader = DeadlineIO::new(
            &mut self.data.stream,
            deadline,
            (*self.data.socket).as_ref(),
        );
        let mut dechunker = Dechunker::new(&mut reader);
        let message_result = BoltMessage::load(&mut dechunker);
        drop(dechunker);
        let message_result = reader.rewrite_error(message_result);
        let message = self.data.wrap_read_result(message_result)?;
        self.data.idle_since = Instant::now();
        self.data.handle_response(message, on_server_error)
    }

    pub(crate) fn has_buffered_message(&self) -> bool {
        !self.data.message_buff.is_empty()
    }

    pub(crate) fn expects_reply(&self) -> bool {
        !self.data.responses.is_empty()
    }

    pub(crate) fn expected_reply_len(&self) -> usize {
        self.data.responses.len()
    }

    /// Whether releasing the connection back into the pool requires a RESET
    /// round-trip first.
    pub(crate) fn needs_reset(&self) -> bool {
        if let Some(response) = self.data.responses.back() {
            if response.message == ResponseMessage::Reset {
                return false;
            }
        }
        if self.data.connection_state != ConnectionState::Healthy {
            return false;
        }
        !(self.data.bolt_state.state() == BoltState::Ready && self.data.responses.is_empty())
    }

    pub(crate) fn is_older_than(&self, duration: Duration) -> bool {
        self.data.created_at.elapsed() >= duration
    }

    pub(crate) fn is_idle_for(&self, timeout: Duration) -> bool {
        self.data.idle_since.elapsed() >= timeout
    }

    #[inline(always)]
    pub(crate) fn debug_log(&self, msg: impl FnOnce() -> String) {
        debug!("{}{}", self.data.log_prefix(), msg());
    }
}

impl<RW: Read + Write> Drop for BoltConnection<RW> {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct ConnectionData<RW: Read + Write> {
    message_buff: VecDeque<Vec<u8>>,
    responses: VecDeque<BoltResponse>,
    stream: RW,
    socket: Arc<Option<TcpStream>>,
    local_port: Option<u16>,
    version: (u8, u8),
    connection_state: ConnectionState,
    bolt_state: BoltStateTracker,
    meta: Arc<AtomicRefCell<HashMap<String, Value>>>,
    server_agent: Arc<AtomicRefCell<Arc<String>>>,
    address: Arc<Address>,
    last_qid: Arc<AtomicRefCell<Option<i64>>>,
    created_at: Instant,
    idle_since: Instant,
}

impl<RW: Read + Write> ConnectionData<RW> {
    fn new(
        version: (u8, u8),
        stream: RW,
        socket: Arc<Option<TcpStream>>,
        local_port: Option<u16>,
        address: Arc<Address>,
    ) -> Self {
        let now = Instant::now();
        Self {
            message_buff: VecDeque::with_capacity(8),
            responses: VecDeque::with_capacity(8),
            stream,
            socket,
            local_port,
            version,
            connection_state: ConnectionState::Healthy,
            bolt_state: BoltStateTracker::new(),
            meta: Default::default(),
            server_agent: Default::default(),
            address,
            last_qid: Default::default(),
            created_at: now,
            idle_since: now,
        }
    }

    pub(crate) fn address(&self) -> &Arc<Address> {
        &self.address
    }

    fn closed(&self) -> bool {
        self.connection_state != ConnectionState::Healthy
    }

    fn log_prefix(&self) -> String {
        let meta = self.meta.try_borrow();
        let id = meta
            .as_ref()
            .ok()
            .and_then(|meta| meta.get("connection_id"))
            .and_then(Value::as_string)
            .map(String::as_str)
            .unwrap_or("")
            .to_string();
        format!("[#{:04X} {:<10}] ", self.local_port.unwrap_or(0), id)
    }

    /// Serialize one request message into the outgoing buffer and register
    /// the expected reply.
    fn enqueue_request(
        &mut self,
        tag: u8,
        fields: &[Value],
        response: Option<BoltResponse>,
    ) -> Result<()> {
        let mut buffer = Vec::with_capacity(64);
        let message = Value::Structure {
            tag,
            fields: fields.to_vec(),
        };
        packstream::write_value(&mut buffer, &message).map_err(|err| match err {
            // writing to a Vec cannot fail; anything else is data the
            // protocol cannot represent
            PackStreamError::Io(err) => DriverError::write_err(err),
            PackStreamError::Protocol(reason) => DriverError::invalid_config(reason),
        })?;
        self.message_buff.push_back(buffer);
        if let Some(response) = response {
            self.responses.push_back(response);
        }
        Ok(())
    }

    fn can_omit_qid(&self, qid: i64) -> bool {
        qid == -1 || Some(qid) == *self.last_qid.borrow()
    }

    fn write_all(&mut self, deadline: Option<Instant>) -> Result<()> {
        while let Some(message_buff) = self.message_buff.pop_front() {
            let mut writer =
                DeadlineIO::new(&mut self.stream, deadline, (*self.socket).as_ref());
            let res = DriverError::wrap_write(write_chunked(&mut writer, &message_buff));
            let res = writer.rewrite_error(res);
            if let Err(err) = &res {
                self.handle_write_error(err);
                return res;
            }
        }
        Ok(())
    }

    fn flush(&mut self, deadline: Option<Instant>) -> Result<()> {
        let mut writer = DeadlineIO::new(&mut self.stream, deadline, (*self.socket).as_ref());
        let res = DriverError::wrap_write(std::io::Write::flush(&mut writer));
        let res = writer.rewrite_error(res);
        if let Err(err) = &res {
            self.handle_write_error(err);
            return res;
        }
        Ok(())
    }

    fn handle_write_error(&mut self, err: &DriverError) {
        debug!("{}write failed: {}", self.log_prefix(), err);
        self.mark_broken();
    }

    fn wrap_read_result<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            debug!("{}read failed: {err:?}", self.log_prefix());
            self.mark_broken();
        }
        res
    }

    fn mark_broken(&mut self) {
        self.connection_state = ConnectionState::Broken;
        if let Some(socket) = (*self.socket).as_ref() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }

    fn handle_response(
        &mut self,
        message: BoltMessage,
        on_server_error: OnServerErrorCb<RW>,
    ) -> Result<()> {
        let mut response = self
            .responses
            .pop_front()
            .expect("read a message without expecting a reply");
        match message {
            BoltMessage {
                tag: 0x70,
                mut fields,
            } => {
                assert_response_field_count("SUCCESS", &fields, 1)?;
                let meta = fields.pop().unwrap();
                debug!("{}S: SUCCESS {meta:?}", self.log_prefix());
                self.bolt_state.success(response.message, &meta);
                response.callbacks.on_success(meta)
            }
            BoltMessage { tag: 0x7E, fields } => {
                assert_response_field_count("IGNORED", &fields, 0)?;
                debug!("{}S: IGNORED", self.log_prefix());
                response.callbacks.on_ignored()
            }
            BoltMessage {
                tag: 0x7F,
                mut fields,
            } => {
                assert_response_field_count("FAILURE", &fields, 1)?;
                let meta = fields.pop().unwrap();
                debug!("{}S: FAILURE {meta:?}", self.log_prefix());
                let meta = meta
                    .try_into_map()
                    .map_err(|_| DriverError::protocol_error("FAILURE metadata was not a map"))?;
                let mut error = ServerError::from_meta(meta);
                self.bolt_state.failure();
                if let Some(cb) = on_server_error {
                    cb(self, &mut error)?;
                }
                response.callbacks.on_failure(error)
            }
            BoltMessage {
                tag: 0x71,
                mut fields,
            } => {
                assert_response_field_count("RECORD", &fields, 1)?;
                let data = fields.pop().unwrap();
                debug!("{}S: RECORD [...]", self.log_prefix());
                let res = response.callbacks.on_record(data);
                self.responses.push_front(response);
                res
            }
            BoltMessage { tag, .. } => Err(DriverError::protocol_error(format!(
                "unknown response message tag {tag:02X?}"
            ))),
        }
    }
}

impl<RW: Read + Write> Debug for ConnectionData<RW> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionData")
            .field("address", &self.address)
            .field("version", &self.version)
            .field("connection_state", &self.connection_state)
            .field("bolt_state", &self.bolt_state)
            .field("responses", &self.responses)
            .finish()
    }
}

fn assert_response_field_count(name: &str, fields: &[Value], expected: usize) -> Result<()> {
    if fields.len() == expected {
        Ok(())
    } else {
        Err(DriverError::protocol_error(format!(
            "{name} response should have {expected} field(s) but found {:?}",
            fields
        )))
    }
}
