use std::io::{Read, Write};

use super::bolt5x0::Bolt5x0;
use super::message_parameters::{
    BeginParameters, DiscardParameters, HelloParameters, PullParameters, RouteParameters,
    RunParameters,
};
use super::{BoltProtocol, ConnectionData, ResponseCallbacks};
use crate::error::Result;
use crate::value::Value;

/// Protocol version 4.4.
///
/// On the wire, 4.4 differs from 5.0 in the shape of graph structures
/// (element ids) and the temporal struct tags negotiated via `patch_bolt`.
/// Both are opaque to this driver, which hands structures through verbatim,
/// so everything except the HELLO advertisement delegates to [`Bolt5x0`].
#[derive(Debug, Default)]
pub(super) struct Bolt4x4 {
    delegate: Bolt5x0,
}

impl BoltProtocol for Bolt4x4 {
    fn hello<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: HelloParameters,
    ) -> Result<()> {
        Bolt5x0::log_hello(data, &parameters);
        let extra = Bolt5x0::hello_extra(&parameters);
        data.enqueue_request(super::bolt5x0::TAG_HELLO, &[Value::Map(extra)], None)?;
        Bolt5x0::enqueue_hello_response(data, true);
        Ok(())
    }

    #[inline]
    fn goodbye<RW: Read + Write>(&mut self, data: &mut ConnectionData<RW>) -> Result<()> {
        self.delegate.goodbye(data)
    }

    #[inline]
    fn reset<RW: Read + Write>(&mut self, data: &mut ConnectionData<RW>) -> Result<()> {
        self.delegate.reset(data)
    }

    #[inline]
    fn run<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: RunParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.delegate.run(data, parameters, callbacks)
    }

    #[inline]
    fn discard<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: DiscardParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.delegate.discard(data, parameters, callbacks)
    }

    #[inline]
    fn pull<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: PullParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.delegate.pull(data, parameters, callbacks)
    }

    #[inline]
    fn begin<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: BeginParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.delegate.begin(data, parameters, callbacks)
    }

    #[inline]
    fn commit<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.delegate.commit(data, callbacks)
    }

    #[inline]
    fn rollback<RW: Read + Write>(&mut self, data: &mut ConnectionData<RW>) -> Result<()> {
        self.delegate.rollback(data)
    }

    #[inline]
    fn route<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: RouteParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        self.delegate.route(data, parameters, callbacks)
    }
}
