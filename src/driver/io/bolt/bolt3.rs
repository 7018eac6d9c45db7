use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;
use log::debug;

use super::bolt5x0::{Bolt5x0, TAG_COMMIT, TAG_DISCARD, TAG_HELLO, TAG_PULL, TAG_ROLLBACK};
use super::message_parameters::{
    BeginParameters, DiscardParameters, HelloParameters, PullParameters, RouteParameters,
    RunParameters,
};
use super::{
    BoltProtocol, BoltResponse, ConnectionData, ResponseCallbacks, ResponseMessage,
};
use crate::error::{DriverError, Result};
use crate::value::Value;

const ROUTING_TABLE_PROCEDURE: &str = "CALL dbms.routing.getRoutingTable($context)";

/// Protocol version 3, the legacy floor.
///
/// Compared to 4.x:
///  * no database selection and no user impersonation; both are rejected
///    locally before any bytes hit the wire,
///  * PULL/DISCARD carry no extra map (the server always streams the whole
///    result, there is no reactive back-pressure and no qid multiplexing),
///  * no ROUTE message; routing tables come from the
///    `dbms.routing.getRoutingTable` procedure,
///  * connection hints from the server are not acted upon.
#[derive(Debug, Default)]
pub(super) struct Bolt3 {
    delegate: Bolt5x0,
}

fn unsupported_feature(name: &str) -> DriverError {
    DriverError::invalid_config(format!(
        "{name} is not supported over bolt version 3, requires at least version 4.4"
    ))
}

fn check_tx_target(db: Option<&str>, imp_user: Option<&str>) -> Result<()> {
    if db.is_some() {
        return Err(unsupported_feature("selecting a database"));
    }
    if imp_user.is_some() {
        return Err(unsupported_feature("user impersonation"));
    }
    Ok(())
}

impl BoltProtocol for Bolt3 {
    fn hello<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: HelloParameters,
    ) -> Result<()> {
        Bolt5x0::log_hello(data, &parameters);
        // v3 HELLO has no routing entry
        let extra = Bolt5x0::hello_extra(&HelloParameters::new(
            parameters.user_agent,
            parameters.auth,
            None,
        ));
        data.enqueue_request(TAG_HELLO, &[Value::Map(extra)], None)?;
        // pre-4 connections must not act on connection hints
        Bolt5x0::enqueue_hello_response(data, false);
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

    fn run<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: RunParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        check_tx_target(parameters.db, parameters.imp_user)?;
        self.delegate.run(data, parameters, callbacks)
    }

    fn discard<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: DiscardParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        if !data.can_omit_qid(parameters.qid) {
            return Err(unsupported_feature("addressing a result by id"));
        }
        debug!("{}C: DISCARD_ALL", data.log_prefix());
        data.enqueue_request(
            TAG_DISCARD,
            &[],
            Some(BoltResponse::new(ResponseMessage::Discard, callbacks)),
        )
    }

    fn pull<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: PullParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        if !data.can_omit_qid(parameters.qid) {
            return Err(unsupported_feature("addressing a result by id"));
        }
        // there is no batched streaming in v3, PULL_ALL fetches everything
        debug!("{}C: PULL_ALL", data.log_prefix());
        data.enqueue_request(
            TAG_PULL,
            &[],
            Some(BoltResponse::new(ResponseMessage::Pull, callbacks)),
        )
    }

    fn begin<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: BeginParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        check_tx_target(parameters.db, parameters.imp_user)?;
        self.delegate.begin(data, parameters, callbacks)
    }

    #[inline]
    fn commit<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        data.enqueue_request(
            TAG_COMMIT,
            &[],
            Some(BoltResponse::new(ResponseMessage::Commit, callbacks)),
        )
    }

    #[inline]
    fn rollback<RW: Read + Write>(&mut self, data: &mut ConnectionData<RW>) -> Result<()> {
        data.enqueue_request(
            TAG_ROLLBACK,
            &[],
            Some(BoltResponse::from_message(ResponseMessage::Rollback)),
        )
    }

    /// v3 has no ROUTE message; run the routing-table procedure instead and
    /// reshape its single record into the metadata a ROUTE reply would carry.
    fn route<RW: Read + Write>(
        &mut self,
        data: &mut ConnectionData<RW>,
        parameters: RouteParameters,
        callbacks: ResponseCallbacks,
    ) -> Result<()> {
        check_tx_target(parameters.db, parameters.imp_user)?;

        let keys: Arc<AtomicRefCell<Vec<String>>> = Default::default();
        let table: Arc<AtomicRefCell<HashMap<String, Value>>> = Default::default();
        let user_callbacks = Arc::new(AtomicRefCell::new(Some(callbacks)));

        let run_callbacks = ResponseCallbacks::new()
            .with_on_success({
                let keys = Arc::clone(&keys);
                move |mut meta| {
                    if let Some(Value::List(fields)) = meta.remove("fields") {
                        *keys.borrow_mut() = fields
                            .into_iter()
                            .filter_map(|field| field.try_into_string().ok())
                            .collect();
                    }
                    Ok(())
                }
            })
            .with_on_failure({
                let user_callbacks = Arc::clone(&user_callbacks);
                move |error| match user_callbacks.borrow_mut().take() {
                    Some(mut callbacks) => callbacks.on_failure(error),
                    None => Err(error.into()),
                }
            });

        let pull_callbacks = ResponseCallbacks::new()
            .with_on_record({
                let keys = Arc::clone(&keys);
                let table = Arc::clone(&table);
                move |fields| {
                    let keys = keys.borrow();
                    let mut table = table.borrow_mut();
                    for (key, value) in keys.iter().zip(fields) {
                        table.insert(key.clone(), value);
                    }
                    Ok(())
                }
            })
            .with_on_success({
                let table = Arc::clone(&table);
                let user_callbacks = Arc::clone(&user_callbacks);
                move |_meta| {
                    let Some(mut callbacks) = user_callbacks.borrow_mut().take() else {
                        return Ok(());
                    };
                    let mut meta = HashMap::with_capacity(1);
                    meta.insert(
                        String::from("rt"),
                        Value::Map(std::mem::take(&mut *table.borrow_mut())),
                    );
                    callbacks.on_success(Value::Map(meta))
                }
            })
            .with_on_failure({
                let user_callbacks = Arc::clone(&user_callbacks);
                move |error| match user_callbacks.borrow_mut().take() {
                    Some(mut callbacks) => callbacks.on_failure(error),
                    None => Err(error.into()),
                }
            });

        let mut context_param = HashMap::with_capacity(1);
        context_param.insert(
            String::from("context"),
            Value::Map(parameters.routing_context.clone()),
        );
        self.run(
            data,
            RunParameters::new_auto_commit_run(
                ROUTING_TABLE_PROCEDURE,
                Some(&context_param),
                parameters.bookmarks,
                None,
                None,
                Some("r"),
                None,
                None,
            ),
            run_callbacks,
        )?;
        self.pull(data, PullParameters::new(-1, -1), pull_callbacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpStream;

    use crate::address::Address;
    use crate::driver::config::auth::AuthToken;

    fn connection_data() -> ConnectionData<Cursor<Vec<u8>>> {
        ConnectionData::new(
            (3, 0),
            Cursor::new(Vec::new()),
            Arc::new(None::<TcpStream>),
            None,
            Arc::new(Address::from(("localhost", 7687))),
        )
    }

    #[test]
    fn rejects_database_before_sending() {
        let mut protocol = Bolt3::default();
        let mut data = connection_data();
        let parameters = BeginParameters::new(None, None, None, Some("r"), Some("mydb"), None);
        let res = protocol.begin(&mut data, parameters, ResponseCallbacks::new());
        assert!(matches!(res, Err(DriverError::InvalidConfig { .. })));
        assert!(data.message_buff.is_empty());
        assert!(data.responses.is_empty());
    }

    #[test]
    fn rejects_impersonation_before_sending() {
        let mut protocol = Bolt3::default();
        let mut data = connection_data();
        let parameters = RunParameters::new_auto_commit_run(
            "RETURN 1",
            None,
            None,
            None,
            None,
            None,
            None,
            Some("alice"),
        );
        let res = protocol.run(&mut data, parameters, ResponseCallbacks::new());
        assert!(matches!(res, Err(DriverError::InvalidConfig { .. })));
        assert!(data.message_buff.is_empty());
    }

    #[test]
    fn pull_has_no_extra_fields() {
        let mut protocol = Bolt3::default();
        let mut data = connection_data();
        protocol
            .pull(
                &mut data,
                PullParameters::new(1000, -1),
                ResponseCallbacks::new(),
            )
            .unwrap();
        // PULL_ALL is an empty structure: [marker, tag]
        assert_eq!(data.message_buff.back().unwrap(), &vec![0xB0, TAG_PULL]);
    }

    #[test]
    fn hello_carries_no_routing_context() {
        let mut protocol = Bolt3::default();
        let mut data = connection_data();
        let auth = Arc::new(AuthToken::new_basic_auth("neo4j", "pass"));
        let context = HashMap::new();
        protocol
            .hello(
                &mut data,
                HelloParameters::new("test-agent", &auth, Some(&context)),
            )
            .unwrap();
        let message = data.message_buff.back().unwrap();
        let needle = b"routing";
        assert!(!message
            .windows(needle.len())
            .any(|window| window == needle));
    }
}
