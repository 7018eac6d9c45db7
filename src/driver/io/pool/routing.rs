use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

use crate::address::Address;
use crate::driver::RoutingControl;
use crate::value::Value;

/// Cluster view for one database: who routes, who reads, who writes, and for
/// how long this knowledge may be used.
#[derive(Debug)]
pub(crate) struct RoutingTable {
    pub(crate) routers: Vec<Arc<Address>>,
    pub(crate) readers: Vec<Arc<Address>>,
    pub(crate) writers: Vec<Arc<Address>>,
    pub(crate) database: Option<Arc<String>>,
    pub(crate) initialized_without_writers: bool,
    created: Instant,
    ttl: Duration,
}

impl RoutingTable {
    /// The bootstrap table: only the initial router is known, listed as a
    /// reader so discovery can contact it.
    pub(crate) fn new(initial_router: Arc<Address>) -> Self {
        Self {
            routers: Vec::new(),
            readers: vec![initial_router],
            writers: Vec::new(),
            database: None,
            initialized_without_writers: true,
            created: Instant::now(),
            ttl: Duration::ZERO,
        }
    }

    pub(crate) fn servers_for_mode(&self, mode: RoutingControl) -> &[Arc<Address>] {
        match mode {
            RoutingControl::Read => &self.readers,
            RoutingControl::Write => &self.writers,
        }
    }

    pub(crate) fn try_parse(
        mut meta: HashMap<String, Value>,
    ) -> Result<Self, RoutingTableParseError> {
        let rt = meta.remove("rt").ok_or(RoutingTableParseError {
            reason: "top-level key \"rt\" missing",
        })?;
        let mut rt = rt.try_into_map().map_err(|_| RoutingTableParseError {
            reason: "value \"rt\" did not contain a map",
        })?;
        let ttl = rt
            .remove("ttl")
            .ok_or(RoutingTableParseError {
                reason: "missing \"ttl\"",
            })?
            .try_into_int()
            .map_err(|_| RoutingTableParseError {
                reason: "\"ttl\" was not an integer",
            })?;
        if ttl < 0 {
            return Err(RoutingTableParseError {
                reason: "negative \"ttl\"",
            });
        }
        let ttl = Duration::from_secs(ttl as u64);
        let database = match rt.remove("db") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(db)) => Ok(Some(db)),
            Some(_) => Err(RoutingTableParseError {
                reason: "\"db\" was not a string",
            }),
        }?;
        let servers = rt
            .remove("servers")
            .ok_or(RoutingTableParseError {
                reason: "missing \"servers\"",
            })?
            .try_into_list()
            .map_err(|_| RoutingTableParseError {
                reason: "\"servers\" was not a list",
            })?;

        let mut routers = Vec::new();
        let mut readers = Vec::new();
        let mut writers = Vec::new();
        for server in servers {
            match Self::parse_server(server)? {
                (ServerRole::Router, addresses) => routers = addresses,
                (ServerRole::Reader, addresses) => readers = addresses,
                (ServerRole::Writer, addresses) => writers = addresses,
                (ServerRole::Unknown, _) => {}
            }
        }

        let initialized_without_writers = writers.is_empty();
        Ok(Self {
            routers,
            readers,
            writers,
            database: database.map(Arc::new),
            initialized_without_writers,
            created: Instant::now(),
            ttl,
        })
    }

    fn parse_server(
        server: Value,
    ) -> Result<(ServerRole, Vec<Arc<Address>>), RoutingTableParseError> {
        let mut server = server.try_into_map().map_err(|_| RoutingTableParseError {
            reason: "\"servers\" entry was not a map",
        })?;
        let role = server
            .remove("role")
            .ok_or(RoutingTableParseError {
                reason: "\"servers\" entry missing \"role\"",
            })?
            .try_into_string()
            .map_err(|_| RoutingTableParseError {
                reason: "\"servers\" entry \"role\" was not a string",
            })?;
        let role = match ServerRole::from(role.as_str()) {
            ServerRole::Unknown => {
                warn!("ignoring unknown server role {role}");
                return Ok((ServerRole::Unknown, vec![]));
            }
            role => role,
        };
        let addresses = server
            .remove("addresses")
            .ok_or(RoutingTableParseError {
                reason: "\"servers\" entry missing \"addresses\"",
            })?
            .try_into_list()
            .map_err(|_| RoutingTableParseError {
                reason: "\"servers\" entry \"addresses\" was not a list",
            })?;
        let addresses = addresses
            .into_iter()
            .map(|address| {
                let address = address
                    .try_into_string()
                    .map_err(|_| RoutingTableParseError {
                        reason: "\"servers\" entry \"addresses\" contained a non-string",
                    })?;
                Ok(Arc::new(Address::from(&*address)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((role, addresses))
    }

    /// A table may only be used while it knows routers, knows servers for the
    /// requested mode, and has not outlived its ttl.
    pub(crate) fn is_fresh(&self, mode: RoutingControl) -> bool {
        if self.routers.is_empty() {
            debug!("routing table expired: no routers left {self:?}");
            return false;
        }
        if self.servers_for_mode(mode).is_empty() {
            debug!("routing table expired: no servers for {mode:?} mode left {self:?}");
            return false;
        }
        if self.created.elapsed() > self.ttl {
            debug!(
                "routing table expired: ttl ({:?}) < age ({:?}) {self:?}",
                self.ttl,
                self.created.elapsed(),
            );
            return false;
        }
        true
    }

    pub(crate) fn deactivate(&mut self, address: &Address) {
        self.routers = mem::take(&mut self.routers)
            .into_iter()
            .filter(|a| **a != *address)
            .collect();
        self.readers = mem::take(&mut self.readers)
            .into_iter()
            .filter(|a| **a != *address)
            .collect();
        self.deactivate_writer(address);
    }

    pub(crate) fn deactivate_writer(&mut self, address: &Address) {
        self.writers = mem::take(&mut self.writers)
            .into_iter()
            .filter(|a| **a != *address)
            .collect();
    }
}

#[derive(Error, Debug)]
#[error("failed to parse routing table: {reason}")]
pub(crate) struct RoutingTableParseError {
    reason: &'static str,
}

enum ServerRole {
    Router,
    Reader,
    Writer,
    Unknown,
}

impl From<&str> for ServerRole {
    fn from(s: &str) -> Self {
        match s {
            "ROUTE" => ServerRole::Router,
            "READ" => ServerRole::Reader,
            "WRITE" => ServerRole::Writer,
            _ => ServerRole::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{value, value_map};

    fn server_meta(ttl: i64, db: Option<&str>) -> HashMap<String, Value> {
        let mut rt = value_map!({
            "servers": [
                {"role": "ROUTE", "addresses": ["r1:7687", "r2:7687"]},
                {"role": "READ", "addresses": ["read1:7687", "read2:7687"]},
                {"role": "WRITE", "addresses": ["write1:7687"]},
            ],
        });
        rt.insert("ttl".into(), Value::Integer(ttl));
        if let Some(db) = db {
            rt.insert("db".into(), Value::from(db));
        }
        let mut meta = HashMap::with_capacity(1);
        meta.insert("rt".into(), Value::Map(rt));
        meta
    }

    #[test]
    fn parses_route_reply() {
        let table = RoutingTable::try_parse(server_meta(300, Some("movies"))).unwrap();
        assert_eq!(table.routers.len(), 2);
        assert_eq!(table.readers.len(), 2);
        assert_eq!(table.writers.len(), 1);
        assert_eq!(table.database.as_deref().map(String::as_str), Some("movies"));
        assert!(!table.initialized_without_writers);
        assert!(table.is_fresh(RoutingControl::Read));
        assert!(table.is_fresh(RoutingControl::Write));
    }

    #[test]
    fn ttl_zero_is_immediately_stale() {
        let table = RoutingTable::try_parse(server_meta(0, None)).unwrap();
        // age > 0 the moment we look at it
        std::thread::sleep(Duration::from_millis(2));
        assert!(!table.is_fresh(RoutingControl::Read));
    }

    #[test]
    fn write_mode_needs_writers() {
        let mut meta = server_meta(300, None);
        let Some(Value::Map(rt)) = meta.get_mut("rt") else {
            unreachable!()
        };
        rt.insert(
            "servers".into(),
            value!([
                {"role": "ROUTE", "addresses": ["r1:7687"]},
                {"role": "READ", "addresses": ["read1:7687"]},
            ]),
        );
        let table = RoutingTable::try_parse(meta).unwrap();
        assert!(table.initialized_without_writers);
        assert!(table.is_fresh(RoutingControl::Read));
        assert!(!table.is_fresh(RoutingControl::Write));
    }

    #[test]
    fn deactivation_removes_address_everywhere() {
        let mut table = RoutingTable::try_parse(server_meta(300, None)).unwrap();
        table.deactivate(&Address::from("r1:7687"));
        assert_eq!(table.routers.len(), 1);
        table.deactivate_writer(&Address::from("write1:7687"));
        assert!(table.writers.is_empty());
        // readers untouched by writer deactivation
        assert_eq!(table.readers.len(), 2);
    }

    #[test]
    fn rejects_malformed_replies() {
        assert!(RoutingTable::try_parse(HashMap::new()).is_err());
        let mut meta = server_meta(300, None);
        let Some(Value::Map(rt)) = meta.get_mut("rt") else {
            unreachable!()
        };
        rt.insert("ttl".into(), Value::Integer(-1));
        assert!(RoutingTable::try_parse(meta).is_err());
    }

    #[test]
    fn unknown_roles_are_ignored() {
        let mut meta = server_meta(300, None);
        let Some(Value::Map(rt)) = meta.get_mut("rt") else {
            unreachable!()
        };
        rt.insert(
            "servers".into(),
            value!([
                {"role": "ROUTE", "addresses": ["r1:7687"]},
                {"role": "READ", "addresses": ["read1:7687"]},
                {"role": "WRITE", "addresses": ["write1:7687"]},
                {"role": "ARBITER", "addresses": ["a1:7687"]},
            ]),
        );
        let table = RoutingTable::try_parse(meta).unwrap();
        assert_eq!(table.routers.len(), 1);
        assert_eq!(table.readers.len(), 1);
        assert_eq!(table.writers.len(), 1);
    }
}
