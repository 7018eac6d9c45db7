use std::collections::HashMap;
use std::sync::Arc;

use crate::address::Address;
use crate::error::{DriverError, Result};
use crate::value::Value;

// imports for docs
#[allow(unused)]
use super::record_stream::RecordStream;

/// Metadata about an executed query, received via
/// [`RecordStream::consume()`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Summary {
    /// Update statistics reported by the server.
    pub counters: Counters,
    /// What kind of query this was.
    pub query_type: Option<SummaryQueryType>,
    /// The database the query ran against.
    pub database: Option<String>,
    /// The server that executed the query.
    pub server_info: ServerInfo,
    /// Milliseconds until the first record was available.
    pub result_available_after: Option<i64>,
    /// Milliseconds until the result was fully consumed.
    pub result_consumed_after: Option<i64>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SummaryQueryType {
    Read,
    Write,
    ReadWrite,
    Schema,
}

/// Which server a result came from, over which protocol.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ServerInfo {
    pub address: Arc<Address>,
    pub server_agent: Arc<String>,
    pub protocol_version: (u8, u8),
}

/// The number of updates a query performed, as reported by the server.
#[derive(Debug, Copy, Clone, Default)]
#[non_exhaustive]
pub struct Counters {
    pub nodes_created: i64,
    pub nodes_deleted: i64,
    pub relationships_created: i64,
    pub relationships_deleted: i64,
    pub properties_set: i64,
    pub labels_added: i64,
    pub labels_removed: i64,
    pub indexes_added: i64,
    pub indexes_removed: i64,
    pub constraints_added: i64,
    pub constraints_removed: i64,
    pub system_updates: i64,
    pub contains_updates: bool,
    pub contains_system_updates: bool,
}

impl Summary {
    pub(crate) fn new(
        address: Arc<Address>,
        server_agent: Arc<String>,
        protocol_version: (u8, u8),
    ) -> Self {
        Self {
            counters: Default::default(),
            query_type: None,
            database: None,
            server_info: ServerInfo {
                address,
                server_agent,
                protocol_version,
            },
            result_available_after: None,
            result_consumed_after: None,
        }
    }

    /// Digest the metadata of RUN's SUCCESS.
    pub(crate) fn load_run_meta(&mut self, meta: &mut HashMap<String, Value>) -> Result<()> {
        self.result_available_after = take_int(meta, "t_first")?;
        Ok(())
    }

    /// Digest the metadata of the final PULL/DISCARD SUCCESS.
    pub(crate) fn load_pull_meta(&mut self, meta: &mut HashMap<String, Value>) -> Result<()> {
        self.result_consumed_after = take_int(meta, "t_last")?;
        self.query_type = match meta.remove("type") {
            None => None,
            Some(Value::String(query_type)) => Some(match query_type.as_str() {
                "r" => SummaryQueryType::Read,
                "w" => SummaryQueryType::Write,
                "rw" => SummaryQueryType::ReadWrite,
                "s" => SummaryQueryType::Schema,
                _ => {
                    return Err(DriverError::protocol_error(format!(
                        "server sent unknown query type {query_type:?}"
                    )))
                }
            }),
            Some(v) => {
                return Err(DriverError::protocol_error(format!(
                    "server sent non-string query type {v:?}"
                )))
            }
        };
        if let Some(Value::String(db)) = meta.remove("db") {
            self.database = Some(db);
        }
        if let Some(Value::Map(mut stats)) = meta.remove("stats") {
            self.counters = Counters::from_stats(&mut stats)?;
        }
        Ok(())
    }
}

impl Counters {
    fn from_stats(stats: &mut HashMap<String, Value>) -> Result<Self> {
        let system_updates = take_int(stats, "system-updates")?.unwrap_or_default();
        let mut counters = Self {
            nodes_created: take_int(stats, "nodes-created")?.unwrap_or_default(),
            nodes_deleted: take_int(stats, "nodes-deleted")?.unwrap_or_default(),
            relationships_created: take_int(stats, "relationships-created")?.unwrap_or_default(),
            relationships_deleted: take_int(stats, "relationships-deleted")?.unwrap_or_default(),
            properties_set: take_int(stats, "properties-set")?.unwrap_or_default(),
            labels_added: take_int(stats, "labels-added")?.unwrap_or_default(),
            labels_removed: take_int(stats, "labels-removed")?.unwrap_or_default(),
            indexes_added: take_int(stats, "indexes-added")?.unwrap_or_default(),
            indexes_removed: take_int(stats, "indexes-removed")?.unwrap_or_default(),
            constraints_added: take_int(stats, "constraints-added")?.unwrap_or_default(),
            constraints_removed: take_int(stats, "constraints-removed")?.unwrap_or_default(),
            system_updates,
            contains_updates: false,
            contains_system_updates: system_updates > 0,
        };
        counters.contains_updates = match stats.remove("contains-updates") {
            Some(Value::Boolean(contains_updates)) => contains_updates,
            _ => {
                counters.nodes_created > 0
                    || counters.nodes_deleted > 0
                    || counters.relationships_created > 0
                    || counters.relationships_deleted > 0
                    || counters.properties_set > 0
                    || counters.labels_added > 0
                    || counters.labels_removed > 0
                    || counters.indexes_added > 0
                    || counters.indexes_removed > 0
                    || counters.constraints_added > 0
                    || counters.constraints_removed > 0
            }
        };
        if let Some(Value::Boolean(contains_system_updates)) =
            stats.remove("contains-system-updates")
        {
            counters.contains_system_updates = contains_system_updates;
        }
        Ok(counters)
    }
}

fn take_int(meta: &mut HashMap<String, Value>, key: &str) -> Result<Option<i64>> {
    match meta.remove(key) {
        None => Ok(None),
        Some(Value::Integer(value)) => Ok(Some(value)),
        Some(v) => Err(DriverError::protocol_error(format!(
            "server sent non-integer {key:?}: {v:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    fn summary() -> Summary {
        Summary::new(
            Arc::new(Address::from(("localhost", 7687))),
            Arc::new(String::from("Neo4j/5.0.0")),
            (5, 0),
        )
    }

    #[test]
    fn loads_run_and_pull_meta() {
        let mut summary = summary();
        let mut run_meta = value_map!({"t_first": 7});
        summary.load_run_meta(&mut run_meta).unwrap();
        let mut pull_meta = value_map!({
            "t_last": 42,
            "type": "rw",
            "db": "movies",
            "stats": {"nodes-created": 2, "properties-set": 3},
        });
        summary.load_pull_meta(&mut pull_meta).unwrap();

        assert_eq!(summary.result_available_after, Some(7));
        assert_eq!(summary.result_consumed_after, Some(42));
        assert_eq!(summary.query_type, Some(SummaryQueryType::ReadWrite));
        assert_eq!(summary.database.as_deref(), Some("movies"));
        assert_eq!(summary.counters.nodes_created, 2);
        assert_eq!(summary.counters.properties_set, 3);
        assert!(summary.counters.contains_updates);
        assert!(!summary.counters.contains_system_updates);
    }

    #[test]
    fn read_only_query_has_no_updates() {
        let mut summary = summary();
        let mut pull_meta = value_map!({"type": "r", "stats": {}});
        summary.load_pull_meta(&mut pull_meta).unwrap();
        assert_eq!(summary.query_type, Some(SummaryQueryType::Read));
        assert!(!summary.counters.contains_updates);
    }

    #[test]
    fn rejects_malformed_meta() {
        let mut summary = summary();
        let mut pull_meta = value_map!({"type": 1});
        assert!(summary.load_pull_meta(&mut pull_meta).is_err());
    }
}
