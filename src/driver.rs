pub(crate) mod config;
pub(crate) mod io;
mod record;
pub mod record_stream;
pub(crate) mod session;
pub(crate) mod summary;
pub(crate) mod transaction;

use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use io::pool::{Pool, PoolConfig};
use session::{Session, SessionConfig};

pub use config::{
    ConfigureFetchSizeError, ConnectionConfig, ConnectionConfigParseError, DriverConfig,
    InvalidRoutingContextError, KeepAliveConfig, TlsConfigError,
};
pub use record::Record;

/// Authentication tokens.
pub mod auth {
    pub use super::config::auth::*;
}

/// Whether work may be sent to any cluster member able to serve reads, or
/// must go to a writer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RoutingControl {
    /// A reader may serve the work.
    Read,
    /// The work requires a writer.
    Write,
}

impl RoutingControl {
    pub(crate) fn as_protocol_str(&self) -> &'static str {
        match self {
            RoutingControl::Read => "r",
            RoutingControl::Write => "w",
        }
    }
}

/// The entry point of the crate: manages the connection pool (and, for
/// `neo4j` schemes, the routing table) all database interactions go through.
///
/// There is no need to pool driver objects; an application usually creates
/// one driver and spawns all sessions from it. The driver is safe to share
/// across threads.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
///
/// use boltdrive::driver::auth::AuthToken;
/// use boltdrive::driver::{ConnectionConfig, Driver, DriverConfig, RoutingControl};
/// use boltdrive::retry::ExponentialBackoff;
/// use boltdrive::session::SessionConfig;
/// use boltdrive::value_map;
///
/// let connection_config: ConnectionConfig = "neo4j://localhost:7687".parse().unwrap();
/// let config = DriverConfig::new()
///     .with_auth(Arc::new(AuthToken::new_basic_auth("neo4j", "pass")));
/// let driver = Driver::new(connection_config, config);
///
/// let mut session = driver.session(
///     SessionConfig::new().with_database(Arc::new("neo4j".to_string())),
/// );
/// let count = session
///     .execute_read(ExponentialBackoff::new(), |tx| {
///         let mut stream = tx
///             .query("MATCH (n:Node) WHERE n.id > $min RETURN count(n)")
///             .with_parameters(value_map!({"min": 42}))
///             .run()?;
///         let record = stream.single().expect("count returns one record")?;
///         let count = record.into_values().next().expect("one value");
///         stream.consume()?;
///         tx.commit()?;
///         Ok(count)
///     })
///     .unwrap();
/// println!("{count:?}");
/// ```
#[derive(Debug)]
pub struct Driver {
    config: ReducedDriverConfig,
    pool: Pool,
}

impl Driver {
    /// Create a driver from where to connect ([`ConnectionConfig`]) and how
    /// to behave ([`DriverConfig`]).
    pub fn new(connection_config: ConnectionConfig, config: DriverConfig) -> Self {
        let ConnectionConfig {
            address,
            routing_context,
            tls_config,
            ..
        } = connection_config;
        let pool_config = PoolConfig {
            routing_context,
            tls_config: tls_config.map(Arc::new),
            user_agent: config.user_agent,
            auth: config.auth,
            max_connection_lifetime: config.max_connection_lifetime,
            max_connection_pool_size: config.max_connection_pool_size,
            connection_timeout: config.connection_timeout,
            keep_alive: config.keep_alive,
            connection_acquisition_timeout: config.connection_acquisition_timeout,
            resolver: config.resolver,
        };
        Driver {
            config: ReducedDriverConfig {
                fetch_size: config.fetch_size,
                idle_time_before_connection_test: config.idle_time_before_connection_test,
            },
            pool: Pool::new(Arc::new(address), pool_config),
        }
    }

    /// Spawn a new [`Session`] with the given scope.
    ///
    /// Session creation is cheap; create one per piece of work.
    pub fn session(&self, config: SessionConfig) -> Session<'_> {
        Session::new(config, &self.pool, &self.config)
    }
}

#[derive(Debug)]
pub(crate) struct ReducedDriverConfig {
    pub(crate) fetch_size: i64,
    pub(crate) idle_time_before_connection_test: Option<Duration>,
}

/// A result stream collected into memory.
#[derive(Debug)]
pub struct EagerResult {
    pub keys: Vec<Arc<String>>,
    pub records: Vec<Record>,
    pub summary: summary::Summary,
}

impl EagerResult {
    /// The single record of the result.
    ///
    /// Returns `Err(self)` if the result does not hold exactly one record.
    pub fn into_single(mut self) -> Result<Record, Self> {
        if self.records.len() != 1 {
            return Err(self);
        }
        Ok(self.records.pop().expect("checked length above"))
    }

    /// The single value of the single record of the result.
    ///
    /// Returns `Err(self)` unless the result is exactly one record with
    /// exactly one value.
    pub fn into_scalar(self) -> Result<crate::value::Value, Self> {
        if self.records.len() != 1 || self.keys.len() != 1 {
            return Err(self);
        }
        let mut records = self.records;
        let record = records.pop().expect("checked length above");
        match record.into_values().next() {
            Some(value) => Ok(value),
            None => Err(EagerResult {
                keys: self.keys,
                records,
                summary: self.summary,
            }),
        }
    }
}

/// An [`Address`] can be turned into a default (direct, plain-text)
/// connection configuration.
impl From<Address> for ConnectionConfig {
    fn from(address: Address) -> Self {
        ConnectionConfig::new(address)
    }
}
