use std::io;

use log::info;
use thiserror::Error;

use crate::value::Value;

// imports for docs
#[allow(unused)]
use crate::address::AddressResolver;
#[allow(unused)]
use crate::bookmarks::BookmarkManager;
#[allow(unused)]
use crate::driver::DriverConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the driver.
///
/// Error messages are not part of the stable API; the only string that can be
/// relied upon (within the limits of the server version) is
/// [`ServerError::code()`].
#[derive(Error, Debug)]
pub enum DriverError {
    /// A connectivity problem: failure to connect, a broken socket, or the
    /// inability to fetch routing information.
    #[error("connection failed: {message} (during commit: {during_commit}){}",
            source.as_ref().map(|err| format!(" caused by: {err}")).unwrap_or_default())]
    #[non_exhaustive]
    Disconnect {
        message: String,
        source: Option<io::Error>,
        /// `true` when the connection was lost while the driver cannot know
        /// whether the ongoing transaction has been committed.
        /// Recovering from this requires business logic to decide whether the
        /// work should be replayed.
        during_commit: bool,
    },

    /// User input the driver cannot work with: malformed URIs, conflicting
    /// encryption settings, values or features unsupported by the negotiated
    /// protocol version, invalid bookmarks, failing socket configuration.
    #[error("invalid configuration: {message}")]
    #[non_exhaustive]
    InvalidConfig { message: String },

    /// The server replied with a FAILURE message.
    #[error("{error}")]
    #[non_exhaustive]
    Server { error: Box<ServerError> },

    /// Connection acquisition did not complete within
    /// [`DriverConfig::with_connection_acquisition_timeout()`].
    #[error("{message}")]
    #[non_exhaustive]
    Timeout { message: String },

    /// A user-provided callback failed, see [`UserCallbackError`].
    #[error("{error}")]
    #[non_exhaustive]
    UserCallback { error: UserCallbackError },

    /// An unexpected message or message content was received.
    /// This indicates a bug in either the driver or the server.
    /// The affected connection is abandoned.
    #[error("protocol violation (driver or server bug): {message}")]
    #[non_exhaustive]
    Protocol { message: String },
}

impl DriverError {
    /// Whether a managed transaction function failing with this error may be
    /// retried on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Server { error } => error.is_retryable(),
            Self::Disconnect { during_commit, .. } => !during_commit,
            _ => false,
        }
    }

    pub(crate) fn disconnect(message: impl Into<String>) -> Self {
        Self::Disconnect {
            message: message.into(),
            source: None,
            during_commit: false,
        }
    }

    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn read_err(err: io::Error) -> Self {
        info!("read error: {err}");
        Self::Disconnect {
            message: String::from("failed to read"),
            source: Some(err),
            during_commit: false,
        }
    }

    pub(crate) fn wrap_read<T>(res: io::Result<T>) -> Result<T> {
        res.map_err(Self::read_err)
    }

    pub(crate) fn write_err(err: io::Error) -> Self {
        info!("write error: {err}");
        Self::Disconnect {
            message: String::from("failed to write"),
            source: Some(err),
            during_commit: false,
        }
    }

    pub(crate) fn wrap_write<T>(res: io::Result<T>) -> Result<T> {
        res.map_err(Self::write_err)
    }

    pub(crate) fn connect_err(err: io::Error) -> Self {
        Self::Disconnect {
            message: String::from("failed to open connection"),
            source: Some(err),
            during_commit: false,
        }
    }

    pub(crate) fn wrap_connect<T>(res: io::Result<T>) -> Result<T> {
        res.map_err(Self::connect_err)
    }

    pub(crate) fn failed_commit(mut self) -> Self {
        if let Self::Disconnect { during_commit, .. } = &mut self {
            *during_commit = true;
        }
        self
    }

    pub(crate) fn wrap_commit<T>(res: Result<T>) -> Result<T> {
        res.map_err(Self::failed_commit)
    }

    pub(crate) fn acquisition_timeout(during: impl AsRef<str>) -> Self {
        Self::Timeout {
            message: format!("connection acquisition timed out while {}", during.as_ref()),
        }
    }

    /// Errors that must abort a routing-table refresh instead of moving on to
    /// the next candidate router.
    pub(crate) fn fatal_during_discovery(&self) -> bool {
        match self {
            Self::Server { error } => error.fatal_during_discovery(),
            Self::InvalidConfig { .. } => true,
            Self::UserCallback { .. } => true,
            _ => false,
        }
    }
}

/// A FAILURE sent by the server, carrying the server's error `code` and
/// `message`.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ServerError {
    code: String,
    message: String,
    retryable_overwrite: bool,
}

const UNKNOWN_SERVER_CODE: &str = "Neo.DatabaseError.General.UnknownError";
const UNKNOWN_SERVER_MESSAGE: &str = "An unknown error occurred.";

impl ServerError {
    pub(crate) fn new(code: String, message: String) -> Self {
        Self {
            code: Self::map_legacy_codes(code),
            message,
            retryable_overwrite: false,
        }
    }

    pub(crate) fn from_meta(mut meta: std::collections::HashMap<String, Value>) -> Self {
        let code = match meta.remove("code") {
            Some(Value::String(code)) => code,
            _ => UNKNOWN_SERVER_CODE.into(),
        };
        let message = match meta.remove("message") {
            Some(Value::String(message)) => message,
            _ => UNKNOWN_SERVER_MESSAGE.into(),
        };
        Self::new(code, message)
    }

    fn map_legacy_codes(code: String) -> String {
        // Servers before protocol 5.0 classify these as transient although
        // retrying them is futile. Newer servers already send ClientError.
        match code.as_str() {
            "Neo.TransientError.Transaction.Terminated" => {
                String::from("Neo.ClientError.Transaction.Terminated")
            }
            "Neo.TransientError.Transaction.LockClientStopped" => {
                String::from("Neo.ClientError.Transaction.LockClientStopped")
            }
            _ => code,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Second segment of the code, e.g. `"ClientError"`.
    pub fn classification(&self) -> &str {
        self.code.split('.').nth(1).unwrap_or("")
    }

    /// Third segment of the code, e.g. `"Security"`.
    pub fn category(&self) -> &str {
        self.code.split('.').nth(2).unwrap_or("")
    }

    /// Fourth segment of the code, e.g. `"Unauthorized"`.
    pub fn title(&self) -> &str {
        self.code.split('.').nth(3).unwrap_or("")
    }

    pub(crate) fn is_retryable(&self) -> bool {
        self.retryable_overwrite
            || match self.code() {
                "Neo.ClientError.Security.AuthorizationExpired"
                | "Neo.ClientError.Cluster.NotALeader"
                | "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase" => true,
                _ => self.classification() == "TransientError",
            }
    }

    pub(crate) fn fatal_during_discovery(&self) -> bool {
        match self.code() {
            "Neo.ClientError.Database.DatabaseNotFound"
            | "Neo.ClientError.Transaction.InvalidBookmark"
            | "Neo.ClientError.Transaction.InvalidBookmarkMixture"
            | "Neo.ClientError.Statement.TypeError"
            | "Neo.ClientError.Statement.ArgumentError"
            | "Neo.ClientError.Request.Invalid" => true,
            code => {
                code.starts_with("Neo.ClientError.Security.")
                    && code != "Neo.ClientError.Security.AuthorizationExpired"
            }
        }
    }

    pub(crate) fn deactivates_server(&self) -> bool {
        self.code == "Neo.TransientError.General.DatabaseUnavailable"
    }

    pub(crate) fn invalidates_writer(&self) -> bool {
        matches!(
            self.code(),
            "Neo.ClientError.Cluster.NotALeader"
                | "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase"
        )
    }

    pub(crate) fn clone_with_reason(&self, reason: &str) -> Self {
        Self {
            code: self.code.clone(),
            message: format!("{}: {}", reason, self.message),
            retryable_overwrite: self.retryable_overwrite,
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error: {} (code: {})", self.message, self.code)
    }
}

impl From<ServerError> for DriverError {
    fn from(error: ServerError) -> Self {
        Self::Server {
            error: Box::new(error),
        }
    }
}

/// A callback provided by the user failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UserCallbackError {
    /// The configured [`AddressResolver`] returned an error.
    #[error("resolver callback failed: {0}")]
    Resolver(BoxError),
    /// The configured [`BookmarkManager`]'s `get_bookmarks()` failed.
    /// The transaction will not have taken place.
    #[error("BookmarkManager get_bookmarks failed: {0}")]
    BookmarkManagerGet(BoxError),
    /// The configured [`BookmarkManager`]'s `update_bookmarks()` failed.
    /// The transaction will already have taken place.
    #[error("BookmarkManager update_bookmarks failed: {0}")]
    BookmarkManagerUpdate(BoxError),
}

impl UserCallbackError {
    pub fn user_error(&self) -> &dyn std::error::Error {
        match self {
            Self::Resolver(err)
            | Self::BookmarkManagerGet(err)
            | Self::BookmarkManagerUpdate(err) => err.as_ref(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        let err = ServerError::new(
            "Neo.TransientError.General.MemoryPoolOutOfMemoryError".into(),
            "oom".into(),
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn legacy_terminated_is_remapped_and_not_retryable() {
        let err = ServerError::new(
            "Neo.TransientError.Transaction.Terminated".into(),
            "terminated".into(),
        );
        assert_eq!(err.code(), "Neo.ClientError.Transaction.Terminated");
        assert!(!err.is_retryable());
    }

    #[test]
    fn not_a_leader_invalidates_writer_and_is_retryable() {
        let err = ServerError::new("Neo.ClientError.Cluster.NotALeader".into(), "moved".into());
        assert!(err.invalidates_writer());
        assert!(err.is_retryable());
    }

    #[test]
    fn disconnect_during_commit_is_not_retryable() {
        let err = DriverError::disconnect("gone").failed_commit();
        assert!(!err.is_retryable());
        let err = DriverError::disconnect("gone");
        assert!(err.is_retryable());
    }

    #[test]
    fn security_errors_are_fatal_during_discovery() {
        let err = ServerError::new(
            "Neo.ClientError.Security.Unauthorized".into(),
            "denied".into(),
        );
        assert!(err.fatal_during_discovery());
        let err = ServerError::new(
            "Neo.ClientError.Security.AuthorizationExpired".into(),
            "expired".into(),
        );
        assert!(!err.fatal_during_discovery());
    }
}
