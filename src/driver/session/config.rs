use std::sync::Arc;

use super::bookmarks::{BookmarkManager, Bookmarks};
use crate::driver::config::ConfigureFetchSizeError;
use crate::driver::RoutingControl;

// imports for docs
#[allow(unused)]
use super::Session;
#[allow(unused)]
use crate::driver::{Driver, DriverConfig};

/// The scope of a [`Session`]: target database, impersonation, initial
/// bookmarks, fetch size, and default access mode.
///
/// See [`Driver::session()`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub(crate) database: Option<Arc<String>>,
    pub(crate) bookmarks: Option<Arc<Bookmarks>>,
    pub(crate) impersonated_user: Option<Arc<String>>,
    pub(crate) fetch_size: Option<i64>,
    pub(crate) bookmark_manager: Option<Arc<dyn BookmarkManager>>,
    pub(crate) default_access_mode: Option<RoutingControl>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target a specific database.
    ///
    /// Specifying the database whenever it is known lets the driver skip
    /// home-database resolution.
    pub fn with_database(mut self, database: Arc<String>) -> Self {
        self.database = Some(database);
        self
    }

    /// Target the server-side configured default (home) database
    /// (the *default*).
    pub fn with_default_database(mut self) -> Self {
        self.database = None;
        self
    }

    /// Bookmarks establishing the causal-consistency baseline of this
    /// session.
    pub fn with_bookmarks(mut self, bookmarks: Arc<Bookmarks>) -> Self {
        self.bookmarks = Some(bookmarks);
        self
    }

    pub fn without_bookmarks(mut self) -> Self {
        self.bookmarks = None;
        self
    }

    /// Run all work in this session as `user` (requires the appropriate
    /// permissions on the server).
    pub fn with_impersonated_user(mut self, user: Arc<String>) -> Self {
        self.impersonated_user = Some(user);
        self
    }

    pub fn without_impersonated_user(mut self) -> Self {
        self.impersonated_user = None;
        self
    }

    /// How many records to request per PULL batch, overriding
    /// [`DriverConfig::with_fetch_size()`].
    #[allow(clippy::result_large_err)]
    pub fn with_fetch_size(
        mut self,
        fetch_size: u64,
    ) -> Result<Self, ConfigureFetchSizeError<Self>> {
        match i64::try_from(fetch_size) {
            Ok(fetch_size) => {
                self.fetch_size = Some(fetch_size);
                Ok(self)
            }
            Err(_) => Err(ConfigureFetchSizeError { builder: self }),
        }
    }

    /// Fetch all records of each result at once.
    pub fn with_fetch_all(mut self) -> Self {
        self.fetch_size = Some(-1);
        self
    }

    /// Use the driver's fetch size (the *default*).
    pub fn with_default_fetch_size(mut self) -> Self {
        self.fetch_size = None;
        self
    }

    /// Manage this session's causal chain through `manager`, chaining it with
    /// every other session using the same manager.
    pub fn with_bookmark_manager(mut self, manager: Arc<dyn BookmarkManager>) -> Self {
        self.bookmark_manager = Some(manager);
        self
    }

    pub fn without_bookmark_manager(mut self) -> Self {
        self.bookmark_manager = None;
        self
    }

    /// The access mode assumed when a transaction builder does not specify
    /// one (the *default* is [`RoutingControl::Write`]).
    pub fn with_default_access_mode(mut self, mode: RoutingControl) -> Self {
        self.default_access_mode = Some(mode);
        self
    }
}

impl AsRef<SessionConfig> for SessionConfig {
    #[inline]
    fn as_ref(&self) -> &SessionConfig {
        self
    }
}
