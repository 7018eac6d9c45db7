#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! # Bolt Graph Database Driver
//!
//! This crate provides a client for graph databases speaking the Bolt
//! protocol (versions 5.0, 4.4, and the legacy 3). It leans on Rust's type
//! system and lifetimes to rule out many common driver misuses at compile
//! time.
//!
//! ## Concepts
//!
//! ### The Driver
//! All database interactions go through a [`Driver`], which owns the
//! connection pool (and the routing table for clustered setups). One driver
//! per application is the norm; see [`Driver::new()`].
//!
//! ### Sessions
//! [`Session`]s are spawned from the driver ([`Driver::session()`]) and are
//! cheap: create one per unit of work. A session borrows connections from the
//! pool as needed and runs one transaction at a time.
//!
//! Queries run in one of two ways:
//! - [`Session::transaction()`] for explicit transactions (prefer
//!   [`TransactionBuilder::run_with_retry()`] or the
//!   [`Session::execute_read()`]/[`Session::execute_write()`] shorthands,
//!   which retry transient cluster failures),
//! - [`Session::auto_commit()`] for queries that manage their own
//!   transactions, such as `CALL {...} IN TRANSACTION`.
//!
//! ### Causal Consistency
//! Clusters are eventually consistent: a write through the leader becomes
//! visible on followers later. To read your own writes, the server hands out
//! a [bookmark](`bookmarks::Bookmarks`) after every successful transaction;
//! presenting bookmarks with later work makes the server wait for that state.
//! Sessions chain their own transactions automatically; chains across
//! sessions are built via [`Session::last_bookmarks()`] or a shared
//! [`bookmarks::BookmarkManager`].
//!
//! ## Logging
//! The driver logs through the [`log`] facade. Messages target driver
//! debugging; everything user code must react to is reported through
//! [`Result`]s, not logs. Log output is not part of the stable API.
//!
//! ## Concurrency
//! [`Driver`] is `Send + Sync`; pool and routing table may be hit from any
//! number of threads. A [`Session`] is a single-threaded view: it takes
//! `&mut self` for all work, enforcing the one-transaction-at-a-time
//! contract at compile time.

pub mod address;
pub mod driver;
pub mod error;
mod macros;
mod sync;
mod value;

// imports for docs
#[allow(unused)]
use driver::session::{Session, SessionConfig, TransactionBuilder};
#[allow(unused)]
use driver::Driver;

pub use error::{DriverError, Result};
pub use value::Value;

/// Bookmarks for [causal consistency](crate#causal-consistency).
pub mod bookmarks {
    pub use super::driver::session::bookmarks::*;
}
/// Retry policies.
pub mod retry {
    pub use super::driver::session::retry::*;
}
/// Session and session configuration.
pub mod session {
    pub use super::driver::session::*;
}
/// Query summary structs (metadata) received via
/// [`RecordStream::consume()`](driver::record_stream::RecordStream::consume).
pub mod summary {
    pub use super::driver::summary::*;
}
/// Transactions and associated types.
pub mod transaction {
    pub use super::driver::transaction::*;
}
