use std::collections::HashMap;
use std::sync::Arc;

use crate::bookmarks::Bookmarks;
use crate::driver::config::auth::AuthToken;
use crate::value::Value;

#[derive(Debug, Clone, Copy)]
pub(crate) struct HelloParameters<'a> {
    pub(super) user_agent: &'a str,
    pub(super) auth: &'a Arc<AuthToken>,
    pub(super) routing_context: Option<&'a HashMap<String, Value>>,
}

impl<'a> HelloParameters<'a> {
    pub(crate) fn new(
        user_agent: &'a str,
        auth: &'a Arc<AuthToken>,
        routing_context: Option<&'a HashMap<String, Value>>,
    ) -> Self {
        Self {
            user_agent,
            auth,
            routing_context,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RunParameters<'a> {
    pub(super) query: &'a str,
    pub(super) parameters: Option<&'a HashMap<String, Value>>,
    pub(super) bookmarks: Option<&'a Bookmarks>,
    pub(super) tx_timeout: Option<i64>,
    pub(super) tx_metadata: Option<&'a HashMap<String, Value>>,
    pub(super) mode: Option<&'a str>,
    pub(super) db: Option<&'a str>,
    pub(super) imp_user: Option<&'a str>,
}

impl<'a> RunParameters<'a> {
    #[allow(clippy::too_many_arguments)] // internal API, a builder is overkill
    pub(crate) fn new_auto_commit_run(
        query: &'a str,
        parameters: Option<&'a HashMap<String, Value>>,
        bookmarks: Option<&'a Bookmarks>,
        tx_timeout: Option<i64>,
        tx_metadata: Option<&'a HashMap<String, Value>>,
        mode: Option<&'a str>,
        db: Option<&'a str>,
        imp_user: Option<&'a str>,
    ) -> Self {
        Self {
            query,
            parameters,
            bookmarks,
            tx_timeout,
            tx_metadata,
            mode,
            db,
            imp_user,
        }
    }

    pub(crate) fn new_transaction_run(
        query: &'a str,
        parameters: Option<&'a HashMap<String, Value>>,
    ) -> Self {
        Self {
            query,
            parameters,
            bookmarks: None,
            tx_timeout: None,
            tx_metadata: None,
            mode: None,
            db: None,
            imp_user: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PullParameters {
    pub(super) n: i64,
    pub(super) qid: i64,
}

impl PullParameters {
    pub(crate) fn new(n: i64, qid: i64) -> Self {
        Self { n, qid }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DiscardParameters {
    pub(super) n: i64,
    pub(super) qid: i64,
}

impl DiscardParameters {
    pub(crate) fn new(n: i64, qid: i64) -> Self {
        Self { n, qid }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BeginParameters<'a> {
    pub(super) bookmarks: Option<&'a Bookmarks>,
    pub(super) tx_timeout: Option<i64>,
    pub(super) tx_metadata: Option<&'a HashMap<String, Value>>,
    pub(super) mode: Option<&'a str>,
    pub(super) db: Option<&'a str>,
    pub(super) imp_user: Option<&'a str>,
}

impl<'a> BeginParameters<'a> {
    pub(crate) fn new(
        bookmarks: Option<&'a Bookmarks>,
        tx_timeout: Option<i64>,
        tx_metadata: Option<&'a HashMap<String, Value>>,
        mode: Option<&'a str>,
        db: Option<&'a str>,
        imp_user: Option<&'a str>,
    ) -> Self {
        Self {
            bookmarks,
            tx_timeout,
            tx_metadata,
            mode,
            db,
            imp_user,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RouteParameters<'a> {
    pub(super) routing_context: &'a HashMap<String, Value>,
    pub(super) bookmarks: Option<&'a Bookmarks>,
    pub(super) db: Option<&'a str>,
    pub(super) imp_user: Option<&'a str>,
}

impl<'a> RouteParameters<'a> {
    pub(crate) fn new(
        routing_context: &'a HashMap<String, Value>,
        bookmarks: Option<&'a Bookmarks>,
        db: Option<&'a str>,
        imp_user: Option<&'a str>,
    ) -> Self {
        Self {
            routing_context,
            bookmarks,
            db,
            imp_user,
        }
    }
}
