// Copyright 2020 Joyent, Inc.

//! reqtrack: resumable request tracking over a persistent connection
//!
//! Clients open a WebSocket connection (subprotocol `requests`), submit work
//! and later collect its result.  Work outlives the connection that
//! submitted it: results are kept in a durable store and can be fetched by
//! identifier from any connection, including one opened after a reconnect.
//!
//! Protocol definition
//!
//! Every application message is one JSON object in one frame.
//!
//! Client to server:
//!
//! * `{"data": <any>}`     submit new work.  The server replies with
//!                         `{"id": "<uuid>"}`.
//!
//! * `{"id": "<uuid>"}`    fetch an existing request.  An empty `id` is the
//!                         same as no `id`.  An optional `"type"` field
//!                         (`"new"` or `"fetch"`) overrides the
//!                         classification.
//!
//! Server to client:
//!
//! * `{"id": ..., "result": ...}`   the request is done.
//!
//! * `{"id": ..., "error": ...}`    the request failed, or for a fetch, the
//!                                  identifier is unknown
//!                                  (`"Request ID not found"`).
//!
//! * `{"id": ...}`                  acknowledgement of new work, or the
//!                                  request is still pending.
//!
//! * `{"pending": [...]}`           sent once right after the connection is
//!                                  established, if any request is pending.
//!
//! When a request submitted on a connection completes while that connection
//! is still open, its result is pushed without the client asking.
//!
//! Each connection is admitted through its own token bucket.  Messages over
//! the rate are delayed, not dropped.  A malformed message closes the
//! connection.

#![allow(missing_docs)]

use slog::{o, Drain, Logger};

pub mod client;
pub mod compute;
pub mod config;
pub mod dispatcher;
pub mod limiter;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;

pub use config::Config;
pub use server::Server;

/// The caller's logger, or one that forwards to the `log` crate.
pub(crate) fn logger_or_default(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}
