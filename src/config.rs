// Copyright 2020 Joyent, Inc.

use std::time::Duration;

/// WebSocket subprotocol clients are expected to negotiate.
pub const SUBPROTOCOL: &str = "requests";

/// Server tunables.  The defaults allow a burst of ten messages and then one
/// message every 100ms per connection.
#[derive(Clone, Debug)]
pub struct Config {
    /// Token bucket capacity per connection.
    pub bucket_capacity: u32,
    /// One token is added to the bucket per interval.
    pub refill_interval: Duration,
    /// Longest a message may wait for admission.
    pub admission_wait: Duration,
    /// Deadline for each store operation.
    pub store_timeout: Duration,
    /// Compute tasks allowed to run at once; the rest queue.
    pub max_concurrent_work: usize,
    /// Attempts to record a completion before giving up.
    pub complete_attempts: u32,
    pub retry_backoff: Duration,
    /// Subprotocol a client must offer, or `None` to accept any client.
    pub subprotocol: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bucket_capacity: 10,
            refill_interval: Duration::from_millis(100),
            admission_wait: Duration::from_secs(10),
            store_timeout: Duration::from_secs(10),
            max_concurrent_work: 64,
            complete_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            subprotocol: Some(SUBPROTOCOL.to_string()),
        }
    }
}
