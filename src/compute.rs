// Copyright 2020 Joyent, Inc.

//! The routine that turns a request payload into a result.
//!
//! The dispatcher treats it as opaque: it may take arbitrarily long and it
//! may fail.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ComputeError(String);

impl ComputeError {
    pub fn new<S: Into<String>>(reason: S) -> ComputeError {
        ComputeError(reason.into())
    }
}

#[async_trait]
pub trait Compute: Send + Sync {
    async fn process(&self, payload: Value) -> Result<Value, ComputeError>;
}

/// Stand-in for real work: sleeps, then answers `"Processed: <data>"`.
#[derive(Clone, Debug)]
pub struct SimulatedCompute {
    delay: Duration,
    jitter: Duration,
}

impl SimulatedCompute {
    pub fn new(delay: Duration) -> SimulatedCompute {
        SimulatedCompute {
            delay,
            jitter: Duration::from_secs(0),
        }
    }

    /// Add up to `jitter` of random extra delay to each request.
    pub fn with_jitter(mut self, jitter: Duration) -> SimulatedCompute {
        self.jitter = jitter;
        self
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            self.delay
        } else {
            let extra = rand::thread_rng().gen_range(0..=jitter_ms);
            self.delay + Duration::from_millis(extra)
        }
    }
}

/// Render a payload the way it is echoed in a result: strings bare, anything
/// else as compact JSON.
pub fn describe(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Compute for SimulatedCompute {
    async fn process(&self, payload: Value) -> Result<Value, ComputeError> {
        tokio::time::sleep(self.next_delay()).await;
        Ok(Value::String(format!("Processed: {}", describe(&payload))))
    }
}
