// Copyright 2020 Joyent, Inc.

//! Runs submitted work off the connection's message path.
//!
//! Each dispatched request becomes one tracked task.  At most
//! `max_concurrent_work` of them run the compute routine at a time; the rest
//! wait for a permit.  A task always ends by moving its record out of
//! `pending`, with the result or with the reason the routine failed, and
//! then offers the completion to the session that submitted it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use slog::{debug, error, o, warn, Logger};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::compute::Compute;
use crate::config::Config;
use crate::protocol::{RequestId, Response};
use crate::registry::{SessionId, SessionRegistry};
use crate::store::{self, Completion, RequestStore, StoreError};

struct Inner {
    store: Arc<dyn RequestStore>,
    compute: Arc<dyn Compute>,
    registry: Arc<SessionRegistry>,
    permits: Semaphore,
    tracker: TaskTracker,
    store_timeout: Duration,
    complete_attempts: u32,
    retry_backoff: Duration,
    log: Logger,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RequestStore>,
        compute: Arc<dyn Compute>,
        registry: Arc<SessionRegistry>,
        config: &Config,
        log: Option<&Logger>,
    ) -> Dispatcher {
        let log = crate::logger_or_default(log)
            .new(o!("component" => "dispatcher"));
        Dispatcher {
            inner: Arc::new(Inner {
                store,
                compute,
                registry,
                permits: Semaphore::new(config.max_concurrent_work.max(1)),
                tracker: TaskTracker::new(),
                store_timeout: config.store_timeout,
                complete_attempts: config.complete_attempts.max(1),
                retry_backoff: config.retry_backoff,
                log,
            }),
        }
    }

    /// Start processing `id`.  Returns immediately; `origin` is offered the
    /// completion if it is still attached when the work finishes.
    pub fn dispatch(&self, origin: SessionId, id: RequestId, payload: Value) {
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(run(inner, origin, id, payload));
    }

    /// Tasks dispatched and not yet finished, queued ones included.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Wait for every dispatched task to finish.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

async fn run(inner: Arc<Inner>, origin: SessionId, id: RequestId, payload: Value) {
    let log = inner.log.new(o!("request_id" => id.to_string()));

    let completion = match inner.permits.acquire().await {
        Ok(_permit) => {
            debug!(log, "processing request");
            compute(Arc::clone(&inner.compute), payload).await
        }
        Err(e) => Completion::Failed(format!("worker pool closed: {}", e)),
    };
    if let Completion::Failed(reason) = &completion {
        warn!(log, "request failed"; "err" => reason.as_str());
    }

    if let Err(e) = record(&inner, &id, &completion, &log).await {
        error!(log, "failed to record completion"; "err" => %e);
        return;
    }

    let response = Response::completed(id.clone(), &completion);
    if inner.registry.deliver(origin, &id, response) {
        debug!(log, "pushed completion"; "session" => %origin);
    } else {
        debug!(log, "originating session gone, result left for fetch");
    }
}

/// Run the compute routine in its own task so that a panic in it is turned
/// into a failed completion like any other error.
async fn compute(compute: Arc<dyn Compute>, payload: Value) -> Completion {
    let handle = tokio::spawn(async move { compute.process(payload).await });
    match handle.await {
        Ok(Ok(result)) => Completion::Processed(result),
        Ok(Err(e)) => Completion::Failed(e.to_string()),
        Err(e) if e.is_panic() => {
            Completion::Failed(String::from("compute routine panicked"))
        }
        Err(e) => Completion::Failed(format!("compute routine aborted: {}", e)),
    }
}

async fn record(
    inner: &Inner,
    id: &RequestId,
    completion: &Completion,
    log: &Logger,
) -> Result<(), StoreError> {
    let mut attempt = 1;
    loop {
        let op = inner.store.complete(id, completion.clone());
        match store::bounded(inner.store_timeout, op).await {
            Ok(()) => return Ok(()),
            Err(e @ StoreError::Unavailable(_))
                if attempt < inner.complete_attempts =>
            {
                warn!(log, "store unavailable, retrying completion";
                      "attempt" => attempt, "err" => %e);
                tokio::time::sleep(inner.retry_backoff).await;
                attempt += 1;
            }
            // An attempt that timed out may still have been recorded.
            Err(StoreError::AlreadyCompleted(_)) if attempt > 1 => {
                return Ok(())
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::compute::{ComputeError, SimulatedCompute};
    use crate::store::{MemoryStore, RequestRecord, RequestStatus};

    struct Failing;

    #[async_trait]
    impl Compute for Failing {
        async fn process(&self, _: Value) -> Result<Value, ComputeError> {
            Err(ComputeError::new("backend exploded"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Compute for Panicking {
        async fn process(&self, _: Value) -> Result<Value, ComputeError> {
            panic!("compute bug")
        }
    }

    /// Records the highest number of concurrent calls it has seen.
    #[derive(Default)]
    struct Overlap {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Compute for Overlap {
        async fn process(&self, payload: Value) -> Result<Value, ComputeError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(payload)
        }
    }

    /// Rejects the first `failures` completions.
    struct Flaky {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl RequestStore for Flaky {
        async fn create(
            &self,
            id: &RequestId,
            payload: Value,
        ) -> Result<(), StoreError> {
            self.inner.create(id, payload).await
        }

        async fn complete(
            &self,
            id: &RequestId,
            completion: Completion,
        ) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("flaky".into()));
            }
            self.inner.complete(id, completion).await
        }

        async fn get(
            &self,
            id: &RequestId,
        ) -> Result<Option<RequestRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn list_pending(&self) -> Result<Vec<RequestId>, StoreError> {
            self.inner.list_pending().await
        }
    }

    /// Records the first completion but reports it as unavailable, like a
    /// write that lands after its deadline.
    struct LateAck {
        inner: MemoryStore,
        acked: AtomicBool,
    }

    #[async_trait]
    impl RequestStore for LateAck {
        async fn create(
            &self,
            id: &RequestId,
            payload: Value,
        ) -> Result<(), StoreError> {
            self.inner.create(id, payload).await
        }

        async fn complete(
            &self,
            id: &RequestId,
            completion: Completion,
        ) -> Result<(), StoreError> {
            self.inner.complete(id, completion).await?;
            if self.acked.swap(true, Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Unavailable("deadline passed".into()))
            }
        }

        async fn get(
            &self,
            id: &RequestId,
        ) -> Result<Option<RequestRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn list_pending(&self) -> Result<Vec<RequestId>, StoreError> {
            self.inner.list_pending().await
        }
    }

    fn dispatcher(
        store: Arc<dyn RequestStore>,
        compute: Arc<dyn Compute>,
        registry: Arc<SessionRegistry>,
        config: Config,
    ) -> Dispatcher {
        Dispatcher::new(store, compute, registry, &config, None)
    }

    async fn submit(store: &dyn RequestStore, payload: Value) -> RequestId {
        let id = RequestId::generate();
        store.create(&id, payload).await.unwrap();
        id
    }

    #[tokio::test]
    async fn completion_is_stored_and_pushed() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let compute = SimulatedCompute::new(Duration::from_millis(5));
        let d = dispatcher(
            store.clone(),
            Arc::new(compute),
            registry.clone(),
            Config::default(),
        );

        let mut session = registry.attach();
        let id = submit(store.as_ref(), json!("x")).await;
        session.await_completion(id.clone());
        d.dispatch(session.id(), id.clone(), json!("x"));

        let pushed = session.recv().await.unwrap();
        assert_eq!(pushed.id, id);
        assert_eq!(pushed.result, Some(json!("Processed: x")));

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Done);
    }

    #[tokio::test]
    async fn failures_and_panics_complete_with_error() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let session = registry.attach();

        let failing = dispatcher(
            store.clone(),
            Arc::new(Failing),
            registry.clone(),
            Config::default(),
        );
        let panicking = dispatcher(
            store.clone(),
            Arc::new(Panicking),
            registry.clone(),
            Config::default(),
        );

        let a = submit(store.as_ref(), json!(1)).await;
        let b = submit(store.as_ref(), json!(2)).await;
        failing.dispatch(session.id(), a.clone(), json!(1));
        panicking.dispatch(session.id(), b.clone(), json!(2));
        failing.shutdown().await;
        panicking.shutdown().await;

        let a = store.get(&a).await.unwrap().unwrap();
        assert_eq!(
            a.completion,
            Some(Completion::Failed("backend exploded".into()))
        );
        let b = store.get(&b).await.unwrap().unwrap();
        assert_eq!(
            b.completion,
            Some(Completion::Failed("compute routine panicked".into()))
        );
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_origin_leaves_result_for_fetch() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let compute = SimulatedCompute::new(Duration::from_millis(5));
        let d = dispatcher(
            store.clone(),
            Arc::new(compute),
            registry.clone(),
            Config::default(),
        );

        let session = registry.attach();
        let origin = session.id();
        let id = submit(store.as_ref(), json!("gone")).await;
        session.await_completion(id.clone());
        d.dispatch(origin, id.clone(), json!("gone"));
        drop(session);

        d.shutdown().await;
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(
            record.completion,
            Some(Completion::Processed(json!("Processed: gone")))
        );
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let overlap = Arc::new(Overlap::default());
        let config = Config {
            max_concurrent_work: 2,
            ..Config::default()
        };
        let d = dispatcher(store.clone(), overlap.clone(), registry.clone(), config);
        let session = registry.attach();

        for n in 0..8 {
            let id = submit(store.as_ref(), json!(n)).await;
            d.dispatch(session.id(), id, json!(n));
        }
        assert_eq!(d.in_flight(), 8);
        d.shutdown().await;

        assert_eq!(d.in_flight(), 0);
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 2);
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_store_is_retried() {
        let store = Arc::new(Flaky {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(2),
        });
        let registry = Arc::new(SessionRegistry::new());
        let compute = SimulatedCompute::new(Duration::from_millis(5));
        let d = dispatcher(
            store.clone(),
            Arc::new(compute),
            registry.clone(),
            Config::default(),
        );

        let id = submit(store.as_ref(), json!("x")).await;
        d.dispatch(registry.attach().id(), id.clone(), json!("x"));
        d.shutdown().await;

        let record = store.get(&id).await.unwrap().unwrap();
        assert!(record.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let store = Arc::new(Flaky {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(10),
        });
        let registry = Arc::new(SessionRegistry::new());
        let compute = SimulatedCompute::new(Duration::from_millis(5));
        let d = dispatcher(
            store.clone(),
            Arc::new(compute),
            registry.clone(),
            Config::default(),
        );

        let id = submit(store.as_ref(), json!("x")).await;
        d.dispatch(registry.attach().id(), id.clone(), json!("x"));
        d.shutdown().await;

        assert_eq!(store.failures.load(Ordering::SeqCst), 7);
        assert_eq!(store.list_pending().await.unwrap(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_recorded_late_is_still_pushed() {
        let store = Arc::new(LateAck {
            inner: MemoryStore::new(),
            acked: AtomicBool::new(false),
        });
        let registry = Arc::new(SessionRegistry::new());
        let compute = SimulatedCompute::new(Duration::from_millis(5));
        let d = dispatcher(
            store.clone(),
            Arc::new(compute),
            registry.clone(),
            Config::default(),
        );

        let mut session = registry.attach();
        let id = submit(store.as_ref(), json!("x")).await;
        session.await_completion(id.clone());
        d.dispatch(session.id(), id.clone(), json!("x"));

        let pushed = session.recv().await.unwrap();
        assert_eq!(pushed.result, Some(json!("Processed: x")));
        assert!(store.list_pending().await.unwrap().is_empty());
    }
}
