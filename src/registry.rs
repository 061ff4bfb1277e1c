// Copyright 2020 Joyent, Inc.

//! Sessions currently attached, as seen by the dispatcher.
//!
//! The dispatcher never owns a session.  It remembers which session
//! submitted a request and asks the registry to deliver the completion.  A
//! session that has closed is simply absent, so delivery becomes a no-op and
//! the result stays available by fetch.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::protocol::{RequestId, Response};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Attached {
    outbox: mpsc::UnboundedSender<Response>,
    waiting: HashSet<RequestId>,
}

#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Attached>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Attached>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new session.  It stays attached until the returned
    /// [`Attachment`] is dropped.
    pub fn attach(self: &Arc<Self>) -> Attachment {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbox, inbox) = mpsc::unbounded_channel();
        self.sessions().insert(
            id,
            Attached {
                outbox,
                waiting: HashSet::new(),
            },
        );

        Attachment {
            id,
            inbox,
            registry: Arc::clone(self),
        }
    }

    fn await_completion(&self, session: SessionId, id: RequestId) {
        if let Some(attached) = self.sessions().get_mut(&session) {
            attached.waiting.insert(id);
        }
    }

    /// Push `response` to `session` if it is still attached and still
    /// waiting on `id`.  Returns whether the response was queued.
    pub fn deliver(
        &self,
        session: SessionId,
        id: &RequestId,
        response: Response,
    ) -> bool {
        let mut sessions = self.sessions();
        let attached = match sessions.get_mut(&session) {
            Some(attached) => attached,
            None => return false,
        };
        if !attached.waiting.remove(id) {
            return false;
        }
        attached.outbox.send(response).is_ok()
    }

    pub fn attached(&self) -> usize {
        self.sessions().len()
    }

    fn waiting(&self, session: SessionId) -> usize {
        self.sessions()
            .get(&session)
            .map_or(0, |attached| attached.waiting.len())
    }

    fn detach(&self, session: SessionId) {
        self.sessions().remove(&session);
    }
}

/// A session's membership in the registry, and its inbox of pushed
/// completions.
pub struct Attachment {
    id: SessionId,
    inbox: mpsc::UnboundedReceiver<Response>,
    registry: Arc<SessionRegistry>,
}

impl Attachment {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Mark `id` as originated here so its completion is pushed to us.
    pub fn await_completion(&self, id: RequestId) {
        self.registry.await_completion(self.id, id);
    }

    /// Number of requests this session is still waiting on.
    pub fn waiting(&self) -> usize {
        self.registry.waiting(self.id)
    }

    /// Next pushed completion.
    pub async fn recv(&mut self) -> Option<Response> {
        self.inbox.recv().await
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.registry.detach(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_only_to_waiting_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let mut origin = registry.attach();
        let other = registry.attach();
        let id = RequestId::generate();

        origin.await_completion(id.clone());
        assert_eq!(origin.waiting(), 1);

        assert!(!registry.deliver(other.id(), &id, Response::pending(id.clone())));
        assert!(registry.deliver(origin.id(), &id, Response::pending(id.clone())));
        assert_eq!(origin.recv().await, Some(Response::pending(id.clone())));

        // The waiting entry is consumed by the first delivery.
        assert_eq!(origin.waiting(), 0);
        assert!(!registry.deliver(
            origin.id(),
            &id,
            Response::pending(id.clone())
        ));
    }

    #[test]
    fn dropped_sessions_detach() {
        let registry = Arc::new(SessionRegistry::new());
        let attachment = registry.attach();
        let session = attachment.id();
        let id = RequestId::generate();
        attachment.await_completion(id.clone());
        assert_eq!(registry.attached(), 1);

        drop(attachment);
        assert_eq!(registry.attached(), 0);
        assert!(!registry.deliver(session, &id, Response::pending(id.clone())));
    }

    #[test]
    fn session_ids_are_distinct() {
        let registry = Arc::new(SessionRegistry::new());
        let a = registry.attach();
        let b = registry.attach();
        assert_ne!(a.id(), b.id());
    }
}
