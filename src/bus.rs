//! Routes progress events to the client session that started a download.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::progress::ProgressEvent;

/// Events a slow client may lag behind before newer ones are dropped.
const SESSION_BUFFER: usize = 64;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct Session {
    sender: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ProgressBus {
    sessions: Arc<DashMap<Uuid, Session>>,
    clock: Arc<dyn Clock>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl ProgressBus {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Opens a session under a fresh id. Dropping the subscription closes it.
    pub fn register(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(SESSION_BUFFER);
        self.sessions.insert(
            id,
            Session {
                sender,
                cancel: CancellationToken::new(),
                connected_at: self.now(),
            },
        );
        debug!(session = %id, "progress session registered");

        Subscription {
            id,
            receiver,
            bus: self.clone(),
        }
    }

    /// Removes a session and cancels every job tied to it.
    pub fn unregister(&self, session_id: Uuid) -> bool {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return false;
        };
        session.cancel.cancel();
        let connected_for = self.now() - session.connected_at;
        info!(
            session = %session_id,
            "progress session closed after {}s",
            connected_for.num_seconds()
        );
        true
    }

    /// Delivers at most once; returns false when the event was dropped.
    pub fn publish(&self, session_id: Uuid, event: ProgressEvent) -> bool {
        let Some(session) = self.sessions.get(&session_id) else {
            return false;
        };

        match session.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                debug!(
                    session = %session_id,
                    "client lagging, dropped progress {:.1}%",
                    event.percent
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// A token cancelled when the session disconnects, or `None` if it is not connected.
    pub fn cancellation(&self, session_id: Uuid) -> Option<CancellationToken> {
        self.sessions
            .get(&session_id)
            .map(|session| session.cancel.child_token())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

pub struct Subscription {
    id: Uuid,
    receiver: mpsc::Receiver<ProgressEvent>,
    bus: ProgressBus,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(self.id);
    }
}
