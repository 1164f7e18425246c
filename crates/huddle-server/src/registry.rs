use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use huddle_shared::protocol::ServerEvent;
use huddle_shared::types::{ChannelId, SessionId};

use crate::session::RemoteSignal;

/// Something delivered to a connection's mailbox.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Forward to the client as-is.
    Event(ServerEvent),
    /// Signaling traffic that must pass through the session's buffers.
    Signal(RemoteSignal),
}

#[derive(Default)]
struct Rooms {
    rooms: HashMap<ChannelId, HashSet<SessionId>>,
    mailboxes: HashMap<SessionId, mpsc::Sender<Dispatch>>,
}

/// Which live sessions are in which channel room.
///
/// A single lock guards both maps. Broadcasts copy the target mailboxes out
/// under the lock and deliver after releasing it, so delivery never
/// observes a room mid-mutation and a full mailbox never stalls the room.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<RwLock<Rooms>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a session addressable. Returns its mailbox.
    pub async fn register(&self, session: SessionId, capacity: usize) -> mpsc::Receiver<Dispatch> {
        let (tx, rx) = mpsc::channel::<Dispatch>(capacity.max(1));
        self.inner.write().await.mailboxes.insert(session, tx);
        rx
    }

    /// Forget a session entirely. Returns the rooms it was still in.
    pub async fn unregister(&self, session: SessionId) -> Vec<ChannelId> {
        let mut inner = self.inner.write().await;
        inner.mailboxes.remove(&session);

        let mut left = Vec::new();
        inner.rooms.retain(|channel, members| {
            if members.remove(&session) {
                left.push(*channel);
            }
            !members.is_empty()
        });
        left
    }

    /// Returns `false` if the session was already in the room.
    pub async fn join(&self, channel: ChannelId, session: SessionId) -> bool {
        let mut inner = self.inner.write().await;
        let members = inner.rooms.entry(channel).or_default();
        let added = members.insert(session);

        info!(
            %channel,
            session = %session.short(),
            participants = members.len(),
            "session joined channel room"
        );
        added
    }

    /// Leave a room. Empty rooms are removed.
    pub async fn leave(&self, channel: ChannelId, session: SessionId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(members) = inner.rooms.get_mut(&channel) else {
            return false;
        };
        let removed = members.remove(&session);
        let remaining = members.len();
        if remaining == 0 {
            inner.rooms.remove(&channel);
        }

        info!(
            %channel,
            session = %session.short(),
            participants = remaining,
            "session left channel room"
        );
        removed
    }

    /// Deliver to every session in the room except `exclude`. Returns how
    /// many mailboxes accepted the dispatch.
    pub async fn broadcast(&self, channel: ChannelId, dispatch: Dispatch, exclude: Option<SessionId>) -> usize {
        let targets: Vec<(SessionId, mpsc::Sender<Dispatch>)> = {
            let inner = self.inner.read().await;
            let Some(members) = inner.rooms.get(&channel) else {
                debug!(%channel, "broadcast to empty room");
                return 0;
            };
            members
                .iter()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| inner.mailboxes.get(id).map(|tx| (*id, tx.clone())))
                .collect()
        };
        deliver(targets, dispatch)
    }

    /// Deliver to every registered session except `exclude`.
    pub async fn broadcast_all(&self, dispatch: Dispatch, exclude: Option<SessionId>) -> usize {
        let targets: Vec<(SessionId, mpsc::Sender<Dispatch>)> = {
            let inner = self.inner.read().await;
            inner
                .mailboxes
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        deliver(targets, dispatch)
    }

    /// Point-to-point delivery. Returns `false` if the session is unknown or
    /// its mailbox is full.
    pub async fn send_to_session(&self, session: SessionId, dispatch: Dispatch) -> bool {
        let tx = self.inner.read().await.mailboxes.get(&session).cloned();
        match tx {
            Some(tx) => deliver(vec![(session, tx)], dispatch) == 1,
            None => {
                debug!(target = %session.short(), "no such session");
                false
            }
        }
    }

    pub async fn participants(&self, channel: ChannelId) -> Vec<SessionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(&channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.mailboxes.len()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }
}

fn deliver(targets: Vec<(SessionId, mpsc::Sender<Dispatch>)>, dispatch: Dispatch) -> usize {
    let mut delivered = 0;
    for (id, tx) in targets {
        if tx.try_send(dispatch.clone()).is_ok() {
            delivered += 1;
        } else {
            debug!(target = %id.short(), "Dropping dispatch for slow or closed session");
        }
    }
    delivered
}
