//! Relay router: turns one client's events into registry deliveries.
//!
//! Each websocket connection owns a [`Connection`]. Everything the client
//! sends goes through [`Connection::handle_text`]; everything other sessions
//! route to it arrives as a [`Dispatch`] on its mailbox and goes through
//! [`Connection::handle_dispatch`]. Offers, answers, and candidates pass
//! through the connection's [`SignalingSession`] so the client never sees a
//! candidate before the description it belongs to.
//!
//! The relay never answers a peer with an error. Invalid events are logged
//! and dropped.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use huddle_shared::error::AccessDenied;
use huddle_shared::models::{Message, UserSnapshot};
use huddle_shared::protocol::{
    AnswerRelay, CandidateRelay, ChatEvent, ClientEvent, IceCandidate, OfferRelay, ServerEvent,
};
use huddle_shared::roles::{self, AuthClass, Scope};
use huddle_shared::types::{ChannelId, SessionId};
use huddle_store::{MembershipStore, StoreError};

use crate::registry::{ChannelRegistry, Dispatch};
use crate::session::{
    IceTransport, OutboundCandidate, RemoteDescription, RemoteSignal, SessionError, SignalingSession,
    TransportError,
};

/// Shared by every connection.
#[derive(Clone)]
pub struct RelayContext {
    pub registry: ChannelRegistry,
    pub store: Arc<MembershipStore>,
    /// Also append relayed chat messages to the channel log.
    pub persist_messages: bool,
    pub mailbox: usize,
}

/// The client end of a connection, seen as an ICE transport: "applying" a
/// description or candidate means handing it to the client.
pub struct ClientSink {
    outbound: mpsc::Sender<ServerEvent>,
}

impl ClientSink {
    fn push(&self, event: ServerEvent) -> Result<(), TransportError> {
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

impl IceTransport for ClientSink {
    fn set_remote_description(&mut self, remote: &RemoteDescription) -> Result<(), TransportError> {
        let event = match remote {
            RemoteDescription::Offer {
                from,
                sender_name,
                description,
            } => ServerEvent::Offer(OfferRelay {
                sdp: description.sdp.clone(),
                kind: description.kind.clone(),
                sender_id: *from,
                sender_name: sender_name.clone(),
            }),
            RemoteDescription::Answer { description, .. } => ServerEvent::Answer(AnswerRelay {
                answer: description.clone(),
            }),
        };
        self.push(event)
    }

    fn add_ice_candidate(&mut self, _from: SessionId, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.push(ServerEvent::IceCandidate(CandidateRelay {
            candidate: candidate.clone(),
        }))
    }
}

pub struct Connection {
    id: SessionId,
    user: UserSnapshot,
    session: SignalingSession<ClientSink>,
    outbound: mpsc::Sender<ServerEvent>,
    registry: ChannelRegistry,
    persist: Option<Arc<MembershipStore>>,
    current: Option<ChannelId>,
}

impl Connection {
    /// Register a new session for an already authenticated user and greet
    /// the client with its id.
    pub async fn open(
        ctx: &RelayContext,
        user: UserSnapshot,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> (Self, mpsc::Receiver<Dispatch>) {
        let id = SessionId::new();
        let mailbox = ctx.registry.register(id, ctx.mailbox).await;

        let conn = Self {
            id,
            user,
            session: SignalingSession::new(
                id,
                ClientSink {
                    outbound: outbound.clone(),
                },
            ),
            outbound,
            registry: ctx.registry.clone(),
            persist: ctx.persist_messages.then(|| Arc::clone(&ctx.store)),
            current: None,
        };
        conn.push(ServerEvent::Session(id));
        info!(session = %id.short(), user = %conn.user.username, "relay connection opened");
        (conn, mailbox)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The room most recently joined and not yet left.
    pub fn current_channel(&self) -> Option<ChannelId> {
        self.current
    }

    fn push(&self, event: ServerEvent) {
        if self.outbound.try_send(event).is_err() {
            debug!(session = %self.id.short(), "client outbound full or closed, dropping event");
        }
    }

    pub async fn handle_text(&mut self, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => warn!(session = %self.id.short(), error = %e, "dropping invalid event"),
        }
    }

    pub async fn handle_event(&mut self, event: ClientEvent) {
        debug!(session = %self.id.short(), event = event.name(), "client event");
        match event {
            ClientEvent::JoinChannel(channel) => self.join(channel).await,
            ClientEvent::LeaveChannel(channel) => self.leave(channel).await,
            ClientEvent::Offer {
                description,
                channel_id,
                sender_name,
            } => {
                let flushed = match self.session.send_offer(description.clone()) {
                    Ok(flushed) => flushed,
                    Err(e) => return self.log_rejected("offer", e),
                };
                let offer = RemoteSignal::Description(RemoteDescription::Offer {
                    from: self.id,
                    sender_name,
                    description,
                });
                let reached = self
                    .registry
                    .broadcast(channel_id, Dispatch::Signal(offer), Some(self.id))
                    .await;
                debug!(session = %self.id.short(), channel = %channel_id, reached, "offer relayed");
                self.route_candidates(flushed).await;
            }
            ClientEvent::Answer {
                description,
                target,
            } => {
                let flushed = match self.session.send_answer(description.clone()) {
                    Ok(flushed) => flushed,
                    Err(e) => return self.log_rejected("answer", e),
                };
                let answer = RemoteSignal::Description(RemoteDescription::Answer {
                    from: self.id,
                    description,
                });
                if !self.registry.send_to_session(target, Dispatch::Signal(answer)).await {
                    debug!(session = %self.id.short(), target = %target.short(), "answer target unreachable");
                }
                self.route_candidates(flushed).await;
            }
            ClientEvent::IceCandidate { candidate, target } => {
                match self.session.local_candidate(target, candidate) {
                    Ok(Some(ready)) => self.route_candidates(vec![ready]).await,
                    Ok(None) => {}
                    Err(e) => self.log_rejected("ice-candidate", e),
                }
            }
            ClientEvent::Message(chat) => self.relay_message(chat).await,
        }
    }

    /// Something another session routed here.
    pub fn handle_dispatch(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Event(event) => self.push(event),
            Dispatch::Signal(signal) => match self.session.receive(signal) {
                Ok(()) => {}
                Err(SessionError::Closed) => {
                    debug!(session = %self.id.short(), "signal for closed session dropped");
                }
                Err(e) => warn!(session = %self.id.short(), error = %e, "failed to deliver signal"),
            },
        }
    }

    /// Implicit leave of every room, then one global disconnect notice.
    pub async fn close(mut self) {
        self.session.close();
        let rooms = self.registry.unregister(self.id).await;
        self.registry
            .broadcast_all(Dispatch::Event(ServerEvent::UserDisconnected(self.id)), None)
            .await;
        info!(session = %self.id.short(), rooms = rooms.len(), "relay connection closed");
    }

    async fn join(&mut self, channel: ChannelId) {
        self.registry.join(channel, self.id).await;
        self.session.reopen();
        self.current = Some(channel);
        self.registry
            .broadcast(
                channel,
                Dispatch::Event(ServerEvent::UserConnected(self.id)),
                Some(self.id),
            )
            .await;
    }

    async fn leave(&mut self, channel: ChannelId) {
        self.registry.leave(channel, self.id).await;
        self.session.close();
        if self.current == Some(channel) {
            self.current = None;
        }
        self.registry
            .broadcast(
                channel,
                Dispatch::Event(ServerEvent::UserDisconnected(self.id)),
                Some(self.id),
            )
            .await;
    }

    async fn route_candidates(&self, candidates: Vec<OutboundCandidate>) {
        for OutboundCandidate { target, candidate } in candidates {
            let signal = RemoteSignal::Candidate {
                from: self.id,
                candidate,
            };
            if !self.registry.send_to_session(target, Dispatch::Signal(signal)).await {
                debug!(session = %self.id.short(), target = %target.short(), "candidate target unreachable");
            }
        }
    }

    /// The sender fields a client puts on the wire are replaced by the
    /// connection's own user before anything is relayed or stored.
    async fn relay_message(&self, mut chat: ChatEvent) {
        let channel = chat.channel_id;
        chat.user_id = self.user.id;
        chat.user_name = self.user.username.clone();
        chat.avatar = self.user.avatar.clone();

        if let Some(store) = &self.persist {
            if !self.registry.participants(channel).await.contains(&self.id) {
                warn!(session = %self.id.short(), %channel, "not persisting message for a room never joined");
            } else {
                let store = Arc::clone(store);
                let user = self.user.clone();
                let message = Message::from(chat.clone());
                // Detached: the write finishes even if this connection goes away.
                tokio::spawn(async move {
                    if let Err(e) = persist_message(&store, &user, message).await {
                        warn!(%channel, user = %user.username, error = %e, "failed to persist relayed message");
                    }
                });
            }
        }
        self.registry
            .broadcast(channel, Dispatch::Event(ServerEvent::Message(chat)), None)
            .await;
    }

    fn log_rejected(&self, event: &'static str, err: SessionError) {
        warn!(session = %self.id.short(), event, error = %err, "signaling event rejected");
    }
}

#[derive(Debug, Error)]
enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Denied(#[from] AccessDenied),
}

/// Same participant check as the REST message endpoint, against the group
/// as it is now.
async fn persist_message(store: &MembershipStore, user: &UserSnapshot, message: Message) -> Result<(), PersistError> {
    let group = store
        .find_channel_group(message.channel_id)
        .await?
        .ok_or(StoreError::NotFound("channel"))?;
    let channel = group
        .channel(message.channel_id)
        .ok_or(StoreError::NotFound("channel"))?;
    roles::authorize(AuthClass::ChannelParticipant, user, Scope::Channel(&group, channel))?;
    store.append_message(group.id, message.channel_id, message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use huddle_shared::models::{Channel, Group, UserSnapshot};
    use huddle_shared::types::{MessageType, Permission, UserId};
    use huddle_store::MemoryStore;
    use serde_json::json;

    use crate::session::tests::{candidate, description};
    use crate::session::SignalingState;

    struct Peer {
        conn: Connection,
        mailbox: mpsc::Receiver<Dispatch>,
        outbound: mpsc::Receiver<ServerEvent>,
    }

    impl Peer {
        async fn connect(ctx: &RelayContext) -> Self {
            Self::connect_as(ctx, person(99, "guest")).await
        }

        async fn connect_as(ctx: &RelayContext, user: UserSnapshot) -> Self {
            let (tx, mut outbound) = mpsc::channel(64);
            let (conn, mailbox) = Connection::open(ctx, user, tx).await;
            assert!(matches!(outbound.try_recv(), Ok(ServerEvent::Session(id)) if id == conn.id()));
            Self { conn, mailbox, outbound }
        }

        /// Deliver everything queued in the mailbox, then return what the
        /// client would have received.
        fn pump(&mut self) -> Vec<ServerEvent> {
            while let Ok(dispatch) = self.mailbox.try_recv() {
                self.conn.handle_dispatch(dispatch);
            }
            let mut events = Vec::new();
            while let Ok(event) = self.outbound.try_recv() {
                events.push(event);
            }
            events
        }

        async fn send(&mut self, frame: serde_json::Value) {
            self.conn.handle_text(&frame.to_string()).await;
        }
    }

    fn person(id: i64, username: &str) -> UserSnapshot {
        UserSnapshot {
            id: UserId(id),
            username: username.into(),
            email: format!("{username}@example.com"),
            first_name: String::new(),
            surname: String::new(),
            avatar: format!("avatars/{username}.png"),
            permission: Permission::ChatUser,
            active: true,
        }
    }

    fn context(persist_messages: bool) -> RelayContext {
        RelayContext {
            registry: ChannelRegistry::new(),
            store: Arc::new(MembershipStore::new(Arc::new(MemoryStore::new()))),
            persist_messages,
            mailbox: 64,
        }
    }

    fn ice(target: SessionId, name: &str) -> serde_json::Value {
        json!({
            "event": "ice-candidate",
            "data": { "candidate": candidate(name), "senderId": target }
        })
    }

    #[tokio::test]
    async fn join_announces_to_the_rest_of_the_room() {
        let ctx = context(false);
        let mut a = Peer::connect(&ctx).await;
        let mut b = Peer::connect(&ctx).await;

        a.send(json!({ "event": "joinChannel", "data": 1 })).await;
        b.send(json!({ "event": "joinChannel", "data": 1 })).await;

        assert_eq!(a.pump(), vec![ServerEvent::UserConnected(b.conn.id())]);
        assert!(b.pump().is_empty());
        assert_eq!(b.conn.current_channel(), Some(ChannelId(1)));
    }

    #[tokio::test]
    async fn full_call_keeps_candidates_behind_descriptions() {
        let ctx = context(false);
        let mut a = Peer::connect(&ctx).await;
        let mut b = Peer::connect(&ctx).await;
        let (a_id, b_id) = (a.conn.id(), b.conn.id());
        a.send(json!({ "event": "joinChannel", "data": 5 })).await;
        b.send(json!({ "event": "joinChannel", "data": 5 })).await;
        a.pump();

        // A gathers a candidate before its offer is out: held locally.
        a.send(ice(b_id, "a1")).await;
        assert_eq!(a.conn.session.pending_local(), 1);

        let offer = description("offer");
        a.send(json!({
            "event": "offer",
            "data": { "sdp": offer.sdp, "type": "offer", "channelId": 5, "senderName": "ana" }
        }))
        .await;

        let received = b.pump();
        assert_eq!(received.len(), 2);
        assert!(matches!(&received[0], ServerEvent::Offer(o) if o.sender_id == a_id && o.sender_name == "ana"));
        assert!(matches!(&received[1], ServerEvent::IceCandidate(c) if c.candidate.candidate == "a1"));
        assert_eq!(b.conn.session.state(), SignalingState::OfferReceived);

        // B's candidate reaches A before B's answer does.
        b.send(ice(a_id, "b-early")).await;
        assert_eq!(b.conn.session.pending_local(), 1);
        b.send(json!({
            "event": "answer",
            "data": { "answer": description("answer"), "senderId": a_id }
        }))
        .await;
        ctx.registry
            .send_to_session(
                a_id,
                Dispatch::Signal(RemoteSignal::Candidate { from: b_id, candidate: candidate("b-late") }),
            )
            .await;

        let received = a.pump();
        assert!(matches!(&received[0], ServerEvent::Answer(_)));
        let names: Vec<_> = received[1..]
            .iter()
            .map(|e| match e {
                ServerEvent::IceCandidate(c) => c.candidate.candidate.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, ["b-early", "b-late"]);
        assert_eq!(a.conn.session.state(), SignalingState::Connected);
    }

    #[tokio::test]
    async fn candidate_routed_before_offer_is_buffered_by_the_receiver() {
        let ctx = context(false);
        let a = Peer::connect(&ctx).await;
        let mut b = Peer::connect(&ctx).await;

        let early = RemoteSignal::Candidate { from: a.conn.id(), candidate: candidate("x") };
        ctx.registry.send_to_session(b.conn.id(), Dispatch::Signal(early)).await;
        assert!(b.pump().is_empty());
        assert_eq!(b.conn.session.pending_remote(), 1);

        let offer = RemoteSignal::Description(RemoteDescription::Offer {
            from: a.conn.id(),
            sender_name: "ana".into(),
            description: description("offer"),
        });
        ctx.registry.send_to_session(b.conn.id(), Dispatch::Signal(offer)).await;

        let received = b.pump();
        assert!(matches!(received[0], ServerEvent::Offer(_)));
        assert!(matches!(received[1], ServerEvent::IceCandidate(_)));
    }

    #[tokio::test]
    async fn invalid_events_are_dropped() {
        let ctx = context(false);
        let mut a = Peer::connect(&ctx).await;
        let mut b = Peer::connect(&ctx).await;
        a.send(json!({ "event": "joinChannel", "data": 1 })).await;
        b.send(json!({ "event": "joinChannel", "data": 1 })).await;
        a.pump();

        a.conn.handle_text("{not json").await;
        a.send(json!({ "event": "offer", "data": { "type": "offer", "channelId": 1 } })).await;
        a.send(json!({
            "event": "ice-candidate",
            "data": { "candidate": { "candidate": "c", "sdpMid": null, "sdpMLineIndex": null }, "senderId": b.conn.id() }
        }))
        .await;

        assert!(b.pump().is_empty());
        assert_eq!(a.conn.session.state(), SignalingState::Idle);
    }

    #[tokio::test]
    async fn leave_closes_session_and_notifies_room() {
        let ctx = context(false);
        let mut a = Peer::connect(&ctx).await;
        let mut b = Peer::connect(&ctx).await;
        a.send(json!({ "event": "joinChannel", "data": 2 })).await;
        b.send(json!({ "event": "joinChannel", "data": 2 })).await;
        a.pump();

        b.send(ice(a.conn.id(), "queued")).await;
        b.send(json!({ "event": "leaveChannel", "data": 2 })).await;

        assert_eq!(a.pump(), vec![ServerEvent::UserDisconnected(b.conn.id())]);
        assert_eq!(b.conn.session.state(), SignalingState::Closed);
        assert_eq!(b.conn.session.pending_local(), 0);
        assert_eq!(b.conn.current_channel(), None);
        assert_eq!(ctx.registry.participants(ChannelId(2)).await, vec![a.conn.id()]);
    }

    #[tokio::test]
    async fn disconnect_notifies_everyone_once() {
        let ctx = context(false);
        let mut a = Peer::connect(&ctx).await;
        let mut c = Peer::connect(&ctx).await;
        let b = Peer::connect(&ctx).await;
        let b_id = b.conn.id();
        a.send(json!({ "event": "joinChannel", "data": 3 })).await;
        b.conn.registry.join(ChannelId(3), b_id).await;

        b.conn.close().await;

        assert_eq!(a.pump(), vec![ServerEvent::UserDisconnected(b_id)]);
        assert_eq!(c.pump(), vec![ServerEvent::UserDisconnected(b_id)]);
        assert_eq!(ctx.registry.session_count().await, 2);
        assert_eq!(ctx.registry.participants(ChannelId(3)).await, vec![a.conn.id()]);
    }

    /// Group owned by ana with one channel she created.
    async fn seed_channel(ctx: &RelayContext) -> (Group, Channel) {
        let mut owner = person(1, "ana");
        owner.permission = Permission::GroupAdmin;
        let group = ctx
            .store
            .insert_group_with({
                let owner = owner.clone();
                move |id| Group::new(id, "g", owner)
            })
            .await
            .unwrap();
        let channel = ctx
            .store
            .push_channel_with(group.id, move |id| Channel::new(id, "general", owner))
            .await
            .unwrap();
        (group, channel)
    }

    fn chat(channel: ChannelId, user_id: i64, user_name: &str, text: &str) -> serde_json::Value {
        json!({
            "event": "message",
            "data": {
                "channelId": channel, "userId": user_id, "userName": user_name,
                "messageType": "text", "message": text, "avatar": ""
            }
        })
    }

    async fn stored_messages(ctx: &RelayContext, group: &Group, expected: usize) -> Vec<Message> {
        let mut stored = Vec::new();
        for _ in 0..50 {
            stored = ctx.store.load_group(group.id).await.unwrap().channels[0].messages.clone();
            if stored.len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stored
    }

    #[tokio::test]
    async fn chat_reaches_sender_and_is_persisted_when_enabled() {
        let ctx = context(true);
        let (group, channel) = seed_channel(&ctx).await;

        let mut a = Peer::connect_as(&ctx, person(1, "ana")).await;
        a.send(json!({ "event": "joinChannel", "data": channel.id })).await;
        a.send(chat(channel.id, 1, "ana", "hello")).await;

        let received = a.pump();
        assert!(matches!(&received[..], [ServerEvent::Message(m)] if m.message == "hello"));

        let stored = stored_messages(&ctx, &group, 1).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message_type, MessageType::Text);
        assert_eq!(stored[0].user_name, "ana");
        assert_eq!(stored[0].avatar, "avatars/ana.png");
    }

    #[tokio::test]
    async fn forged_sender_is_rewritten_and_outsiders_are_not_persisted() {
        let ctx = context(true);
        let (group, channel) = seed_channel(&ctx).await;

        let mut mallory = Peer::connect_as(&ctx, person(9, "mallory")).await;
        mallory.send(json!({ "event": "joinChannel", "data": channel.id })).await;
        mallory.send(chat(channel.id, 1, "ana", "trust me")).await;

        let received = mallory.pump();
        assert!(matches!(
            &received[..],
            [ServerEvent::Message(m)] if m.user_id == UserId(9) && m.user_name == "mallory"
        ));

        // ana is a participant but never joined the room on this connection
        let mut ana = Peer::connect_as(&ctx, person(1, "ana")).await;
        ana.send(chat(channel.id, 1, "ana", "drive-by")).await;
        ana.pump();

        ana.send(json!({ "event": "joinChannel", "data": channel.id })).await;
        ana.send(chat(channel.id, 9, "mallory", "real")).await;

        let stored = stored_messages(&ctx, &group, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored_later = stored_messages(&ctx, &group, 1).await;
        assert_eq!(stored, stored_later);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message, "real");
        assert_eq!(stored[0].user_id, UserId(1));
        assert_eq!(stored[0].user_name, "ana");
    }
}
