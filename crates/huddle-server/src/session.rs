//! Per-connection signaling state.
//!
//! A [`SignalingSession`] tracks one participant's side of a WebRTC
//! negotiation and owns the two candidate buffers that keep ordering
//! correct:
//!
//! - remote candidates addressed to this participant are held until a
//!   remote description has been handed to the transport, then applied in
//!   arrival order;
//! - candidates this participant produces are held until it has sent its
//!   own offer or answer.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, warn};

use huddle_shared::protocol::{IceCandidate, SessionDescription};
use huddle_shared::types::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    OfferSent,
    OfferReceived,
    Negotiating,
    Connected,
    Closed,
}

/// An offer or answer produced by another session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteDescription {
    Offer {
        from: SessionId,
        sender_name: String,
        description: SessionDescription,
    },
    Answer {
        from: SessionId,
        description: SessionDescription,
    },
}

/// Signaling traffic routed to a session by another session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSignal {
    Description(RemoteDescription),
    Candidate {
        from: SessionId,
        candidate: IceCandidate,
    },
}

/// A locally produced candidate ready to be routed to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCandidate {
    pub target: SessionId,
    pub candidate: IceCandidate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer connection closed")]
    Closed,

    #[error("peer is not keeping up")]
    Backpressure,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("cannot {action} while {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: SignalingState,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Where remote descriptions and candidates end up. Adding a candidate
/// before a remote description has been set is an error for real
/// transports, which is what the session's buffering prevents.
pub trait IceTransport {
    fn set_remote_description(&mut self, remote: &RemoteDescription) -> Result<(), TransportError>;

    fn add_ice_candidate(&mut self, from: SessionId, candidate: &IceCandidate) -> Result<(), TransportError>;
}

pub struct SignalingSession<T: IceTransport> {
    id: SessionId,
    state: SignalingState,
    transport: T,
    local_description: Option<SessionDescription>,
    remote_description: Option<RemoteDescription>,
    /// Remote candidates applied since the current remote description.
    applied_remote: usize,
    pending_remote: VecDeque<(SessionId, IceCandidate)>,
    pending_local: VecDeque<OutboundCandidate>,
}

impl<T: IceTransport> SignalingSession<T> {
    pub fn new(id: SessionId, transport: T) -> Self {
        Self {
            id,
            state: SignalingState::Idle,
            transport,
            local_description: None,
            remote_description: None,
            applied_remote: 0,
            pending_remote: VecDeque::new(),
            pending_local: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description.is_some()
    }

    pub fn pending_remote(&self) -> usize {
        self.pending_remote.len()
    }

    pub fn pending_local(&self) -> usize {
        self.pending_local.len()
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[cfg(test)]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state == SignalingState::Closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    // -- local side ----------------------------------------------------------

    /// Record our offer. Returns the local candidates that were waiting for
    /// a local description.
    pub fn send_offer(&mut self, description: SessionDescription) -> Result<Vec<OutboundCandidate>, SessionError> {
        self.ensure_open()?;
        self.local_description = Some(description);
        self.state = SignalingState::OfferSent;
        debug!(session = %self.id.short(), "offer sent");
        Ok(self.pending_local.drain(..).collect())
    }

    /// Record our answer to a received offer.
    pub fn send_answer(&mut self, description: SessionDescription) -> Result<Vec<OutboundCandidate>, SessionError> {
        self.ensure_open()?;
        if self.state != SignalingState::OfferReceived {
            return Err(SessionError::InvalidTransition {
                action: "answer",
                state: self.state,
            });
        }
        self.local_description = Some(description);
        self.state = if self.applied_remote > 0 {
            SignalingState::Connected
        } else {
            SignalingState::Negotiating
        };
        debug!(session = %self.id.short(), state = ?self.state, "answer sent");
        Ok(self.pending_local.drain(..).collect())
    }

    /// A candidate gathered locally. Returned for immediate routing once our
    /// description is out, queued otherwise.
    pub fn local_candidate(
        &mut self,
        target: SessionId,
        candidate: IceCandidate,
    ) -> Result<Option<OutboundCandidate>, SessionError> {
        self.ensure_open()?;
        let outbound = OutboundCandidate { target, candidate };
        if self.local_description.is_some() {
            Ok(Some(outbound))
        } else {
            self.pending_local.push_back(outbound);
            debug!(
                session = %self.id.short(),
                queued = self.pending_local.len(),
                "local candidate held until description is sent"
            );
            Ok(None)
        }
    }

    // -- remote side ---------------------------------------------------------

    pub fn receive(&mut self, signal: RemoteSignal) -> Result<(), SessionError> {
        self.ensure_open()?;
        match signal {
            RemoteSignal::Description(remote) => self.apply_remote_description(remote),
            RemoteSignal::Candidate { from, candidate } => {
                if self.remote_description.is_none() {
                    self.pending_remote.push_back((from, candidate));
                    debug!(
                        session = %self.id.short(),
                        queued = self.pending_remote.len(),
                        "remote candidate buffered until remote description"
                    );
                    return Ok(());
                }
                self.pending_remote.push_back((from, candidate));
                self.flush_remote()
            }
        }
    }

    fn apply_remote_description(&mut self, remote: RemoteDescription) -> Result<(), SessionError> {
        self.transport.set_remote_description(&remote)?;

        self.state = match remote {
            RemoteDescription::Offer { .. } => SignalingState::OfferReceived,
            RemoteDescription::Answer { .. } => SignalingState::Connected,
        };
        self.remote_description = Some(remote);
        self.applied_remote = 0;

        if !self.pending_remote.is_empty() {
            debug!(
                session = %self.id.short(),
                flushed = self.pending_remote.len(),
                "flushing buffered candidates"
            );
        }
        self.flush_remote()
    }

    /// Apply queued remote candidates front to back. A candidate the
    /// transport refuses goes back to the front, together with everything
    /// behind it, and is retried on the next flush.
    fn flush_remote(&mut self) -> Result<(), SessionError> {
        while let Some((from, candidate)) = self.pending_remote.pop_front() {
            if let Err(e) = self.apply_candidate(from, &candidate) {
                self.pending_remote.push_front((from, candidate));
                warn!(
                    session = %self.id.short(),
                    still_queued = self.pending_remote.len(),
                    error = %e,
                    "transport refused remote candidate"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    fn apply_candidate(&mut self, from: SessionId, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.transport.add_ice_candidate(from, candidate)?;
        self.applied_remote += 1;
        if self.state == SignalingState::Negotiating {
            self.state = SignalingState::Connected;
        }
        Ok(())
    }

    // -- teardown ------------------------------------------------------------

    /// Drop all call state. Buffered candidates are discarded.
    pub fn close(&mut self) {
        if self.state != SignalingState::Closed {
            debug!(
                session = %self.id.short(),
                discarded = self.pending_remote.len() + self.pending_local.len(),
                "signaling session closed"
            );
        }
        self.state = SignalingState::Closed;
        self.local_description = None;
        self.remote_description = None;
        self.applied_remote = 0;
        self.pending_remote.clear();
        self.pending_local.clear();
    }

    /// Make a closed session usable again after rejoining a channel.
    pub fn reopen(&mut self) {
        if self.state == SignalingState::Closed {
            self.state = SignalingState::Idle;
        }
    }
}
