use serde::{Deserialize, Serialize};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::ProtocolError;
use crate::models::Message;
use crate::types::{ChannelId, MessageType, SessionId, UserId};

// ---------------------------------------------------------------------------
// Signaling payloads
// ---------------------------------------------------------------------------

/// SDP session description (offer or answer)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// ICE candidate as produced by the browser
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Chat message relayed to a channel room
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub user_name: String,
    pub message_type: MessageType,
    pub message: String,
    pub avatar: String,
}

// ---------------------------------------------------------------------------
// Inbound (client -> relay)
// ---------------------------------------------------------------------------

/// Frames as they arrive on the wire. Every payload field is optional so
/// that missing data is reported as a validation error rather than a
/// parse failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
enum ClientFrame {
    #[serde(rename = "joinChannel")]
    JoinChannel(ChannelId),
    #[serde(rename = "leaveChannel")]
    LeaveChannel(ChannelId),
    #[serde(rename = "offer")]
    Offer(RawOffer),
    #[serde(rename = "answer")]
    Answer(RawAnswer),
    #[serde(rename = "ice-candidate")]
    IceCandidate(RawCandidate),
    #[serde(rename = "message")]
    Message(RawChat),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOffer {
    sdp: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    channel_id: Option<ChannelId>,
    sender_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawDescription {
    sdp: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnswer {
    answer: Option<RawDescription>,
    sender_id: Option<SessionId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIce {
    candidate: Option<String>,
    sdp_mid: Option<String>,
    sdp_m_line_index: Option<u16>,
    username_fragment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCandidate {
    candidate: Option<RawIce>,
    sender_id: Option<SessionId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChat {
    channel_id: Option<ChannelId>,
    user_id: Option<UserId>,
    user_name: Option<String>,
    message_type: Option<MessageType>,
    message: Option<String>,
    avatar: Option<String>,
}

/// A validated event from a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    JoinChannel(ChannelId),
    LeaveChannel(ChannelId),
    /// Broadcast to the rest of the room.
    Offer {
        description: SessionDescription,
        channel_id: ChannelId,
        sender_name: String,
    },
    /// Point-to-point to the offering session.
    Answer {
        description: SessionDescription,
        target: SessionId,
    },
    /// Point-to-point to the peer session.
    IceCandidate {
        candidate: IceCandidate,
        target: SessionId,
    },
    Message(ChatEvent),
}

fn required<T>(value: Option<T>, event: &'static str, field: &'static str) -> Result<T, ProtocolError> {
    value.ok_or(ProtocolError::MissingField { event, field })
}

fn non_empty(value: Option<String>, event: &'static str, field: &'static str) -> Result<String, ProtocolError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ProtocolError::MissingField { event, field }),
    }
}

impl ClientEvent {
    /// Parse and validate one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: ClientFrame =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::validate(frame)
    }

    fn validate(frame: ClientFrame) -> Result<Self, ProtocolError> {
        match frame {
            ClientFrame::JoinChannel(id) => Ok(ClientEvent::JoinChannel(id)),
            ClientFrame::LeaveChannel(id) => Ok(ClientEvent::LeaveChannel(id)),
            ClientFrame::Offer(raw) => Ok(ClientEvent::Offer {
                description: SessionDescription {
                    sdp: non_empty(raw.sdp, "offer", "sdp")?,
                    kind: non_empty(raw.kind, "offer", "type")?,
                },
                channel_id: required(raw.channel_id, "offer", "channelId")?,
                sender_name: raw.sender_name.unwrap_or_default(),
            }),
            ClientFrame::Answer(raw) => {
                let answer = required(raw.answer, "answer", "answer")?;
                Ok(ClientEvent::Answer {
                    description: SessionDescription {
                        sdp: non_empty(answer.sdp, "answer", "answer.sdp")?,
                        kind: non_empty(answer.kind, "answer", "answer.type")?,
                    },
                    target: required(raw.sender_id, "answer", "senderId")?,
                })
            }
            ClientFrame::IceCandidate(raw) => {
                let ice = required(raw.candidate, "ice-candidate", "candidate")?;
                if ice.sdp_mid.is_none() && ice.sdp_m_line_index.is_none() {
                    return Err(ProtocolError::UnroutableCandidate);
                }
                Ok(ClientEvent::IceCandidate {
                    candidate: IceCandidate {
                        candidate: required(ice.candidate, "ice-candidate", "candidate.candidate")?,
                        sdp_mid: ice.sdp_mid,
                        sdp_m_line_index: ice.sdp_m_line_index,
                        username_fragment: ice.username_fragment,
                    },
                    target: required(raw.sender_id, "ice-candidate", "senderId")?,
                })
            }
            ClientFrame::Message(raw) => {
                let message = non_empty(raw.message, "message", "message")?;
                if message.len() > MAX_MESSAGE_SIZE {
                    return Err(ProtocolError::Malformed(format!(
                        "message of {} bytes exceeds {MAX_MESSAGE_SIZE}",
                        message.len()
                    )));
                }
                Ok(ClientEvent::Message(ChatEvent {
                    channel_id: required(raw.channel_id, "message", "channelId")?,
                    user_id: required(raw.user_id, "message", "userId")?,
                    user_name: raw.user_name.unwrap_or_default(),
                    message_type: raw.message_type.unwrap_or_default(),
                    message,
                    avatar: raw.avatar.unwrap_or_default(),
                }))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinChannel(_) => "joinChannel",
            ClientEvent::LeaveChannel(_) => "leaveChannel",
            ClientEvent::Offer { .. } => "offer",
            ClientEvent::Answer { .. } => "answer",
            ClientEvent::IceCandidate { .. } => "ice-candidate",
            ClientEvent::Message(_) => "message",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound (relay -> client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfferRelay {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sender_id: SessionId,
    pub sender_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerRelay {
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateRelay {
    pub candidate: IceCandidate,
}

/// All events the relay sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// First frame on every connection: the id peers use to address it.
    #[serde(rename = "session")]
    Session(SessionId),
    #[serde(rename = "user-connected")]
    UserConnected(SessionId),
    #[serde(rename = "user-disconnected")]
    UserDisconnected(SessionId),
    #[serde(rename = "offer")]
    Offer(OfferRelay),
    #[serde(rename = "answer")]
    Answer(AnswerRelay),
    #[serde(rename = "ice-candidate")]
    IceCandidate(CandidateRelay),
    #[serde(rename = "message")]
    Message(ChatEvent),
}

impl From<ChatEvent> for Message {
    fn from(chat: ChatEvent) -> Self {
        Message {
            channel_id: chat.channel_id,
            user_id: chat.user_id,
            user_name: chat.user_name,
            message_type: chat.message_type,
            message: chat.message,
            avatar: chat.avatar,
        }
    }
}

impl ServerEvent {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_offer() {
        let text = json!({
            "event": "offer",
            "data": { "sdp": "v=0", "type": "offer", "channelId": 4, "senderName": "ana" }
        })
        .to_string();

        match ClientEvent::parse(&text).unwrap() {
            ClientEvent::Offer { description, channel_id, sender_name } => {
                assert_eq!(description.sdp, "v=0");
                assert_eq!(description.kind, "offer");
                assert_eq!(channel_id, ChannelId(4));
                assert_eq!(sender_name, "ana");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn offer_without_sdp_is_rejected() {
        let text = json!({ "event": "offer", "data": { "type": "offer", "channelId": 1 } }).to_string();
        assert_eq!(
            ClientEvent::parse(&text),
            Err(ProtocolError::MissingField { event: "offer", field: "sdp" })
        );
    }

    #[test]
    fn answer_requires_nested_type() {
        let target = SessionId::new();
        let text = json!({
            "event": "answer",
            "data": { "answer": { "sdp": "v=0" }, "senderId": target }
        })
        .to_string();
        assert_eq!(
            ClientEvent::parse(&text),
            Err(ProtocolError::MissingField { event: "answer", field: "answer.type" })
        );
    }

    #[test]
    fn candidate_without_mid_or_index_is_unroutable() {
        let text = json!({
            "event": "ice-candidate",
            "data": {
                "candidate": { "candidate": "candidate:1", "sdpMid": null, "sdpMLineIndex": null },
                "senderId": SessionId::new()
            }
        })
        .to_string();
        assert_eq!(ClientEvent::parse(&text), Err(ProtocolError::UnroutableCandidate));
    }

    #[test]
    fn candidate_with_index_only_is_accepted() {
        let target = SessionId::new();
        let text = json!({
            "event": "ice-candidate",
            "data": {
                "candidate": { "candidate": "candidate:1", "sdpMLineIndex": 0 },
                "senderId": target
            }
        })
        .to_string();
        match ClientEvent::parse(&text).unwrap() {
            ClientEvent::IceCandidate { candidate, target: t } => {
                assert_eq!(t, target);
                assert_eq!(candidate.sdp_m_line_index, Some(0));
                assert!(candidate.sdp_mid.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn join_channel_payload_is_bare_id() {
        let parsed = ClientEvent::parse(r#"{"event":"joinChannel","data":12}"#).unwrap();
        assert_eq!(parsed, ClientEvent::JoinChannel(ChannelId(12)));
    }

    #[test]
    fn unknown_event_is_malformed() {
        assert!(matches!(
            ClientEvent::parse(r#"{"event":"teleport","data":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(ClientEvent::parse("not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn chat_message_defaults_to_text() {
        let text = json!({
            "event": "message",
            "data": { "channelId": 2, "userId": 5, "userName": "bob", "message": "hi" }
        })
        .to_string();
        match ClientEvent::parse(&text).unwrap() {
            ClientEvent::Message(chat) => {
                assert_eq!(chat.message_type, MessageType::Text);
                assert_eq!(chat.avatar, "");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn outbound_offer_shape() {
        let sender = SessionId::new();
        let event = ServerEvent::Offer(OfferRelay {
            sdp: "v=0".into(),
            kind: "offer".into(),
            sender_id: sender,
            sender_name: "ana".into(),
        });
        let value: serde_json::Value = serde_json::from_str(&event.to_text().unwrap()).unwrap();
        assert_eq!(value["event"], "offer");
        assert_eq!(value["data"]["type"], "offer");
        assert_eq!(value["data"]["senderId"], sender.to_string());
        assert_eq!(value["data"]["senderName"], "ana");
    }
}
