use thiserror::Error;

use crate::roles::AuthClass;

/// A role check failed. Carries the class that was required.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unauthorised: {}", describe(.required))]
pub struct AccessDenied {
    pub required: AuthClass,
}

impl AccessDenied {
    pub fn new(required: AuthClass) -> Self {
        Self { required }
    }
}

fn describe(class: &AuthClass) -> &'static str {
    match class {
        AuthClass::AnyoneAuthenticated => "an active account is required",
        AuthClass::GroupMember => "you are not a member of this group",
        AuthClass::GroupAdminOrCreator => "only the group creator or an admin may do this",
        AuthClass::ChannelAdminOrCreator => "only the channel creator or an admin may do this",
        AuthClass::ChannelParticipant => "you do not have access to this channel",
        AuthClass::SuperAdminOnly => "only a super admin may do this",
        AuthClass::RequesterIsTarget => "you may only act on your own account",
    }
}

/// A relay event that is missing required fields or is malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Missing field '{field}' in '{event}' event")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },

    #[error("ICE candidate has neither sdpMid nor sdpMLineIndex")]
    UnroutableCandidate,
}
