//! Authorization predicates over group and channel snapshots.
//!
//! Everything here is pure: callers load the current documents, ask whether
//! the requester may act, and only then mutate. A failed check is an
//! ordinary [`AccessDenied`] value, never a panic.

use crate::error::AccessDenied;
use crate::models::{Channel, Group, UserSnapshot};
use crate::types::{Permission, UserId};

/// Documents that record who created them.
pub trait Created {
    fn creator(&self) -> &UserSnapshot;
}

impl Created for Group {
    fn creator(&self) -> &UserSnapshot {
        &self.creator
    }
}

impl Created for Channel {
    fn creator(&self) -> &UserSnapshot {
        &self.creator
    }
}

pub fn is_super_admin(user: &UserSnapshot) -> bool {
    user.permission == Permission::SuperAdmin
}

pub fn is_creator<E: Created>(entity: &E, user: &UserSnapshot) -> bool {
    entity.creator().username == user.username
}

/// Creator, listed admin, or platform super-admin.
pub fn is_group_admin(group: &Group, user: &UserSnapshot) -> bool {
    is_creator(group, user) || group.admins.contains(&user.username) || is_super_admin(user)
}

/// Channel admin rights are implied by group admin rights, never the reverse.
pub fn is_channel_admin(channel: &Channel, group: &Group, user: &UserSnapshot) -> bool {
    channel.admins.contains(&user.username) || is_group_admin(group, user)
}

/// Admins retain member access; the creator is implicitly a member.
pub fn is_group_member(group: &Group, user: &UserSnapshot) -> bool {
    group.members.contains(&user.username)
        || group.admins.contains(&user.username)
        || is_creator(group, user)
}

pub fn is_channel_member(channel: &Channel, user: &UserSnapshot) -> bool {
    channel.members.contains(&user.username) || channel.admins.contains(&user.username)
}

/// Whether the user may read and post in a channel. A ban from the group
/// overrides any channel role, including channel creator.
pub fn can_use_channel(channel: &Channel, group: &Group, user: &UserSnapshot) -> bool {
    if group.banned.contains(&user.username) {
        return false;
    }
    is_channel_member(channel, user)
        || is_creator(channel, user)
        || is_channel_admin(channel, group, user)
}

/// Authorization classes attached to mutating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthClass {
    AnyoneAuthenticated,
    GroupMember,
    GroupAdminOrCreator,
    ChannelAdminOrCreator,
    ChannelParticipant,
    SuperAdminOnly,
    RequesterIsTarget,
}

/// What an operation acts on.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    Platform,
    Group(&'a Group),
    Channel(&'a Group, &'a Channel),
    Target(UserId),
}

/// Decide whether `actor` may perform an operation of `class` on `scope`.
///
/// A class that needs a group or channel but is given a narrower scope is
/// denied rather than silently widened.
pub fn authorize(class: AuthClass, actor: &UserSnapshot, scope: Scope<'_>) -> Result<(), AccessDenied> {
    let allowed = match (class, scope) {
        (AuthClass::AnyoneAuthenticated, _) => actor.active,
        (AuthClass::SuperAdminOnly, _) => is_super_admin(actor),
        (AuthClass::RequesterIsTarget, Scope::Target(id)) => actor.id == id,
        (AuthClass::GroupMember, Scope::Group(g) | Scope::Channel(g, _)) => {
            is_group_member(g, actor) || is_super_admin(actor)
        }
        (AuthClass::GroupAdminOrCreator, Scope::Group(g) | Scope::Channel(g, _)) => {
            is_group_admin(g, actor)
        }
        (AuthClass::ChannelAdminOrCreator, Scope::Channel(g, c)) => {
            is_channel_admin(c, g, actor) || is_creator(c, actor)
        }
        (AuthClass::ChannelParticipant, Scope::Channel(g, c)) => can_use_channel(c, g, actor),
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(AccessDenied::new(class))
    }
}
