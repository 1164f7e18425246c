//! Documents persisted by the store: users, groups with their embedded
//! channels, and channel messages.
//!
//! Field names follow the stored document layout (camelCase), so the same
//! structs serialize straight into the document store and onto the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, GroupId, MessageType, Permission, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    /// Unique across all users.
    pub username: String,
    /// Argon2 PHC string, never the plaintext.
    pub password: String,
    /// Unique across all users.
    pub email: String,
    pub first_name: String,
    pub surname: String,
    /// Path of the avatar image in file storage; empty when unset.
    #[serde(default)]
    pub avatar: String,
    pub permission: Permission,
    pub active: bool,
}

impl User {
    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot::from(self)
    }
}

/// Point-in-time copy of a [`User`] embedded in a role list or as a creator.
///
/// Snapshots are not refreshed when the user is later edited; they are
/// replaced only when a role-list mutation re-fetches the live user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub surname: String,
    #[serde(default)]
    pub avatar: String,
    pub permission: Permission,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl From<&User> for UserSnapshot {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            surname: user.surname.clone(),
            avatar: user.avatar.clone(),
            permission: user.permission,
            active: user.active,
        }
    }
}

// ---------------------------------------------------------------------------
// Role lists
// ---------------------------------------------------------------------------

/// A set of user snapshots, unique by username, kept in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RoleList(Vec<UserSnapshot>);

impl RoleList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn contains(&self, username: &str) -> bool {
        self.0.iter().any(|u| u.username == username)
    }

    pub fn get(&self, username: &str) -> Option<&UserSnapshot> {
        self.0.iter().find(|u| u.username == username)
    }

    /// Adds the snapshot unless a user with the same username is present.
    pub fn insert(&mut self, user: UserSnapshot) -> bool {
        if self.contains(&user.username) {
            return false;
        }
        self.0.push(user);
        true
    }

    pub fn remove(&mut self, username: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|u| u.username != username);
        self.0.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserSnapshot> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<UserSnapshot> for RoleList {
    fn from_iter<I: IntoIterator<Item = UserSnapshot>>(iter: I) -> Self {
        let mut list = RoleList::new();
        for user in iter {
            list.insert(user);
        }
        list
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// Which role list of a group a user currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRole {
    Admin,
    Member,
    Interested,
    Banned,
}

/// Top-level community. Owns its channels exclusively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    #[serde(rename = "groupName")]
    pub name: String,
    pub creator: UserSnapshot,
    #[serde(default)]
    pub admins: RoleList,
    #[serde(default)]
    pub members: RoleList,
    #[serde(default)]
    pub interested: RoleList,
    #[serde(default)]
    pub banned: RoleList,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

impl Group {
    /// New group with the creator seeded as its first admin.
    pub fn new(id: GroupId, name: impl Into<String>, creator: UserSnapshot) -> Self {
        let mut admins = RoleList::new();
        admins.insert(creator.clone());
        Self {
            id,
            name: name.into(),
            creator,
            admins,
            members: RoleList::new(),
            interested: RoleList::new(),
            banned: RoleList::new(),
            channels: Vec::new(),
        }
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.id == id)
    }

    pub fn role_of(&self, username: &str) -> Option<GroupRole> {
        if self.admins.contains(username) {
            Some(GroupRole::Admin)
        } else if self.members.contains(username) {
            Some(GroupRole::Member)
        } else if self.interested.contains(username) {
            Some(GroupRole::Interested)
        } else if self.banned.contains(username) {
            Some(GroupRole::Banned)
        } else {
            None
        }
    }

    fn list_mut(&mut self, role: GroupRole) -> &mut RoleList {
        match role {
            GroupRole::Admin => &mut self.admins,
            GroupRole::Member => &mut self.members,
            GroupRole::Interested => &mut self.interested,
            GroupRole::Banned => &mut self.banned,
        }
    }

    /// Removes the user from all four role lists. Returns `true` if any
    /// list changed.
    pub fn clear_role(&mut self, username: &str) -> bool {
        let mut changed = false;
        for role in [
            GroupRole::Admin,
            GroupRole::Member,
            GroupRole::Interested,
            GroupRole::Banned,
        ] {
            changed |= self.list_mut(role).remove(username);
        }
        changed
    }

    /// Places the user in exactly one role list, replacing any previous role.
    pub fn assign_role(&mut self, user: UserSnapshot, role: GroupRole) {
        self.clear_role(&user.username);
        self.list_mut(role).insert(user);
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Sub-room of a group with its own admin/member lists and message log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(rename = "channelName")]
    pub name: String,
    pub creator: UserSnapshot,
    #[serde(default)]
    pub admins: RoleList,
    #[serde(default)]
    pub members: RoleList,
    /// Append-only; order is the only message identity.
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Channel {
    pub fn new(id: ChannelId, name: impl Into<String>, creator: UserSnapshot) -> Self {
        let mut admins = RoleList::new();
        admins.insert(creator.clone());
        Self {
            id,
            name: name.into(),
            creator,
            admins,
            members: RoleList::new(),
            messages: Vec::new(),
        }
    }

    pub fn clear_role(&mut self, username: &str) -> bool {
        let a = self.admins.remove(username);
        let m = self.members.remove(username);
        a || m
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A chat message in a channel log. Image messages carry a URL in `message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub user_name: String,
    #[serde(default)]
    pub message_type: MessageType,
    pub message: String,
    #[serde(default)]
    pub avatar: String,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportedUser {
    pub id: i64,
    pub user: UserSnapshot,
    pub reason: String,
    pub date: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn snapshot(id: i64, username: &str, permission: Permission) -> UserSnapshot {
        UserSnapshot {
            id: UserId(id),
            username: username.to_string(),
            email: format!("{username}@example.com"),
            first_name: String::new(),
            surname: String::new(),
            avatar: String::new(),
            permission,
            active: true,
        }
    }

    #[test]
    fn role_list_is_unique_by_username() {
        let mut list = RoleList::new();
        assert!(list.insert(snapshot(1, "ana", Permission::ChatUser)));
        assert!(!list.insert(snapshot(99, "ana", Permission::ChatUser)));
        assert_eq!(list.len(), 1);
        assert!(list.remove("ana"));
        assert!(!list.remove("ana"));
    }

    #[test]
    fn assign_role_keeps_a_single_list() {
        let creator = snapshot(1, "owner", Permission::GroupAdmin);
        let mut group = Group::new(GroupId(1), "g", creator);
        let bob = snapshot(2, "bob", Permission::ChatUser);

        group.assign_role(bob.clone(), GroupRole::Interested);
        group.assign_role(bob.clone(), GroupRole::Member);
        group.assign_role(bob, GroupRole::Banned);

        assert_eq!(group.role_of("bob"), Some(GroupRole::Banned));
        assert!(!group.members.contains("bob"));
        assert!(!group.interested.contains("bob"));
        assert_eq!(group.banned.len(), 1);
    }

    #[test]
    fn group_document_layout() {
        let creator = snapshot(1, "owner", Permission::GroupAdmin);
        let mut group = Group::new(GroupId(3), "study", creator.clone());
        group
            .channels
            .push(Channel::new(ChannelId(4), "general", creator));

        let doc = serde_json::to_value(&group).unwrap();
        assert_eq!(doc["groupName"], "study");
        assert_eq!(doc["creator"]["firstName"], "");
        assert_eq!(doc["channels"][0]["channelName"], "general");
        assert_eq!(doc["admins"][0]["username"], "owner");
        assert!(doc["creator"].get("password").is_none());
    }

    #[test]
    fn missing_role_lists_default_to_empty() {
        let doc = serde_json::json!({
            "id": 1,
            "groupName": "legacy",
            "creator": { "id": 1, "username": "owner", "permission": "super-admin" }
        });
        let group: Group = serde_json::from_value(doc).unwrap();
        assert!(group.admins.is_empty());
        assert!(group.channels.is_empty());
        assert!(group.creator.active);
    }
}
