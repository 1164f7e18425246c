//! Group and channel operations.
//!
//! Each operation loads the current group, asks [`roles::authorize`] whether
//! the actor may proceed, mutates the in-memory copy, and writes back only
//! the fields it touched. Role changes go through [`Group::assign_role`] or
//! [`Group::clear_role`], so a user never sits in two role lists of the same
//! group. Users embedded into a list are re-read from the users collection
//! first; existing snapshots are never refreshed.

use std::sync::Arc;

use tracing::info;

use huddle_shared::models::{Channel, Group, GroupRole, Message, UserSnapshot};
use huddle_shared::roles::{self, AuthClass, Scope};
use huddle_shared::types::{ChannelId, GroupId, MessageType, Permission};
use huddle_store::{GroupField, MembershipStore};

use crate::error::ApiError;

const ROLE_FIELDS: [GroupField; 4] = [
    GroupField::Admins,
    GroupField::Members,
    GroupField::Interested,
    GroupField::Banned,
];

const EVICTION_FIELDS: [GroupField; 5] = [
    GroupField::Admins,
    GroupField::Members,
    GroupField::Interested,
    GroupField::Banned,
    GroupField::Channels,
];

#[derive(Clone)]
pub struct GroupService {
    store: Arc<MembershipStore>,
}

impl GroupService {
    pub fn new(store: Arc<MembershipStore>) -> Self {
        Self { store }
    }

    async fn group(&self, id: GroupId) -> Result<Group, ApiError> {
        Ok(self.store.load_group(id).await?)
    }

    /// Live snapshot of a user, by username.
    async fn live_user(&self, username: &str) -> Result<UserSnapshot, ApiError> {
        self.store
            .load_user_by_name(username)
            .await?
            .map(|user| user.snapshot())
            .ok_or_else(|| ApiError::not_found("User"))
    }

    // -- groups --------------------------------------------------------------

    pub async fn create_group(&self, actor: &UserSnapshot, name: &str) -> Result<Group, ApiError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ApiError::validation("Missing groupName"));
        }
        if actor.permission == Permission::ChatUser {
            return Err(ApiError::Unauthorized(
                "Unauthorised: only group admins may create groups".into(),
            ));
        }

        let creator = actor.clone();
        let group = self
            .store
            .insert_group_with(move |id| Group::new(id, name, creator))
            .await?;
        info!(group = %group.id, creator = %actor.username, "group created");
        Ok(group)
    }

    pub async fn delete_group(&self, actor: &UserSnapshot, id: GroupId) -> Result<(), ApiError> {
        let group = self.group(id).await?;
        roles::authorize(AuthClass::GroupAdminOrCreator, actor, Scope::Group(&group))?;
        if !self.store.delete_group(id).await? {
            return Err(ApiError::not_found("Group"));
        }
        info!(group = %id, by = %actor.username, "group deleted");
        Ok(())
    }

    pub async fn list_groups(&self, actor: &UserSnapshot) -> Result<Vec<Group>, ApiError> {
        roles::authorize(AuthClass::AnyoneAuthenticated, actor, Scope::Platform)?;
        Ok(self.store.list_groups().await?)
    }

    pub async fn view_group(&self, actor: &UserSnapshot, id: GroupId) -> Result<Group, ApiError> {
        let group = self.group(id).await?;
        roles::authorize(AuthClass::GroupMember, actor, Scope::Group(&group))?;
        Ok(group)
    }

    // -- channels ------------------------------------------------------------

    pub async fn view_channel(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        channel_id: ChannelId,
    ) -> Result<(Group, Channel), ApiError> {
        let group = self.group(group_id).await?;
        let channel = find_channel(&group, channel_id)?.clone();
        roles::authorize(AuthClass::ChannelParticipant, actor, Scope::Channel(&group, &channel))?;
        Ok((group, channel))
    }

    pub async fn create_channel(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        name: &str,
    ) -> Result<Channel, ApiError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ApiError::validation("Missing channelName"));
        }
        let group = self.group(group_id).await?;
        roles::authorize(AuthClass::GroupAdminOrCreator, actor, Scope::Group(&group))?;

        let creator = actor.clone();
        let channel = self
            .store
            .push_channel_with(group_id, move |id| Channel::new(id, name, creator))
            .await?;
        info!(group = %group_id, channel = %channel.id, "channel created");
        Ok(channel)
    }

    pub async fn delete_channel(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        channel_id: ChannelId,
    ) -> Result<(), ApiError> {
        let group = self.group(group_id).await?;
        let channel = find_channel(&group, channel_id)?;
        roles::authorize(AuthClass::ChannelAdminOrCreator, actor, Scope::Channel(&group, channel))?;

        self.store.remove_channel(group_id, channel_id).await?;
        info!(group = %group_id, channel = %channel_id, "channel deleted");
        Ok(())
    }

    /// Self-join. Group admins join as channel admins, members as members.
    pub async fn add_channel_member(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        channel_id: ChannelId,
    ) -> Result<(Group, Channel), ApiError> {
        let mut group = self.group(group_id).await?;
        find_channel(&group, channel_id)?;
        roles::authorize(AuthClass::GroupMember, actor, Scope::Group(&group))?;

        let as_admin = roles::is_group_admin(&group, actor);
        let me = self.live_user(&actor.username).await?;
        let channel = group
            .channel_mut(channel_id)
            .ok_or_else(|| ApiError::not_found("Channel"))?;
        channel.clear_role(&me.username);
        if as_admin {
            channel.admins.insert(me);
        } else {
            channel.members.insert(me);
        }
        let channel = channel.clone();

        self.store.save_group(&group, &[GroupField::Channels]).await?;
        Ok((group, channel))
    }

    pub async fn leave_channel(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        channel_id: ChannelId,
    ) -> Result<(), ApiError> {
        let mut group = self.group(group_id).await?;
        let channel = group
            .channel_mut(channel_id)
            .ok_or_else(|| ApiError::not_found("Channel"))?;
        if roles::is_creator(&*channel, actor) {
            return Err(ApiError::validation("The channel creator cannot leave the channel"));
        }
        channel.clear_role(&actor.username);
        self.store.save_group(&group, &[GroupField::Channels]).await?;
        Ok(())
    }

    // -- messages ------------------------------------------------------------

    pub async fn add_message(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        channel_id: ChannelId,
        message_type: MessageType,
        text: &str,
    ) -> Result<Message, ApiError> {
        if text.is_empty() {
            return Err(ApiError::validation("Missing message"));
        }
        let group = self.group(group_id).await?;
        let channel = find_channel(&group, channel_id)?;
        roles::authorize(AuthClass::ChannelParticipant, actor, Scope::Channel(&group, channel))?;

        let message = Message {
            channel_id,
            user_id: actor.id,
            user_name: actor.username.clone(),
            message_type,
            message: text.to_string(),
            avatar: actor.avatar.clone(),
        };
        self.store
            .append_message(group_id, channel_id, message.clone())
            .await?;
        Ok(message)
    }

    pub async fn get_messages(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        channel_id: ChannelId,
    ) -> Result<Vec<Message>, ApiError> {
        let (_, channel) = self.view_channel(actor, group_id, channel_id).await?;
        Ok(channel.messages)
    }

    // -- group roles ---------------------------------------------------------

    pub async fn add_group_admin(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        username: &str,
    ) -> Result<(), ApiError> {
        let mut group = self.group(group_id).await?;
        roles::authorize(AuthClass::GroupAdminOrCreator, actor, Scope::Group(&group))?;
        let user = self.live_user(username).await?;
        if group.role_of(username) == Some(GroupRole::Admin) {
            return Err(ApiError::conflict("User is already an admin"));
        }
        group.assign_role(user, GroupRole::Admin);
        self.store.save_group(&group, &ROLE_FIELDS).await?;
        info!(group = %group_id, %username, "admin added");
        Ok(())
    }

    /// Demote an admin to member.
    pub async fn remove_admin(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        username: &str,
    ) -> Result<(), ApiError> {
        let mut group = self.group(group_id).await?;
        roles::authorize(AuthClass::GroupAdminOrCreator, actor, Scope::Group(&group))?;
        let Some(listed) = group.admins.get(username).cloned() else {
            return Err(ApiError::validation("User is not an admin"));
        };
        let user = match self.store.load_user_by_name(username).await? {
            Some(user) => user.snapshot(),
            None => listed,
        };
        group.assign_role(user, GroupRole::Member);
        self.store.save_group(&group, &ROLE_FIELDS).await?;
        Ok(())
    }

    pub async fn approve_registration(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        username: &str,
    ) -> Result<(), ApiError> {
        let mut group = self.group(group_id).await?;
        roles::authorize(AuthClass::GroupAdminOrCreator, actor, Scope::Group(&group))?;
        let user = self.live_user(username).await?;
        if matches!(group.role_of(username), Some(GroupRole::Member | GroupRole::Admin)) {
            return Err(ApiError::conflict("User is already a member"));
        }
        group.assign_role(user, GroupRole::Member);
        self.store.save_group(&group, &ROLE_FIELDS).await?;
        info!(group = %group_id, %username, "registration approved");
        Ok(())
    }

    pub async fn ban_user(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        username: &str,
    ) -> Result<(), ApiError> {
        let mut group = self.group(group_id).await?;
        roles::authorize(AuthClass::GroupAdminOrCreator, actor, Scope::Group(&group))?;
        if group.creator.username == username {
            return Err(ApiError::validation("The group creator cannot be banned"));
        }
        let user = self.live_user(username).await?;
        group.assign_role(user, GroupRole::Banned);
        drop_from_channels(&mut group, username);
        self.store.save_group(&group, &EVICTION_FIELDS).await?;
        info!(group = %group_id, %username, "user banned");
        Ok(())
    }

    /// Drop a user from every role list of the group and its channels.
    pub async fn remove_user(
        &self,
        actor: &UserSnapshot,
        group_id: GroupId,
        username: &str,
    ) -> Result<(), ApiError> {
        let mut group = self.group(group_id).await?;
        roles::authorize(AuthClass::GroupAdminOrCreator, actor, Scope::Group(&group))?;
        group.clear_role(username);
        drop_from_channels(&mut group, username);
        self.store.save_group(&group, &EVICTION_FIELDS).await?;
        Ok(())
    }

    // -- self-service --------------------------------------------------------

    /// Ask to join. Banned users must be approved by an admin instead.
    pub async fn register(&self, actor: &UserSnapshot, group_id: GroupId) -> Result<(), ApiError> {
        let mut group = self.group(group_id).await?;
        roles::authorize(AuthClass::RequesterIsTarget, actor, Scope::Target(actor.id))?;
        match group.role_of(&actor.username) {
            Some(GroupRole::Banned) => {
                return Err(ApiError::Unauthorized(
                    "Unauthorised: you are banned from this group".into(),
                ))
            }
            Some(GroupRole::Admin | GroupRole::Member) => {
                return Err(ApiError::conflict("User is already a member"))
            }
            Some(GroupRole::Interested) => return Ok(()),
            None if roles::is_creator(&group, actor) => {
                return Err(ApiError::conflict("User is already a member"))
            }
            None => {}
        }
        let me = self.live_user(&actor.username).await?;
        group.assign_role(me, GroupRole::Interested);
        self.store.save_group(&group, &ROLE_FIELDS).await?;
        Ok(())
    }

    pub async fn deregister(&self, actor: &UserSnapshot, group_id: GroupId) -> Result<(), ApiError> {
        let mut group = self.group(group_id).await?;
        roles::authorize(AuthClass::RequesterIsTarget, actor, Scope::Target(actor.id))?;
        if group.interested.remove(&actor.username) {
            self.store.save_group(&group, &[GroupField::Interested]).await?;
        }
        Ok(())
    }

    pub async fn leave_group(&self, actor: &UserSnapshot, group_id: GroupId) -> Result<(), ApiError> {
        let mut group = self.group(group_id).await?;
        roles::authorize(AuthClass::RequesterIsTarget, actor, Scope::Target(actor.id))?;
        let was_admin = group.admins.remove(&actor.username);
        let was_member = group.members.remove(&actor.username);
        if was_admin || was_member {
            self.store
                .save_group(&group, &[GroupField::Admins, GroupField::Members])
                .await?;
        }
        Ok(())
    }
}

fn find_channel(group: &Group, id: ChannelId) -> Result<&Channel, ApiError> {
    group.channel(id).ok_or_else(|| ApiError::not_found("Channel"))
}

fn drop_from_channels(group: &mut Group, username: &str) {
    for channel in &mut group.channels {
        channel.clear_role(username);
    }
}
