//! Async membership adapter over a [`DocumentStore`].
//!
//! This is the only component that touches durable storage. Every call is
//! moved onto the blocking pool and bounded by a timeout, so a stalled store
//! surfaces as [`StoreError::Timeout`] instead of hanging the caller. Writes
//! already handed to the blocking pool are left to finish after a timeout.
//!
//! Group and channel ids are `1 + max(id)`; channel ids are global across
//! every group. Issuance and the matching insert run under one sequence
//! lock, so two concurrent creators can never draw the same id.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use huddle_shared::constants::{
    CHANNELS_COLLECTION, GROUPS_COLLECTION, REPORTED_USERS_COLLECTION, USERS_COLLECTION,
};
use huddle_shared::models::{Channel, Group, Message, ReportedUser, User};
use huddle_shared::types::{ChannelId, GroupId, UserId};

use crate::document::{DocumentStore, Filter, Update};
use crate::error::{Result, StoreError};

/// Default bound on a single store call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of times the user purge cascade is attempted.
pub const DEFAULT_CASCADE_ATTEMPTS: u32 = 3;

/// Top-level group fields that [`MembershipStore::save_group`] can replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupField {
    Admins,
    Members,
    Interested,
    Banned,
    Channels,
}

impl GroupField {
    fn key(self) -> &'static str {
        match self {
            GroupField::Admins => "admins",
            GroupField::Members => "members",
            GroupField::Interested => "interested",
            GroupField::Banned => "banned",
            GroupField::Channels => "channels",
        }
    }
}

/// What a completed purge cascade changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub groups_deleted: u64,
    pub groups_modified: u64,
}

pub struct MembershipStore {
    docs: Arc<dyn DocumentStore>,
    timeout: Duration,
    cascade_attempts: u32,
    sequence: Mutex<()>,
}

impl MembershipStore {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self {
            docs,
            timeout: DEFAULT_TIMEOUT,
            cascade_attempts: DEFAULT_CASCADE_ATTEMPTS,
            sequence: Mutex::new(()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cascade_attempts(mut self, attempts: u32) -> Self {
        self.cascade_attempts = attempts.max(1);
        self
    }

    /// Run a synchronous store closure on the blocking pool, bounded by the
    /// configured timeout.
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DocumentStore) -> Result<T> + Send + 'static,
    {
        let docs = Arc::clone(&self.docs);
        let task = tokio::task::spawn_blocking(move || f(docs.as_ref()));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(StoreError::Task(join.to_string())),
            Err(_) => {
                tracing::warn!(op, timeout_ms = self.timeout.as_millis() as u64, "store call timed out");
                Err(StoreError::Timeout {
                    op,
                    millis: self.timeout.as_millis(),
                })
            }
        }
    }

    // -- ids -----------------------------------------------------------------

    /// Next id for a collection. `channels` is the pseudo-collection of every
    /// channel embedded in every group.
    pub async fn next_id(&self, collection: &str) -> Result<i64> {
        let collection = collection.to_string();
        self.run("next_id", move |docs| next_id_in(docs, &collection))
            .await
    }

    // -- groups --------------------------------------------------------------

    pub async fn load_group(&self, id: GroupId) -> Result<Group> {
        self.run("load_group", move |docs| {
            let doc = docs
                .find_one(GROUPS_COLLECTION, &Filter::by_id(id.0))?
                .ok_or(StoreError::NotFound("group"))?;
            Ok(serde_json::from_value(doc)?)
        })
        .await
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        self.run("list_groups", |docs| {
            docs.find(GROUPS_COLLECTION, &Filter::All)?
                .into_iter()
                .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    /// Draw the next group id and insert the group `build` produces for it.
    pub async fn insert_group_with<F>(&self, build: F) -> Result<Group>
    where
        F: FnOnce(GroupId) -> Group + Send + 'static,
    {
        let _seq = self.sequence.lock().await;
        let group = self
            .run("insert_group", move |docs| {
                let group = build(GroupId(next_id_in(docs, GROUPS_COLLECTION)?));
                docs.insert_one(GROUPS_COLLECTION, serde_json::to_value(&group)?)?;
                Ok(group)
            })
            .await?;
        tracing::debug!(group = %group.id, "group inserted");
        Ok(group)
    }

    /// Replace only the named fields of a stored group. No version check:
    /// the last writer wins.
    pub async fn save_group(&self, group: &Group, fields: &[GroupField]) -> Result<()> {
        let id = group.id;
        let doc = serde_json::to_value(group)?;
        let set: Vec<(String, Value)> = fields
            .iter()
            .map(|field| {
                let key = field.key();
                (key.to_string(), doc.get(key).cloned().unwrap_or(Value::Null))
            })
            .collect();

        self.run("save_group", move |docs| {
            let result = docs.update_one(GROUPS_COLLECTION, &Filter::by_id(id.0), &Update::Set(set))?;
            if result.matched == 0 {
                return Err(StoreError::NotFound("group"));
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_group(&self, id: GroupId) -> Result<bool> {
        self.run("delete_group", move |docs| {
            Ok(docs.delete_one(GROUPS_COLLECTION, &Filter::by_id(id.0))? > 0)
        })
        .await
    }

    /// Draw the next global channel id and append the channel `build`
    /// produces to the group.
    pub async fn push_channel_with<F>(&self, group: GroupId, build: F) -> Result<Channel>
    where
        F: FnOnce(ChannelId) -> Channel + Send + 'static,
    {
        let _seq = self.sequence.lock().await;
        let channel = self
            .run("push_channel", move |docs| {
                let channel = build(ChannelId(next_id_in(docs, CHANNELS_COLLECTION)?));
                let push = Update::Push {
                    field: "channels".into(),
                    value: serde_json::to_value(&channel)?,
                };
                let result = docs.update_one(GROUPS_COLLECTION, &Filter::by_id(group.0), &push)?;
                if result.matched == 0 {
                    return Err(StoreError::NotFound("group"));
                }
                Ok(channel)
            })
            .await?;
        tracing::debug!(%group, channel = %channel.id, "channel inserted");
        Ok(channel)
    }

    pub async fn remove_channel(&self, group: GroupId, channel: ChannelId) -> Result<bool> {
        self.run("remove_channel", move |docs| {
            let pull = Update::Pull {
                field: "channels".into(),
                matching: Filter::by_id(channel.0),
            };
            let result = docs.update_one(GROUPS_COLLECTION, &Filter::by_id(group.0), &pull)?;
            if result.matched == 0 {
                return Err(StoreError::NotFound("group"));
            }
            Ok(result.modified > 0)
        })
        .await
    }

    /// The group embedding a channel, if any.
    pub async fn find_channel_group(&self, channel: ChannelId) -> Result<Option<Group>> {
        self.run("find_channel_group", move |docs| {
            docs.find_one(GROUPS_COLLECTION, &Filter::eq("channels.id", channel.0))?
                .map(serde_json::from_value)
                .transpose()
                .map_err(StoreError::from)
        })
        .await
    }

    /// Append to a channel's message log (read, push, write back `channels`).
    pub async fn append_message(&self, group: GroupId, channel: ChannelId, message: Message) -> Result<()> {
        self.run("append_message", move |docs| {
            let doc = docs
                .find_one(GROUPS_COLLECTION, &Filter::by_id(group.0))?
                .ok_or(StoreError::NotFound("group"))?;
            let mut stored: Group = serde_json::from_value(doc)?;
            stored
                .channel_mut(channel)
                .ok_or(StoreError::NotFound("channel"))?
                .messages
                .push(message);

            docs.update_one(
                GROUPS_COLLECTION,
                &Filter::by_id(group.0),
                &Update::set("channels", serde_json::to_value(&stored.channels)?),
            )?;
            Ok(())
        })
        .await
    }

    // -- users ---------------------------------------------------------------

    pub async fn load_user(&self, id: UserId) -> Result<Option<User>> {
        self.find_user("load_user", Filter::by_id(id.0)).await
    }

    pub async fn load_user_by_name(&self, username: &str) -> Result<Option<User>> {
        self.find_user("load_user_by_name", Filter::eq("username", username))
            .await
    }

    async fn find_user(&self, op: &'static str, filter: Filter) -> Result<Option<User>> {
        self.run(op, move |docs| {
            docs.find_one(USERS_COLLECTION, &filter)?
                .map(serde_json::from_value)
                .transpose()
                .map_err(StoreError::from)
        })
        .await
    }

    /// Another user already holding `username` or `email`.
    pub async fn find_user_conflict(
        &self,
        username: &str,
        email: &str,
        exclude: Option<UserId>,
    ) -> Result<Option<User>> {
        let filter = Filter::Or(vec![
            Filter::eq("username", username),
            Filter::eq("email", email),
        ]);
        let users = self
            .run("find_user_conflict", move |docs| docs.find(USERS_COLLECTION, &filter))
            .await?;

        for doc in users {
            let user: User = serde_json::from_value(doc)?;
            if Some(user.id) != exclude {
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    pub async fn insert_user_with<F>(&self, build: F) -> Result<User>
    where
        F: FnOnce(UserId) -> User + Send + 'static,
    {
        let _seq = self.sequence.lock().await;
        self.run("insert_user", move |docs| {
            let user = build(UserId(next_id_in(docs, USERS_COLLECTION)?));
            docs.insert_one(USERS_COLLECTION, serde_json::to_value(&user)?)?;
            Ok(user)
        })
        .await
    }

    /// Overwrite every stored field of the user.
    pub async fn save_user(&self, user: &User) -> Result<()> {
        let id = user.id;
        let set = match serde_json::to_value(user)? {
            Value::Object(map) => map.into_iter().filter(|(k, _)| k != "id").collect(),
            _ => Vec::new(),
        };
        self.run("save_user", move |docs| {
            let result = docs.update_one(USERS_COLLECTION, &Filter::by_id(id.0), &Update::Set(set))?;
            if result.matched == 0 {
                return Err(StoreError::NotFound("user"));
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_user(&self, id: UserId) -> Result<bool> {
        self.run("delete_user", move |docs| {
            Ok(docs.delete_one(USERS_COLLECTION, &Filter::by_id(id.0))? > 0)
        })
        .await
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.run("list_users", |docs| {
            docs.find(USERS_COLLECTION, &Filter::All)?
                .into_iter()
                .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    pub async fn users_empty(&self) -> Result<bool> {
        self.run("users_empty", |docs| {
            Ok(docs.find_one(USERS_COLLECTION, &Filter::All)?.is_none())
        })
        .await
    }

    /// Remove every trace of a user from the group documents.
    ///
    /// Groups the user created are deleted; in the rest the user leaves every
    /// role list; channels the user created are removed; in the remaining
    /// channels the user leaves admins and members. Each step is idempotent,
    /// so on failure the whole cascade is re-run from the start.
    pub async fn purge_user(&self, user: UserId) -> Result<PurgeOutcome> {
        let mut last = String::new();
        for attempt in 1..=self.cascade_attempts {
            match self.run("purge_user", move |docs| cascade(docs, user)).await {
                Ok(outcome) => {
                    tracing::info!(
                        %user,
                        attempt,
                        groups_deleted = outcome.groups_deleted,
                        groups_modified = outcome.groups_modified,
                        "user purged from groups"
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    tracing::warn!(%user, attempt, error = %e, "purge cascade failed; retrying");
                    last = e.to_string();
                }
            }
        }
        Err(StoreError::CascadeFailed {
            user: user.0,
            attempts: self.cascade_attempts,
            last,
        })
    }

    // -- reports -------------------------------------------------------------

    pub async fn insert_report_with<F>(&self, build: F) -> Result<ReportedUser>
    where
        F: FnOnce(i64) -> ReportedUser + Send + 'static,
    {
        let _seq = self.sequence.lock().await;
        self.run("insert_report", move |docs| {
            let report = build(next_id_in(docs, REPORTED_USERS_COLLECTION)?);
            docs.insert_one(REPORTED_USERS_COLLECTION, serde_json::to_value(&report)?)?;
            Ok(report)
        })
        .await
    }

    pub async fn list_reports(&self) -> Result<Vec<ReportedUser>> {
        self.run("list_reports", |docs| {
            docs.find(REPORTED_USERS_COLLECTION, &Filter::All)?
                .into_iter()
                .map(|doc| serde_json::from_value(doc).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    /// Dismiss the oldest report about a user.
    pub async fn delete_report_for(&self, user: UserId) -> Result<bool> {
        self.run("delete_report", move |docs| {
            Ok(docs.delete_one(REPORTED_USERS_COLLECTION, &Filter::eq("user.id", user.0))? > 0)
        })
        .await
    }
}

fn next_id_in(docs: &dyn DocumentStore, collection: &str) -> Result<i64> {
    let max = if collection == CHANNELS_COLLECTION {
        docs.find(GROUPS_COLLECTION, &Filter::All)?
            .iter()
            .filter_map(|group| group.get("channels")?.as_array())
            .flatten()
            .filter_map(|channel| channel.get("id")?.as_i64())
            .max()
    } else {
        docs.max_id(collection)?
    };
    Ok(max.map_or(1, |m| m + 1))
}

fn cascade(docs: &dyn DocumentStore, user: UserId) -> Result<PurgeOutcome> {
    let uid = user.0;
    let by_user = || Filter::eq("id", uid);
    let created_by_user = || Filter::eq("creator.id", uid);

    let groups_deleted = docs.delete_many(GROUPS_COLLECTION, &created_by_user())?;

    // Counted up front so a group touched by several steps is counted once.
    let referencing = Filter::Or(
        [
            "admins.id",
            "members.id",
            "interested.id",
            "banned.id",
            "channels.creator.id",
            "channels.admins.id",
            "channels.members.id",
        ]
        .into_iter()
        .map(|path| Filter::eq(path, uid))
        .collect(),
    );
    let groups_modified = docs.find(GROUPS_COLLECTION, &referencing)?.len() as u64;

    let pull_roles = Update::Batch(
        ["admins", "members", "interested", "banned"]
            .into_iter()
            .map(|field| Update::Pull {
                field: field.into(),
                matching: by_user(),
            })
            .collect(),
    );
    docs.update_many(GROUPS_COLLECTION, &Filter::All, &pull_roles)?;

    docs.update_many(
        GROUPS_COLLECTION,
        &Filter::All,
        &Update::Pull {
            field: "channels".into(),
            matching: created_by_user(),
        },
    )?;

    docs.update_many(
        GROUPS_COLLECTION,
        &Filter::All,
        &Update::PullNested {
            array: "channels".into(),
            fields: vec!["admins".into(), "members".into()],
            matching: by_user(),
        },
    )?;

    Ok(PurgeOutcome {
        groups_deleted,
        groups_modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::memory::MemoryStore;
    use huddle_shared::models::{GroupRole, UserSnapshot};
    use huddle_shared::types::{MessageType, Permission};

    fn backends() -> Vec<(&'static str, MembershipStore)> {
        vec![
            ("memory", MembershipStore::new(Arc::new(MemoryStore::new()))),
            (
                "sqlite",
                MembershipStore::new(Arc::new(Database::open_in_memory().unwrap())),
            ),
        ]
    }

    fn snap(id: i64, username: &str) -> UserSnapshot {
        UserSnapshot {
            id: UserId(id),
            username: username.into(),
            email: format!("{username}@example.com"),
            first_name: String::new(),
            surname: String::new(),
            avatar: String::new(),
            permission: Permission::ChatUser,
            active: true,
        }
    }

    fn user(id: UserId, username: &str) -> User {
        User {
            id,
            username: username.into(),
            password: "hash".into(),
            email: format!("{username}@example.com"),
            first_name: "First".into(),
            surname: "Last".into(),
            avatar: String::new(),
            permission: Permission::ChatUser,
            active: true,
        }
    }

    #[tokio::test]
    async fn next_id_starts_at_one() {
        for (name, store) in backends() {
            assert_eq!(store.next_id(USERS_COLLECTION).await.unwrap(), 1, "{name}");
            assert_eq!(store.next_id(CHANNELS_COLLECTION).await.unwrap(), 1, "{name}");
        }
    }

    #[tokio::test]
    async fn channel_ids_are_global_across_groups() {
        for (name, store) in backends() {
            let g1 = store
                .insert_group_with(|id| Group::new(id, "one", snap(1, "ana")))
                .await
                .unwrap();
            let g2 = store
                .insert_group_with(|id| Group::new(id, "two", snap(1, "ana")))
                .await
                .unwrap();
            assert_eq!((g1.id, g2.id), (GroupId(1), GroupId(2)), "{name}");

            let a = store
                .push_channel_with(g1.id, |id| Channel::new(id, "a", snap(1, "ana")))
                .await
                .unwrap();
            let b = store
                .push_channel_with(g2.id, |id| Channel::new(id, "b", snap(1, "ana")))
                .await
                .unwrap();
            assert_eq!((a.id, b.id), (ChannelId(1), ChannelId(2)), "{name}");
            assert_eq!(store.next_id(CHANNELS_COLLECTION).await.unwrap(), 3, "{name}");
        }
    }

    #[tokio::test]
    async fn concurrent_inserts_draw_distinct_ids() {
        let store = Arc::new(MembershipStore::new(Arc::new(MemoryStore::new())));
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .insert_user_with(move |id| user(id, &format!("user{i}")))
                    .await
                    .unwrap()
                    .id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().0);
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn save_group_only_touches_named_fields() {
        for (name, store) in backends() {
            let group = store
                .insert_group_with(|id| Group::new(id, "g", snap(1, "ana")))
                .await
                .unwrap();

            let mut edited = group.clone();
            edited.name = "renamed".into();
            edited.assign_role(snap(2, "bob"), GroupRole::Member);
            store.save_group(&edited, &[GroupField::Members]).await.unwrap();

            let stored = store.load_group(group.id).await.unwrap();
            assert_eq!(stored.name, "g", "{name}");
            assert!(stored.members.contains("bob"), "{name}");
        }
    }

    #[tokio::test]
    async fn missing_group_is_not_found() {
        for (name, store) in backends() {
            let err = store.load_group(GroupId(42)).await.unwrap_err();
            assert!(matches!(err, StoreError::NotFound("group")), "{name}");
            assert!(!err.is_unavailable());
        }
    }

    #[tokio::test]
    async fn append_message_keeps_order() {
        for (name, store) in backends() {
            let group = store
                .insert_group_with(|id| Group::new(id, "g", snap(1, "ana")))
                .await
                .unwrap();
            let channel = store
                .push_channel_with(group.id, |id| Channel::new(id, "general", snap(1, "ana")))
                .await
                .unwrap();

            for text in ["first", "second"] {
                let message = Message {
                    channel_id: channel.id,
                    user_id: UserId(1),
                    user_name: "ana".into(),
                    message_type: MessageType::Text,
                    message: text.into(),
                    avatar: String::new(),
                };
                store.append_message(group.id, channel.id, message).await.unwrap();
            }

            let found = store.find_channel_group(channel.id).await.unwrap().unwrap();
            let messages: Vec<_> = found
                .channel(channel.id)
                .unwrap()
                .messages
                .iter()
                .map(|m| m.message.as_str())
                .collect();
            assert_eq!(messages, ["first", "second"], "{name}");

            let err = store
                .append_message(group.id, ChannelId(99), found.channels[0].messages[0].clone())
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::NotFound("channel")), "{name}");
        }
    }

    #[tokio::test]
    async fn user_conflicts_exclude_self() {
        for (name, store) in backends() {
            let ana = store.insert_user_with(|id| user(id, "ana")).await.unwrap();

            let hit = store
                .find_user_conflict("ana", "other@example.com", None)
                .await
                .unwrap();
            assert_eq!(hit.map(|u| u.id), Some(ana.id), "{name}");

            let by_email = store
                .find_user_conflict("someone", "ana@example.com", Some(ana.id))
                .await
                .unwrap();
            assert!(by_email.is_none(), "{name}");

            let mut edited = ana.clone();
            edited.surname = "Changed".into();
            store.save_user(&edited).await.unwrap();
            let loaded = store.load_user_by_name("ana").await.unwrap().unwrap();
            assert_eq!(loaded.surname, "Changed", "{name}");
        }
    }

    async fn seed_cascade(store: &MembershipStore) -> (GroupId, GroupId) {
        let doomed = store
            .insert_group_with(|id| Group::new(id, "doomed", snap(7, "uma")))
            .await
            .unwrap();

        let kept = store
            .insert_group_with(|id| {
                let mut group = Group::new(id, "kept", snap(1, "ana"));
                group.assign_role(snap(7, "uma"), GroupRole::Member);
                group
            })
            .await
            .unwrap();

        store
            .push_channel_with(kept.id, |id| Channel::new(id, "uma's", snap(7, "uma")))
            .await
            .unwrap();
        store
            .push_channel_with(kept.id, |id| {
                let mut channel = Channel::new(id, "general", snap(1, "ana"));
                channel.admins.insert(snap(7, "uma"));
                channel.members.insert(snap(7, "uma"));
                channel.members.insert(snap(2, "bob"));
                channel
            })
            .await
            .unwrap();

        (doomed.id, kept.id)
    }

    #[tokio::test]
    async fn purge_cascade_is_complete_and_idempotent() {
        for (name, store) in backends() {
            let (doomed, kept) = seed_cascade(&store).await;
            store
                .insert_group_with(|id| {
                    let mut group = Group::new(id, "waiting", snap(1, "ana"));
                    group.assign_role(snap(7, "uma"), GroupRole::Interested);
                    group
                })
                .await
                .unwrap();
            let lurked = store
                .insert_group_with(|id| Group::new(id, "lurked", snap(2, "bob")))
                .await
                .unwrap();
            store
                .push_channel_with(lurked.id, |id| {
                    let mut channel = Channel::new(id, "lobby", snap(2, "bob"));
                    channel.members.insert(snap(7, "uma"));
                    channel
                })
                .await
                .unwrap();

            let outcome = store.purge_user(UserId(7)).await.unwrap();
            assert_eq!(outcome.groups_deleted, 1, "{name}");
            // kept, waiting and lurked each count once
            assert_eq!(outcome.groups_modified, 3, "{name}");

            assert!(matches!(
                store.load_group(doomed).await,
                Err(StoreError::NotFound(_))
            ));

            let group = store.load_group(kept).await.unwrap();
            assert_eq!(group.role_of("uma"), None, "{name}");
            assert_eq!(group.channels.len(), 1, "{name}");
            let general = &group.channels[0];
            assert_eq!(general.name, "general");
            assert!(!general.admins.contains("uma"), "{name}");
            assert!(!general.members.contains("uma"), "{name}");
            assert!(general.members.contains("bob"), "{name}");

            let again = store.purge_user(UserId(7)).await.unwrap();
            assert_eq!(again, PurgeOutcome::default(), "{name}");
            assert_eq!(store.load_group(kept).await.unwrap(), group, "{name}");
        }
    }

    #[tokio::test]
    async fn reports_round_trip() {
        let store = MembershipStore::new(Arc::new(MemoryStore::new()));
        let report = store
            .insert_report_with(|id| ReportedUser {
                id,
                user: snap(3, "cat"),
                reason: "spam".into(),
                date: chrono::Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(report.id, 1);
        assert_eq!(store.list_reports().await.unwrap().len(), 1);
        assert!(store.delete_report_for(UserId(3)).await.unwrap());
        assert!(!store.delete_report_for(UserId(3)).await.unwrap());
    }

    struct Stalled;

    impl DocumentStore for Stalled {
        fn find(&self, _: &str, _: &Filter) -> Result<Vec<serde_json::Value>> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Vec::new())
        }
        fn insert_one(&self, _: &str, _: serde_json::Value) -> Result<()> {
            Ok(())
        }
        fn update_one(&self, _: &str, _: &Filter, _: &Update) -> Result<crate::document::UpdateResult> {
            Ok(Default::default())
        }
        fn update_many(&self, _: &str, _: &Filter, _: &Update) -> Result<crate::document::UpdateResult> {
            Err(StoreError::Migration("offline".into()))
        }
        fn delete_one(&self, _: &str, _: &Filter) -> Result<u64> {
            Ok(0)
        }
        fn delete_many(&self, _: &str, _: &Filter) -> Result<u64> {
            Ok(0)
        }
        fn max_id(&self, _: &str) -> Result<Option<i64>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let store = MembershipStore::new(Arc::new(Stalled)).with_timeout(Duration::from_millis(20));
        let err = store.list_groups().await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { op: "list_groups", .. }));
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn failing_cascade_reports_attempts() {
        let store = MembershipStore::new(Arc::new(Stalled)).with_cascade_attempts(2);
        let err = store.purge_user(UserId(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::CascadeFailed { user: 1, attempts: 2, .. }));
    }
}
