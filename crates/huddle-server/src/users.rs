//! Account operations: registration, login, profile edits, moderation
//! reports, and the startup super-admin seed.

use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;
use rand::rngs::OsRng;
use serde::Deserialize;
use tracing::{info, warn};

use huddle_shared::constants::SEED_SUPER_ADMIN_USERNAME;
use huddle_shared::models::{ReportedUser, User, UserSnapshot};
use huddle_shared::roles::{self, AuthClass, Scope};
use huddle_shared::types::{Permission, UserId};
use huddle_store::{MembershipStore, PurgeOutcome};

use crate::error::ApiError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub surname: String,
}

/// Fields left as `None` are unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserChanges {
    pub username: Option<String>,
    pub password: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub surname: Option<String>,
    pub permission: Option<Permission>,
    pub active: Option<bool>,
}

/// Argon2 password hashing, run on the blocking pool.
#[derive(Clone, Default)]
pub struct Passwords {
    argon2: Argon2<'static>,
}

impl Passwords {
    #[cfg(test)]
    pub(crate) fn fast() -> Self {
        use argon2::{Algorithm, Params, Version};
        let params = Params::new(8, 1, 1, None).unwrap();
        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    pub async fn hash(&self, password: &str) -> Result<String, ApiError> {
        let argon2 = self.argon2.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            argon2
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|e| ApiError::Internal(format!("password hashing failed: {e}")))
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
    }

    /// `false` for a wrong password or an unreadable stored hash.
    pub async fn verify(&self, password: &str, stored: &str) -> Result<bool, ApiError> {
        let argon2 = self.argon2.clone();
        let password = password.to_string();
        let stored = stored.to_string();
        tokio::task::spawn_blocking(move || match PasswordHash::new(&stored) {
            Ok(parsed) => argon2.verify_password(password.as_bytes(), &parsed).is_ok(),
            Err(e) => {
                warn!(error = %e, "stored password hash is unreadable");
                false
            }
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))
    }
}

#[derive(Clone)]
pub struct UserService {
    store: Arc<MembershipStore>,
    passwords: Passwords,
}

impl UserService {
    pub fn new(store: Arc<MembershipStore>, passwords: Passwords) -> Self {
        Self { store, passwords }
    }

    async fn user(&self, id: UserId) -> Result<User, ApiError> {
        self.store
            .load_user(id)
            .await?
            .ok_or_else(|| ApiError::not_found("User"))
    }

    pub async fn register(&self, new: NewUser) -> Result<UserSnapshot, ApiError> {
        let username = new.username.trim().to_string();
        let email = new.email.trim().to_string();
        if username.is_empty() || email.is_empty() || new.password.is_empty() {
            return Err(ApiError::validation("Missing username, email or password"));
        }
        if self.store.find_user_conflict(&username, &email, None).await?.is_some() {
            return Err(ApiError::conflict("Username or email already taken"));
        }

        let password = self.passwords.hash(&new.password).await?;
        let user = self
            .store
            .insert_user_with(move |id| User {
                id,
                username,
                password,
                email,
                first_name: new.first_name,
                surname: new.surname,
                avatar: String::new(),
                permission: Permission::ChatUser,
                active: true,
            })
            .await?;
        info!(user = %user.id, username = %user.username, "user registered");
        Ok(user.snapshot())
    }

    /// Unknown usernames, wrong passwords and inactive accounts all fail the
    /// same way.
    pub async fn auth(&self, username: &str, password: &str) -> Result<UserSnapshot, ApiError> {
        let denied = || ApiError::Unauthorized("Invalid username or password".into());
        let user = self.store.load_user_by_name(username).await?.ok_or_else(denied)?;
        if !user.active || !self.passwords.verify(password, &user.password).await? {
            return Err(denied());
        }
        Ok(user.snapshot())
    }

    pub async fn update_user(
        &self,
        actor: &UserSnapshot,
        id: UserId,
        changes: UserChanges,
    ) -> Result<UserSnapshot, ApiError> {
        authorize_self_or_super(actor, id)?;
        if changes.permission.is_some() || changes.active.is_some() {
            roles::authorize(AuthClass::SuperAdminOnly, actor, Scope::Platform)?;
        }

        let mut user = self.user(id).await?;
        let was_active = user.active;

        if let Some(username) = changes.username {
            user.username = username.trim().to_string();
        }
        if let Some(email) = changes.email {
            user.email = email.trim().to_string();
        }
        if user.username.is_empty() || user.email.is_empty() {
            return Err(ApiError::validation("Username and email may not be empty"));
        }
        if self
            .store
            .find_user_conflict(&user.username, &user.email, Some(id))
            .await?
            .is_some()
        {
            return Err(ApiError::conflict("Username or email already taken"));
        }

        if let Some(password) = changes.password.filter(|p| !p.is_empty()) {
            user.password = self.passwords.hash(&password).await?;
        }
        if let Some(first_name) = changes.first_name {
            user.first_name = first_name;
        }
        if let Some(surname) = changes.surname {
            user.surname = surname;
        }
        if let Some(permission) = changes.permission {
            user.permission = permission;
        }
        if let Some(active) = changes.active {
            user.active = active;
        }

        self.store.save_user(&user).await?;
        if !user.active {
            if was_active {
                info!(user = %id, "user deactivated");
            }
            self.store.purge_user(id).await?;
        }
        Ok(user.snapshot())
    }

    pub async fn delete_user(&self, actor: &UserSnapshot, id: UserId) -> Result<PurgeOutcome, ApiError> {
        authorize_self_or_super(actor, id)?;
        self.user(id).await?;
        // Purge first: if it fails the account is still there to retry against.
        let outcome = self.store.purge_user(id).await?;
        if !self.store.delete_user(id).await? {
            return Err(ApiError::not_found("User"));
        }
        info!(user = %id, by = %actor.username, "user deleted");
        Ok(outcome)
    }

    pub async fn set_avatar(&self, actor: &UserSnapshot, id: UserId, path: &str) -> Result<UserSnapshot, ApiError> {
        roles::authorize(AuthClass::RequesterIsTarget, actor, Scope::Target(id))?;
        let mut user = self.user(id).await?;
        user.avatar = path.to_string();
        self.store.save_user(&user).await?;
        Ok(user.snapshot())
    }

    pub async fn list_users(&self, actor: &UserSnapshot) -> Result<Vec<UserSnapshot>, ApiError> {
        roles::authorize(AuthClass::AnyoneAuthenticated, actor, Scope::Platform)?;
        let users = self.store.list_users().await?;
        Ok(users.iter().map(User::snapshot).collect())
    }

    // -- reports -------------------------------------------------------------

    pub async fn report_user(
        &self,
        actor: &UserSnapshot,
        id: UserId,
        reason: &str,
    ) -> Result<ReportedUser, ApiError> {
        roles::authorize(AuthClass::AnyoneAuthenticated, actor, Scope::Platform)?;
        if reason.trim().is_empty() {
            return Err(ApiError::validation("Missing reason"));
        }
        let user = self.user(id).await?.snapshot();
        let reason = reason.to_string();
        let report = self
            .store
            .insert_report_with(move |report_id| ReportedUser {
                id: report_id,
                user,
                reason,
                date: Utc::now(),
            })
            .await?;
        info!(reported = %id, by = %actor.username, "user reported");
        Ok(report)
    }

    pub async fn reported_users(&self, actor: &UserSnapshot) -> Result<Vec<ReportedUser>, ApiError> {
        roles::authorize(AuthClass::SuperAdminOnly, actor, Scope::Platform)?;
        Ok(self.store.list_reports().await?)
    }

    pub async fn remove_reported_user(&self, actor: &UserSnapshot, id: UserId) -> Result<(), ApiError> {
        roles::authorize(AuthClass::SuperAdminOnly, actor, Scope::Platform)?;
        if !self.store.delete_report_for(id).await? {
            return Err(ApiError::not_found("Report"));
        }
        Ok(())
    }

    /// Create the `super` account when no users exist yet. Returns whether
    /// an account was created.
    pub async fn seed_super_admin(&self, password: &str) -> Result<bool, ApiError> {
        if !self.store.users_empty().await? {
            return Ok(false);
        }
        let password = self.passwords.hash(password).await?;
        let user = self
            .store
            .insert_user_with(move |id| User {
                id,
                username: SEED_SUPER_ADMIN_USERNAME.to_string(),
                password,
                email: format!("{SEED_SUPER_ADMIN_USERNAME}@localhost"),
                first_name: String::new(),
                surname: String::new(),
                avatar: String::new(),
                permission: Permission::SuperAdmin,
                active: true,
            })
            .await?;
        info!(user = %user.id, "seeded super admin account");
        Ok(true)
    }
}

fn authorize_self_or_super(actor: &UserSnapshot, target: UserId) -> Result<(), ApiError> {
    roles::authorize(AuthClass::RequesterIsTarget, actor, Scope::Target(target))
        .or_else(|_| roles::authorize(AuthClass::SuperAdminOnly, actor, Scope::Platform))?;
    Ok(())
}
