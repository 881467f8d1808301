//! User directory - the slice of the account system withdrawals depend on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{CustodyError, CustodyResult};
use crate::store::UserId;

const PASSWORD_CONTEXT: &str = "tron-custody 2024 withdrawal password";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityProfile {
    /// Set after a password or 2FA change.
    pub withdrawals_disabled_until: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn security_profile(&self, user: UserId) -> CustodyResult<SecurityProfile>;
    async fn verify_password(&self, user: UserId, password: &str) -> CustodyResult<bool>;
}

struct StaticUser {
    password_hash: [u8; 32],
    profile: SecurityProfile,
}

/// In-process directory with blake3-hashed passwords.
#[derive(Default)]
pub struct StaticUsers {
    users: RwLock<HashMap<UserId, StaticUser>>,
}

impl StaticUsers {
    pub fn new() -> Self { Self::default() }

    pub fn add(&self, user: UserId, password: &str) {
        if let Ok(mut users) = self.users.write() {
            users.insert(user, StaticUser { password_hash: hash(user, password), profile: SecurityProfile::default() });
        }
    }

    pub fn freeze_until(&self, user: UserId, until: DateTime<Utc>) {
        if let Ok(mut users) = self.users.write() {
            if let Some(u) = users.get_mut(&user) {
                u.profile.withdrawals_disabled_until = Some(until);
            }
        }
    }
}

fn hash(user: UserId, password: &str) -> [u8; 32] {
    let mut material = user.as_bytes().to_vec();
    material.extend_from_slice(password.as_bytes());
    blake3::derive_key(PASSWORD_CONTEXT, &material)
}

#[async_trait]
impl UserDirectory for StaticUsers {
    async fn security_profile(&self, user: UserId) -> CustodyResult<SecurityProfile> {
        let users = self.users.read().map_err(|_| CustodyError::Storage("user directory poisoned".into()))?;
        users
            .get(&user)
            .map(|u| u.profile.clone())
            .ok_or_else(|| CustodyError::NotFound(format!("user {}", user)))
    }

    async fn verify_password(&self, user: UserId, password: &str) -> CustodyResult<bool> {
        let users = self.users.read().map_err(|_| CustodyError::Storage("user directory poisoned".into()))?;
        let user_row = users.get(&user).ok_or_else(|| CustodyError::NotFound(format!("user {}", user)))?;
        let candidate = blake3::Hash::from(hash(user, password));
        Ok(candidate == blake3::Hash::from(user_row.password_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn password_check() {
        let users = StaticUsers::new();
        let id = Uuid::new_v4();
        users.add(id, "hunter2");
        assert!(users.verify_password(id, "hunter2").await.unwrap());
        assert!(!users.verify_password(id, "hunter3").await.unwrap());
        assert!(users.verify_password(Uuid::new_v4(), "hunter2").await.is_err());
    }

    #[tokio::test]
    async fn freeze_shows_in_profile() {
        let users = StaticUsers::new();
        let id = Uuid::new_v4();
        users.add(id, "pw");
        let until = Utc::now() + chrono::Duration::hours(24);
        users.freeze_until(id, until);
        assert_eq!(users.security_profile(id).await.unwrap().withdrawals_disabled_until, Some(until));
    }
}
