use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{anyhow, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::history::{read_json_or_default, write_json_atomic};

pub const DEFAULT_ROLE: &str = "user";

pub const MSG_MISSING_FIELDS: &str = "Username and password are required";
pub const MSG_USER_EXISTS: &str = "User already exists";
pub const MSG_REGISTERED: &str = "User registered successfully";
pub const MSG_STORE_FAILURE: &str = "Registration failed";

/// Username/password registry. Failures are reported in the return value, never raised.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn register(&self, username: Option<&str>, password: Option<&str>) -> (bool, String);

    /// Returns the account role on success.
    async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> (bool, Option<String>);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    password_hash: String,
    role: String,
}

type UserTable = BTreeMap<String, UserRecord>;

/// Accounts stored as a JSON object keyed by username, passwords hashed with argon2.
pub struct JsonUserStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonUserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn try_register(&self, username: &str, password: &str) -> Result<(bool, String)> {
        let _guard = self.lock.lock().await;
        let mut users: UserTable = read_json_or_default(&self.path).await?;
        if users.contains_key(username) {
            return Ok((false, MSG_USER_EXISTS.to_string()));
        }

        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password)).await??;
        users.insert(
            username.to_string(),
            UserRecord {
                password_hash,
                role: DEFAULT_ROLE.to_string(),
            },
        );
        write_json_atomic(&self.path, &users).await?;
        info!(username, "user registered");
        Ok((true, MSG_REGISTERED.to_string()))
    }

    async fn try_authenticate(&self, username: &str, password: &str) -> Result<Option<String>> {
        let record = {
            let _guard = self.lock.lock().await;
            let users: UserTable = read_json_or_default(&self.path).await?;
            users.get(username).cloned()
        };
        let Some(record) = record else {
            return Ok(None);
        };

        let password = password.to_string();
        let hash = record.password_hash.clone();
        let verified =
            tokio::task::spawn_blocking(move || verify_password(&hash, &password)).await?;
        Ok(verified.then_some(record.role))
    }
}

fn required(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

#[async_trait]
impl CredentialStore for JsonUserStore {
    async fn register(&self, username: Option<&str>, password: Option<&str>) -> (bool, String) {
        let (Some(username), Some(password)) = (required(username), required(password)) else {
            return (false, MSG_MISSING_FIELDS.to_string());
        };
        match self.try_register(username, password).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("registration of {username} failed: {err:#}");
                (false, MSG_STORE_FAILURE.to_string())
            }
        }
    }

    async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> (bool, Option<String>) {
        let (Some(username), Some(password)) = (required(username), required(password)) else {
            return (false, None);
        };
        match self.try_authenticate(username, password).await {
            Ok(Some(role)) => (true, Some(role)),
            Ok(None) => (false, None),
            Err(err) => {
                error!("login of {username} failed: {err:#}");
                (false, None)
            }
        }
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(hash.to_string())
}

fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, JsonUserStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonUserStore::new(dir.path().join("users.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn register_then_login() {
        let (_dir, store) = store();

        let (ok, message) = store.register(Some("alice"), Some("s3cret")).await;
        assert!(ok);
        assert_eq!(message, MSG_REGISTERED);

        assert_eq!(
            store.authenticate(Some("alice"), Some("s3cret")).await,
            (true, Some(DEFAULT_ROLE.to_string()))
        );
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_fail() {
        let (_dir, store) = store();
        store.register(Some("alice"), Some("s3cret")).await;

        assert_eq!(store.authenticate(Some("alice"), Some("nope")).await, (false, None));
        assert_eq!(store.authenticate(Some("bob"), Some("s3cret")).await, (false, None));
        assert_eq!(store.authenticate(None, None).await, (false, None));
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let (_dir, store) = store();
        assert!(store.register(Some("alice"), Some("one")).await.0);

        let (ok, message) = store.register(Some("alice"), Some("two")).await;
        assert!(!ok);
        assert_eq!(message, MSG_USER_EXISTS);
        assert!(store.authenticate(Some("alice"), Some("one")).await.0);
    }

    #[tokio::test]
    async fn missing_fields_are_rejected() {
        let (_dir, store) = store();
        assert_eq!(
            store.register(None, Some("pw")).await,
            (false, MSG_MISSING_FIELDS.to_string())
        );
        assert_eq!(
            store.register(Some("  "), Some("pw")).await,
            (false, MSG_MISSING_FIELDS.to_string())
        );
        assert_eq!(
            store.register(Some("alice"), None).await,
            (false, MSG_MISSING_FIELDS.to_string())
        );
    }

    #[tokio::test]
    async fn passwords_are_not_stored_in_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = JsonUserStore::new(&path);
        store.register(Some("alice"), Some("plaintext-pw")).await;

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"alice\""));
        assert!(raw.contains("$argon2"));
        assert!(!raw.contains("plaintext-pw"));
    }

    #[tokio::test]
    async fn corrupt_store_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "[1, 2").unwrap();
        let store = JsonUserStore::new(&path);

        assert_eq!(
            store.register(Some("alice"), Some("pw")).await,
            (false, MSG_STORE_FAILURE.to_string())
        );
        assert_eq!(store.authenticate(Some("alice"), Some("pw")).await, (false, None));
    }
}
