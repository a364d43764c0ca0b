//! User accounts and enrolled devices backing the REST surface.

use std::collections::HashMap;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tivi_proto::api::DeviceRecord;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("user already exists")]
    AlreadyExists,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

#[derive(Debug, Clone)]
pub struct UserAccount {
    pub id: String,
    pub email: String,
    password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create_user(&self, email: &str, password: &str) -> Result<UserAccount, AccountError>;
    async fn authenticate(&self, email: &str, password: &str) -> Result<UserAccount, AccountError>;
    async fn enroll_device(
        &self,
        user_id: &str,
        name: &str,
        mac_address: Option<&str>,
    ) -> Result<DeviceRecord, AccountError>;
    async fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceRecord>, AccountError>;
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn hash_password(password: &str) -> Result<String, AccountError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AccountError::Hashing(e.to_string()))
}

fn verify_password(password: &str, hash: &str) -> Result<(), AccountError> {
    let parsed = PasswordHash::new(hash).map_err(|e| AccountError::Hashing(e.to_string()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| AccountError::InvalidCredentials)
}

/// Process-local store. Everything is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    /// Keyed by normalized email.
    users: RwLock<HashMap<String, UserAccount>>,
    devices: RwLock<Vec<DeviceRecord>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn create_user(&self, email: &str, password: &str) -> Result<UserAccount, AccountError> {
        let email = normalize_email(email);
        if self.users.read().await.contains_key(&email) {
            return Err(AccountError::AlreadyExists);
        }

        let password_hash = hash_password(password)?;

        let mut users = self.users.write().await;
        if users.contains_key(&email) {
            return Err(AccountError::AlreadyExists);
        }
        let account = UserAccount {
            id: format!("user_{}", Uuid::new_v4()),
            email: email.clone(),
            password_hash,
            created_at: Utc::now(),
        };
        users.insert(email, account.clone());
        Ok(account)
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<UserAccount, AccountError> {
        let account = self
            .users
            .read()
            .await
            .get(&normalize_email(email))
            .cloned()
            .ok_or(AccountError::InvalidCredentials)?;

        verify_password(password, &account.password_hash)?;
        Ok(account)
    }

    async fn enroll_device(
        &self,
        user_id: &str,
        name: &str,
        mac_address: Option<&str>,
    ) -> Result<DeviceRecord, AccountError> {
        if !self.users.read().await.values().any(|u| u.id == user_id) {
            return Err(AccountError::UnknownUser(user_id.to_string()));
        }

        let record = DeviceRecord {
            id: format!("device_{}", Uuid::new_v4()),
            name: name.to_string(),
            mac_address: mac_address.map(str::to_string),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
        };
        self.devices.write().await.push(record.clone());
        Ok(record)
    }

    async fn list_devices(&self, user_id: &str) -> Result<Vec<DeviceRecord>, AccountError> {
        Ok(self
            .devices
            .read()
            .await
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }
}
