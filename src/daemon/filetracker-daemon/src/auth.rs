//! Single-credential login and cookie sessions
//!
//! Passwords are bcrypt hashes in the credential store. Hashing and
//! verification are CPU-bound and run on the blocking pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use filetracker_core::{AuthError, CredentialStore, User};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "filetracker_session";

/// Body of `POST /login`, as JSON or form fields
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Hash a password with bcrypt on the blocking pool
pub async fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| AuthError::Hash(e.to_string()))?
        .map_err(|e| AuthError::Hash(e.to_string()))
}

pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    cost: u32,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>, cost: u32) -> Self {
        Self { store, cost }
    }

    /// Check a username/password pair against the stored hash
    pub async fn verify(&self, username: &str, password: &str) -> Result<User, AuthError> {
        let user = self
            .store
            .find_user(username)?
            .ok_or(AuthError::UnknownUser)?;

        let password = password.to_string();
        let hash = user.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| AuthError::Hash(e.to_string()))?;

        match verified {
            Ok(true) => Ok(user),
            Ok(false) => Err(AuthError::WrongPassword),
            Err(e) => {
                warn!(username, error = %e, "Stored password hash is unreadable");
                Err(AuthError::WrongPassword)
            }
        }
    }

    /// Seed a user unless one with that name exists. Returns whether it was created.
    pub async fn ensure_user(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        if self.store.find_user(username)?.is_some() {
            return Ok(false);
        }

        let hash = hash_password(password, self.cost).await?;
        let created = self.store.insert_user_if_absent(username, &hash)?;
        if created {
            info!("Created default user '{}'", username);
        }
        Ok(created)
    }

    /// Create the user or replace its password
    pub async fn set_password(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let hash = hash_password(password, self.cost).await?;
        self.store.set_password(username, &hash)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Session {
    username: String,
    created: Instant,
}

/// In-process session table keyed by opaque cookie tokens
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Start a session and return its token
    pub fn create(&self, username: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.sessions.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                created: Instant::now(),
            },
        );
        debug!("Session opened for '{}'", username);
        token
    }

    /// Username of a live session
    pub fn get(&self, token: &str) -> Option<String> {
        let username = {
            let session = self.sessions.get(token)?;
            (session.created.elapsed() < self.ttl).then(|| session.username.clone())
        };

        if username.is_none() {
            self.sessions.remove(token);
        }
        username
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    /// Drop expired sessions; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.created.elapsed() < self.ttl);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
