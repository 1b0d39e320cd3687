// SPDX-License-Identifier: Apache-2.0

//! Session Store
//!
//! One session per user, keyed by a random 64-hex id. The secret is kept
//! only as ciphertext; [`SessionStore::credential`] decrypts it for the
//! duration of a single operation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lumen_core::{Clock, Credential, LumenError, LumenResult};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::crypto::{random_token, Crypto};

pub const SESSION_TTL_SECS: i64 = 24 * 60 * 60;
const SESSION_ID_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub username: String,
    #[serde(skip)]
    pub encrypted_secret: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub initial_db: String,
    pub initial_schema: Option<String>,
    pub initial_table: Option<String>,
}

/// Where a fresh session lands the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialLocation {
    pub database: String,
    pub schema: Option<String>,
    pub table: Option<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    by_user: HashMap<String, String>,
}

impl Inner {
    fn remove(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        if self.by_user.get(&session.username).map(String::as_str) == Some(session_id) {
            self.by_user.remove(&session.username);
        }
        Some(session)
    }
}

pub struct SessionStore {
    inner: Mutex<Inner>,
    crypto: Arc<Crypto>,
    clock: Arc<dyn Clock>,
    ttl_secs: i64,
}

fn is_well_formed(session_id: &str) -> bool {
    session_id.len() == SESSION_ID_BYTES * 2
        && session_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl SessionStore {
    pub fn new(crypto: Arc<Crypto>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            crypto,
            clock,
            ttl_secs: SESSION_TTL_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Creates a session, replacing any previous session of the same user.
    pub fn create(
        &self,
        credential: &Credential,
        location: InitialLocation,
    ) -> LumenResult<Session> {
        let encrypted_secret = self.crypto.encrypt_secret(credential.secret.expose())?;
        let now = self.clock.now();
        let session = Session {
            session_id: random_token(SESSION_ID_BYTES),
            username: credential.username.clone(),
            encrypted_secret,
            created_at: now,
            expires_at: self.clock.add_seconds(now, self.ttl_secs),
            initial_db: location.database,
            initial_schema: location.schema,
            initial_table: location.table,
        };

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.by_user.get(&session.username).cloned() {
            inner.remove(&previous);
            debug!(username = %session.username, "previous session replaced");
        }
        inner
            .by_user
            .insert(session.username.clone(), session.session_id.clone());
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        info!(username = %session.username, expires_at = %session.expires_at, "session created");
        Ok(session)
    }

    /// Expired sessions are removed on the way out.
    pub fn validate(&self, session_id: &str) -> LumenResult<Session> {
        if !is_well_formed(session_id) {
            return Err(LumenError::InvalidSession);
        }
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get(session_id)
            .cloned()
            .ok_or(LumenError::SessionNotFound)?;
        if self.clock.is_expired(session.expires_at) {
            inner.remove(session_id);
            return Err(LumenError::SessionExpired);
        }
        Ok(session)
    }

    /// Pushes the expiry out by a full TTL.
    pub fn refresh(&self, session_id: &str) -> LumenResult<Session> {
        self.validate(session_id)?;
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or(LumenError::SessionNotFound)?;
        session.expires_at = self.clock.add_seconds(self.clock.now(), self.ttl_secs);
        Ok(session.clone())
    }

    pub fn delete(&self, session_id: &str) {
        if self.inner.lock().remove(session_id).is_some() {
            debug!("session deleted");
        }
    }

    /// The validated session's credential with the secret decrypted.
    pub fn credential(&self, session_id: &str) -> LumenResult<Credential> {
        let session = self.validate(session_id)?;
        self.decrypt(&session.username, &session.encrypted_secret)
    }

    pub fn decrypt(&self, username: &str, encrypted_secret: &str) -> LumenResult<Credential> {
        let secret = self.crypto.decrypt_secret(encrypted_secret)?;
        Ok(Credential::new(username, secret))
    }

    pub fn session_for_user(&self, username: &str) -> Option<Session> {
        let inner = self.inner.lock();
        let session_id = inner.by_user.get(username)?;
        inner.sessions.get(session_id).cloned()
    }

    /// Drops every expired session; returns how many went.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| self.clock.is_expired(s.expires_at))
            .map(|s| s.session_id.clone())
            .collect();
        for session_id in &expired {
            inner.remove(session_id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
