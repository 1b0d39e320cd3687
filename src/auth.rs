// SPDX-License-Identifier: Apache-2.0

//! Login, logout and re-authentication.
//!
//! A login is a probe: the broker must be able to open a connection as the
//! user on one of the databases the catalog says they may connect to. Only
//! then is a session issued.

use std::sync::Arc;

use lumen_core::{CancellationToken, Credential, LumenError, LumenResult};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::engine::ConnectionBroker;
use crate::metadata::MetadataCache;
use crate::metrics;
use crate::session::{InitialLocation, Session, SessionStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginResult {
    pub success: bool,
    pub initial_db: String,
    pub initial_schema: Option<String>,
    pub initial_table: Option<String>,
    pub session_id: String,
}

impl From<Session> for LoginResult {
    fn from(session: Session) -> Self {
        Self {
            success: true,
            initial_db: session.initial_db,
            initial_schema: session.initial_schema,
            initial_table: session.initial_table,
            session_id: session.session_id,
        }
    }
}

pub struct AuthService {
    broker: Arc<ConnectionBroker>,
    cache: Arc<MetadataCache>,
    sessions: Arc<SessionStore>,
}

impl AuthService {
    pub fn new(
        broker: Arc<ConnectionBroker>,
        cache: Arc<MetadataCache>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            broker,
            cache,
            sessions,
        }
    }

    #[instrument(skip(self, secret, cancel))]
    pub async fn login(
        &self,
        username: &str,
        secret: &str,
        cancel: &CancellationToken,
    ) -> LumenResult<LoginResult> {
        if username.trim().is_empty() {
            return Err(LumenError::invalid_input("username is required"));
        }
        let credential = Credential::new(username, secret);
        let outcome = self.authenticate(&credential, cancel).await;
        metrics::record_login(outcome.is_ok());
        match outcome {
            Ok(session) => {
                info!(initial_db = %session.initial_db, "login succeeded");
                Ok(session.into())
            }
            Err(err) => {
                warn!(code = err.code(), "login failed");
                Err(err)
            }
        }
    }

    /// Ends the session. Unknown ids are ignored.
    pub fn logout(&self, session_id: &str) {
        self.sessions.delete(session_id);
    }

    /// Re-probes with a sealed secret and issues a fresh session.
    #[instrument(skip(self, encrypted_secret, cancel))]
    pub async fn re_authenticate(
        &self,
        username: &str,
        encrypted_secret: &str,
        cancel: &CancellationToken,
    ) -> LumenResult<LoginResult> {
        let credential = self.sessions.decrypt(username, encrypted_secret)?;
        let outcome = self.authenticate(&credential, cancel).await;
        metrics::record_login(outcome.is_ok());
        outcome.map(LoginResult::from)
    }

    async fn authenticate(
        &self,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> LumenResult<Session> {
        let username = &credential.username;
        let mut databases = self.cache.accessible_databases(username);
        if databases.is_empty() {
            // Roles created after the last load are unknown to the snapshot.
            self.cache.refresh_role(username, cancel).await?;
            databases = self.cache.accessible_databases(username);
        }

        let connected = self.broker.probe(credential, &databases, cancel).await?;
        let view = self.cache.get_role_view(username);
        let (database, schema, table) = view
            .initial_location(&connected)
            .unwrap_or((connected, None, None));

        self.sessions.create(
            credential,
            InitialLocation {
                database,
                schema,
                table,
            },
        )
    }
}
