//! Connection Broker
//!
//! Maps `(username, secret)` to live connections authenticated as that role.
//! The broker holds no connection state: every call opens its own handle and
//! the caller closes it.

use std::sync::Arc;
use std::time::Duration;

use lumen_core::{
    run_cancellable, run_with_deadline, CancellationToken, Credential, ErrorKind, LumenError,
    LumenResult,
};
use lumen_sql::{validate_connection_string, ConnectionTarget};
use tracing::{debug, error, instrument, warn};

use super::traits::{Connector, RoleHandle};

pub struct ConnectionBroker {
    connector: Arc<dyn Connector>,
    server: ConnectionTarget,
    probe_timeout: Duration,
}

impl ConnectionBroker {
    pub const TEST_TIMEOUT_MS: u64 = 10000;
    pub const PROBE_TIMEOUT_MS: u64 = 10000;

    /// `server` supplies host, port and sslmode for every user connection.
    pub fn new(connector: Arc<dyn Connector>, server: ConnectionTarget) -> Self {
        Self {
            connector,
            server,
            probe_timeout: Duration::from_millis(Self::PROBE_TIMEOUT_MS),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn server(&self) -> &ConnectionTarget {
        &self.server
    }

    fn user_target(&self, database: &str, credential: &Credential) -> ConnectionTarget {
        self.server
            .with_credentials(credential.username.clone(), credential.secret.clone())
            .with_database(database)
    }

    /// Opens, pings and closes a connection described by a connection string.
    #[instrument(skip(self, raw, cancel))]
    pub async fn test_connection(&self, raw: &str, cancel: &CancellationToken) -> LumenResult<()> {
        let target = validate_connection_string(raw)?;
        let limit = Duration::from_millis(Self::TEST_TIMEOUT_MS);
        run_with_deadline(cancel, limit, async {
            let mut handle = self.connector.connect(&target).await?;
            let pinged = handle.ping().await;
            let closed = handle.close().await;
            pinged.and(closed)
        })
        .await
    }

    /// Returns the first database in `databases` the role can connect to.
    ///
    /// A bad password stops the walk at once. Databases the role may not
    /// connect to are skipped. Anything else surfaces.
    #[instrument(
        skip(self, credential, databases, cancel),
        fields(username = %credential.username, candidates = databases.len())
    )]
    pub async fn probe(
        &self,
        credential: &Credential,
        databases: &[String],
        cancel: &CancellationToken,
    ) -> LumenResult<String> {
        for database in databases {
            let target = self.user_target(database, credential);
            let attempt = run_with_deadline(cancel, self.probe_timeout, async {
                let mut handle = self.connector.connect(&target).await?;
                let pinged = handle.ping().await;
                let closed = handle.close().await;
                pinged.and(closed)
            })
            .await;

            match attempt {
                Ok(()) => {
                    debug!(database = %database, "probe succeeded");
                    return Ok(database.clone());
                }
                Err(err) if err.kind() == ErrorKind::Authorization => {
                    debug!(database = %database, cause = ?err.cause(), "role may not connect, trying next");
                }
                Err(err) => {
                    warn!(database = %database, code = err.code(), "probe failed");
                    return Err(err);
                }
            }
        }

        Err(LumenError::no_accessible_db(&credential.username))
    }

    /// Opens a handle as `credential.username` on `database`.
    #[instrument(
        skip(self, credential, cancel),
        fields(username = %credential.username)
    )]
    pub async fn open(
        &self,
        database: &str,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> LumenResult<Box<dyn RoleHandle>> {
        let target = self.user_target(database, credential);
        self.open_target(&target, cancel).await
    }

    /// Opens a handle on an explicit target and checks the server agrees on
    /// who is connected.
    pub async fn open_target(
        &self,
        target: &ConnectionTarget,
        cancel: &CancellationToken,
    ) -> LumenResult<Box<dyn RoleHandle>> {
        let mut handle = run_cancellable(cancel, self.connector.connect(target)).await?;

        let reported = match run_cancellable(cancel, handle.current_role()).await {
            Ok(role) => role,
            Err(err) => {
                let _ = handle.close().await;
                return Err(err);
            }
        };
        if reported != target.username {
            error!(requested = %target.username, reported = %reported, "role mismatch on new connection");
            let _ = handle.close().await;
            return Err(LumenError::internal(format!(
                "connection reports role {} instead of {}",
                reported, target.username
            )));
        }

        Ok(handle)
    }
}
