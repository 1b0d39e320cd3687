//! PostgreSQL driver
//!
//! One [`PgConnection`] per handle, opened with the requesting user's own
//! credentials. Nothing is pooled, so a connection can never be reused by a
//! different role.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use lumen_core::{LumenError, LumenResult, QueryResult};
use lumen_sql::{BoundStatement, ConnectionTarget, SslMode};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Executor, Statement};
use tracing::{debug, instrument};

use super::postgres_utils::{
    bind_param, column_info, convert_row, get_column_info, map_connect_error, map_query_error,
};
use super::traits::{Connector, RoleHandle};

const APPLICATION_NAME: &str = "lumen-pg";

/// Opens sqlx connections.
#[derive(Debug, Clone)]
pub struct PgConnector {
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn options(target: &ConnectionTarget) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.username)
            .database(&target.database)
            .ssl_mode(ssl_mode(target.sslmode))
            .application_name(APPLICATION_NAME);
        if let Some(password) = &target.password {
            options = options.password(password.expose());
        }
        options
    }
}

fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

#[async_trait]
impl Connector for PgConnector {
    #[instrument(skip(self, target), fields(target = %target.display_name()))]
    async fn connect(&self, target: &ConnectionTarget) -> LumenResult<Box<dyn RoleHandle>> {
        let options = Self::options(target);
        let connecting = PgConnection::connect_with(&options);
        let conn = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(result) => {
                result.map_err(|e| map_connect_error(e, &target.username, &target.database))?
            }
            Err(_) => {
                return Err(LumenError::Timeout {
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                })
            }
        };
        debug!("connection established");

        Ok(Box::new(PgRoleHandle {
            conn,
            role: target.username.clone(),
            database: target.database.clone(),
        }))
    }
}

/// A live connection authenticated as one role.
pub struct PgRoleHandle {
    conn: PgConnection,
    role: String,
    database: String,
}

impl PgRoleHandle {
    async fn simple(&mut self, sql: &str) -> LumenResult<()> {
        self.conn
            .execute(sql)
            .await
            .map(|_| ())
            .map_err(map_query_error)
    }
}

#[async_trait]
impl RoleHandle for PgRoleHandle {
    fn role(&self) -> &str {
        &self.role
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn query(&mut self, statement: &BoundStatement, cap: usize) -> LumenResult<QueryResult> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = bind_param(query, param);
        }

        let mut result = QueryResult::empty();
        let mut total: i64 = 0;
        {
            let mut stream = query.fetch(&mut self.conn);
            while let Some(row) = stream.try_next().await.map_err(map_query_error)? {
                if result.columns.is_empty() {
                    result.columns = get_column_info(&row);
                }
                if result.rows.len() < cap {
                    result.rows.push(convert_row(&row));
                }
                total += 1;
            }
        }

        // Empty results still report their shape.
        if total == 0 {
            let prepared = (&mut self.conn)
                .prepare(&statement.sql)
                .await
                .map_err(map_query_error)?;
            result.columns = column_info(prepared.columns());
        }

        result.total_size = total;
        Ok(result)
    }

    async fn execute(&mut self, statement: &BoundStatement) -> LumenResult<u64> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = bind_param(query, param);
        }
        query
            .execute(&mut self.conn)
            .await
            .map(|done| done.rows_affected())
            .map_err(map_query_error)
    }

    async fn begin(&mut self) -> LumenResult<()> {
        self.simple("BEGIN").await
    }

    async fn commit(&mut self) -> LumenResult<()> {
        self.simple("COMMIT").await
    }

    async fn rollback(&mut self) -> LumenResult<()> {
        self.simple("ROLLBACK").await
    }

    async fn close(self: Box<Self>) -> LumenResult<()> {
        self.conn.close().await.map_err(map_query_error)
    }
}
