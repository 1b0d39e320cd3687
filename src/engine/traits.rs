//! Driver seam
//!
//! The broker never talks to sqlx directly: it asks a [`Connector`] for a
//! [`RoleHandle`], a single connection authenticated as one role. The
//! production implementation lives in `engine::postgres`; tests plug in
//! in-memory fakes.

use async_trait::async_trait;
use lumen_core::{LumenError, LumenResult, QueryResult, Value};
use lumen_sql::{BoundStatement, ConnectionTarget};

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects as `target.username` to `target.database`.
    async fn connect(&self, target: &ConnectionTarget) -> LumenResult<Box<dyn RoleHandle>>;
}

/// One live connection, authenticated as one role, used by one operation.
#[async_trait]
pub trait RoleHandle: Send {
    /// Role the handle was opened for.
    fn role(&self) -> &str;

    fn database(&self) -> &str;

    /// Runs a row-returning statement.
    ///
    /// At most `cap` rows are kept; `total_size` counts every row produced.
    async fn query(&mut self, statement: &BoundStatement, cap: usize) -> LumenResult<QueryResult>;

    /// Runs a statement and returns the affected row count.
    async fn execute(&mut self, statement: &BoundStatement) -> LumenResult<u64>;

    async fn begin(&mut self) -> LumenResult<()>;

    async fn commit(&mut self) -> LumenResult<()>;

    async fn rollback(&mut self) -> LumenResult<()>;

    async fn close(self: Box<Self>) -> LumenResult<()>;

    /// Role the server reports for this session.
    async fn current_role(&mut self) -> LumenResult<String> {
        let result = self
            .query(&BoundStatement::new("SELECT current_user::text"), 1)
            .await?;
        match result.rows.first().and_then(|row| row.values.first()) {
            Some(Value::Text(role)) => Ok(role.clone()),
            _ => Err(LumenError::internal("server did not report current_user")),
        }
    }

    async fn ping(&mut self) -> LumenResult<()> {
        self.query(&BoundStatement::new("SELECT 1"), 1).await.map(|_| ())
    }
}
