//! Data Service
//!
//! Every read and every manual query runs on a fresh connection authenticated
//! as the caller. The metadata cache is consulted first so that obviously
//! forbidden requests fail without a round trip; the server still has the
//! final say.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use lumen_core::{
    run_cancellable, CancellationToken, Credential, LumenError, LumenResult, QueryResult,
    SortDirection, TableRef, Value,
};
use lumen_sql::generator::{build_count_matching, build_lookup};
use lumen_sql::{classify, guard_where, split, BoundStatement, PageOrder, StatementKind};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::engine::{ConnectionBroker, RoleHandle};
use crate::metadata::{ErdData, MetadataCache, Permissions, TableMeta};
use crate::metrics;
use crate::pager::{Cursor, OffsetPage, PageSource, Pager, TablePage};

/// Table, filter and sort of a read.
#[derive(Debug, Clone)]
pub struct TableQuery {
    pub table: TableRef,
    /// WHERE fragment typed by the user; vetted before use.
    pub filter: Option<String>,
    pub sort_column: Option<String>,
    pub direction: SortDirection,
}

impl TableQuery {
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            filter: None,
            sort_column: None,
            direction: SortDirection::Asc,
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn sort(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.sort_column = Some(column.into());
        self.direction = direction;
        self
    }
}

/// Child rows pointing at one parent value through one FK.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildReference {
    pub table: TableRef,
    pub column: String,
    pub row_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferencingGroup {
    pub database: String,
    pub references: Vec<ChildReference>,
}

pub struct DataService {
    broker: Arc<ConnectionBroker>,
    cache: Arc<MetadataCache>,
    pager: Pager,
}

/// Closes the handle, or drops it when the call was interrupted.
async fn finish<T>(handle: Box<dyn RoleHandle>, outcome: LumenResult<T>) -> LumenResult<T> {
    match &outcome {
        Err(err @ (LumenError::Cancelled | LumenError::Timeout { .. })) => {
            metrics::record_error(err);
            drop(handle);
        }
        _ => {
            let _ = handle.close().await;
        }
    }
    outcome
}

fn count_value(result: &QueryResult) -> i64 {
    result
        .rows
        .first()
        .and_then(|r| r.values.first())
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Same error family, new headline; the server cause is kept.
fn restate(err: LumenError, message: String) -> LumenError {
    match err {
        LumenError::QueryFailed { cause, .. } => LumenError::query_failed(message, cause),
        LumenError::PermissionDenied { cause, .. } => LumenError::permission_denied(message, cause),
        LumenError::ConnectionFailed { cause, .. } => LumenError::connection_failed(message, cause),
        other => other,
    }
}

impl DataService {
    pub fn new(broker: Arc<ConnectionBroker>, cache: Arc<MetadataCache>, pager: Pager) -> Self {
        Self {
            broker,
            cache,
            pager,
        }
    }

    fn require(&self, username: &str, table: &TableRef, perm: Permissions) -> LumenResult<()> {
        if self.cache.has_permission(username, table, perm) {
            Ok(())
        } else {
            Err(LumenError::table_access_denied(table.to_string()))
        }
    }

    fn table_meta(&self, table: &TableRef) -> LumenResult<TableMeta> {
        self.cache
            .table(table)
            .ok_or_else(|| LumenError::not_found(format!("table {}", table)))
    }

    /// Checks SELECT, vets the filter and resolves the sort.
    ///
    /// Without an explicit sort column the primary key (or the first column)
    /// orders the rows.
    fn prepare_read(
        &self,
        username: &str,
        query: &TableQuery,
    ) -> LumenResult<(TableMeta, PageOrder, bool)> {
        self.require(username, &query.table, Permissions::SELECT)?;
        if let Some(filter) = &query.filter {
            guard_where(filter)?;
        }
        let meta = self.table_meta(&query.table)?;
        let primary_key = meta.primary_key();

        let explicit = query.sort_column.is_some();
        let sort_column = match &query.sort_column {
            Some(column) => {
                if meta.column(column).is_none() {
                    return Err(LumenError::invalid_input(format!(
                        "unknown sort column {}",
                        column
                    )));
                }
                column.clone()
            }
            None => primary_key
                .first()
                .or_else(|| meta.columns.first().map(|c| &c.name))
                .cloned()
                .ok_or_else(|| LumenError::invalid_input("table has no columns"))?,
        };

        let order = PageOrder {
            sort_column,
            direction: query.direction,
            tiebreak: primary_key,
        };
        Ok((meta, order, explicit))
    }

    /// One keyset page. `cursor` is `None` for the first page.
    #[instrument(
        skip(self, credential, query, cursor, cancel),
        fields(username = %credential.username, table = %query.table)
    )]
    pub async fn read_table_page(
        &self,
        credential: &Credential,
        query: &TableQuery,
        cursor: Option<Cursor>,
        page_size: Option<u64>,
        cancel: &CancellationToken,
    ) -> LumenResult<TablePage> {
        let (meta, order, _) = self.prepare_read(&credential.username, query)?;
        let cursor = match cursor {
            Some(cursor) => self.pager.resume(cursor),
            None => self.pager.cursor(page_size),
        };
        if !cursor.can_load_more() {
            return Ok(TablePage::exhausted());
        }
        let types = meta.column_types();
        let source = PageSource {
            table: &query.table,
            filter: query.filter.as_deref(),
            types: &types,
        };

        let started = Instant::now();
        let mut handle = self
            .broker
            .open(&query.table.database, credential, cancel)
            .await?;
        let outcome = run_cancellable(
            cancel,
            self.pager
                .fetch_cursor_page(handle.as_mut(), &source, &order, &cursor),
        )
        .await;
        let outcome = finish(handle, outcome).await;
        metrics::record_query(started.elapsed(), outcome.is_ok());
        outcome
    }

    /// One offset page with the truthful total count.
    #[instrument(
        skip(self, credential, query, cancel),
        fields(username = %credential.username, table = %query.table)
    )]
    pub async fn read_table(
        &self,
        credential: &Credential,
        query: &TableQuery,
        offset: i64,
        limit: i64,
        cancel: &CancellationToken,
    ) -> LumenResult<OffsetPage> {
        let (meta, order, explicit) = self.prepare_read(&credential.username, query)?;
        let types = meta.column_types();
        let source = PageSource {
            table: &query.table,
            filter: query.filter.as_deref(),
            types: &types,
        };
        let fallback = meta.primary_key();

        let started = Instant::now();
        let mut handle = self
            .broker
            .open(&query.table.database, credential, cancel)
            .await?;
        let outcome = run_cancellable(
            cancel,
            self.pager.fetch_offset_page(
                handle.as_mut(),
                &source,
                explicit.then_some(&order),
                &fallback,
                offset,
                limit,
            ),
        )
        .await;
        let outcome = finish(handle, outcome).await;
        metrics::record_query(started.elapsed(), outcome.is_ok());
        outcome
    }

    /// Parent rows referenced by `child.fk_column = value`.
    #[instrument(skip(self, credential, value, cancel), fields(username = %credential.username))]
    pub async fn navigate_fk(
        &self,
        credential: &Credential,
        child: &TableRef,
        fk_column: &str,
        value: &Value,
        cancel: &CancellationToken,
    ) -> LumenResult<QueryResult> {
        let edge = self
            .cache
            .foreign_keys_from(child)
            .into_iter()
            .find(|fk| fk.source_column == fk_column)
            .ok_or_else(|| {
                LumenError::not_found(format!("foreign key on {}.{}", child, fk_column))
            })?;

        let username = &credential.username;
        if !self.cache.can_access_table(username, child) {
            return Err(LumenError::table_access_denied(child.to_string()));
        }
        self.require(username, &edge.target, Permissions::SELECT)?;

        let parent = self.table_meta(&edge.target)?;
        let statement = build_lookup(
            &edge.target,
            &edge.target_column,
            value,
            self.pager.hard_cap,
            &parent.column_types(),
        );

        let started = Instant::now();
        let mut handle = self
            .broker
            .open(&edge.target.database, credential, cancel)
            .await?;
        let cap = self.pager.hard_cap as usize;
        let outcome = run_cancellable(cancel, handle.query(&statement, cap)).await;
        let outcome = finish(handle, outcome).await;
        metrics::record_query(started.elapsed(), outcome.is_ok());
        outcome
    }

    /// Every readable child table referencing `parent.pk_column = value`,
    /// with the number of matching rows, grouped by database.
    #[instrument(skip(self, credential, value, cancel), fields(username = %credential.username))]
    pub async fn navigate_pk(
        &self,
        credential: &Credential,
        parent: &TableRef,
        pk_column: &str,
        value: &Value,
        cancel: &CancellationToken,
    ) -> LumenResult<Vec<ReferencingGroup>> {
        let username = &credential.username;
        if !self.cache.can_access_table(username, parent) {
            return Err(LumenError::table_access_denied(parent.to_string()));
        }

        let mut by_database: BTreeMap<String, Vec<(TableRef, String, BoundStatement)>> =
            BTreeMap::new();
        for edge in self.cache.foreign_keys_to(parent, pk_column) {
            if !self
                .cache
                .has_permission(username, &edge.source, Permissions::SELECT)
            {
                continue;
            }
            let types = self
                .cache
                .table(&edge.source)
                .map(|t| t.column_types())
                .unwrap_or_default();
            let statement = build_count_matching(&edge.source, &edge.source_column, value, &types);
            by_database
                .entry(edge.source.database.clone())
                .or_default()
                .push((edge.source, edge.source_column, statement));
        }

        let mut groups = Vec::with_capacity(by_database.len());
        for (database, counts) in by_database {
            let mut handle = self.broker.open(&database, credential, cancel).await?;
            let outcome = run_cancellable(cancel, async {
                let mut references = Vec::with_capacity(counts.len());
                for (table, column, statement) in &counts {
                    let result = handle.query(statement, 1).await?;
                    references.push(ChildReference {
                        table: table.clone(),
                        column: column.clone(),
                        row_count: count_value(&result),
                    });
                }
                Ok(references)
            })
            .await;
            let references = finish(handle, outcome).await?;
            groups.push(ReferencingGroup {
                database,
                references,
            });
        }
        Ok(groups)
    }

    /// Runs a user-typed script statement by statement on one connection.
    ///
    /// Nothing runs unless every statement is classifiable and the role
    /// plausibly holds what each needs.
    #[instrument(skip(self, credential, sql, cancel), fields(username = %credential.username))]
    pub async fn execute_query(
        &self,
        credential: &Credential,
        database: &str,
        sql: &str,
        cancel: &CancellationToken,
    ) -> LumenResult<Vec<QueryResult>> {
        let statements = split(sql);
        if statements.is_empty() {
            return Err(LumenError::invalid_input("no statements to run"));
        }

        let username = &credential.username;
        let mut planned = Vec::with_capacity(statements.len());
        for (i, statement) in statements.into_iter().enumerate() {
            let kind = classify(&statement);
            match kind {
                StatementKind::Other => {
                    return Err(LumenError::unsupported_statement(format!(
                        "statement {} is not SELECT, INSERT, UPDATE, DELETE or DDL",
                        i + 1
                    )))
                }
                StatementKind::Select | StatementKind::Ddl => {
                    if !self.cache.can_connect(username, database) {
                        return Err(LumenError::permission_denied(
                            format!("no CONNECT on database {}", database),
                            None,
                        ));
                    }
                }
                StatementKind::DmlWrite => {
                    if !self.cache.can_write_in_database(username, database) {
                        return Err(LumenError::permission_denied(
                            format!("no write privilege in database {}", database),
                            None,
                        ));
                    }
                }
            }
            planned.push((kind, BoundStatement::new(statement)));
        }
        debug!(statements = planned.len(), "running manual query");

        let cap = self.pager.hard_cap as usize;
        let started = Instant::now();
        let mut handle = self.broker.open(database, credential, cancel).await?;
        let outcome = run_cancellable(cancel, async {
            let mut results = Vec::with_capacity(planned.len());
            for (i, (kind, statement)) in planned.iter().enumerate() {
                let ran = if kind.is_select() {
                    handle.query(statement, cap).await
                } else {
                    handle
                        .execute(statement)
                        .await
                        .map(QueryResult::with_affected_rows)
                };
                match ran {
                    Ok(result) => results.push(result),
                    Err(err) => {
                        let message = format!("Statement {} failed after {} succeeded", i + 1, i);
                        return Err(restate(err, message));
                    }
                }
            }
            Ok(results)
        })
        .await;
        let outcome = finish(handle, outcome).await;
        metrics::record_query(started.elapsed(), outcome.is_ok());
        outcome
    }

    pub fn erd(&self, username: &str, database: &str, schema: &str) -> LumenResult<ErdData> {
        if !self.cache.can_connect(username, database) {
            return Err(LumenError::permission_denied(
                format!("no CONNECT on database {}", database),
                None,
            ));
        }
        Ok(self.cache.erd(username, database, schema))
    }
}
