//! Transaction Engine
//!
//! At most one buffered transaction per user. Ops accumulate in memory and
//! reach the server only at commit, inside one BEGIN/COMMIT on a connection
//! authenticated as that user.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lumen_core::{
    run_cancellable, CancellationToken, Clock, Credential, LumenError, LumenResult, RowData,
    TableRef, Value,
};
use lumen_sql::generator::{build_delete, build_insert, build_update};
use lumen_sql::{BoundStatement, ColumnTypes};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::buffer::{coalesce, BufferedOp, PlannedOp, RowKey};
use crate::engine::{ConnectionBroker, RoleHandle};
use crate::metadata::{MetadataCache, Permissions};
use crate::metrics;

pub const TRANSACTION_TTL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    None,
    Active,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionStatus {
    pub state: TransactionState,
    pub active: bool,
    pub remaining_seconds: u64,
    pub edit_count: usize,
    pub delete_count: usize,
    pub insert_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitOutcome {
    pub affected_rows: u64,
    pub statements: usize,
}

#[derive(Debug)]
struct Transaction {
    table: TableRef,
    started_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    ops: Vec<BufferedOp>,
    next_pending_id: u64,
    /// Set by the sweeper; a clock past `expires_at` means the same thing.
    expired: bool,
}

impl Transaction {
    fn count(&self, pick: fn(&BufferedOp) -> bool) -> usize {
        self.ops.iter().filter(|op| pick(op)).count()
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<Transaction>>>;

pub struct TransactionEngine {
    slots: Mutex<HashMap<String, Slot>>,
    cache: Arc<MetadataCache>,
    broker: Arc<ConnectionBroker>,
    clock: Arc<dyn Clock>,
    ttl_secs: i64,
}

impl TransactionEngine {
    pub fn new(
        cache: Arc<MetadataCache>,
        broker: Arc<ConnectionBroker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            cache,
            broker,
            clock,
            ttl_secs: TRANSACTION_TTL_SECS,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    fn slot(&self, username: &str) -> Slot {
        self.slots
            .lock()
            .entry(username.to_string())
            .or_default()
            .clone()
    }

    fn is_expired(&self, tx: &Transaction) -> bool {
        tx.expired || self.clock.is_expired(tx.expires_at)
    }

    /// Runs `f` on the user's live transaction. An expired one is cleared
    /// and reported instead.
    async fn with_active<T>(
        &self,
        username: &str,
        table: &TableRef,
        f: impl FnOnce(&mut Transaction) -> LumenResult<T>,
    ) -> LumenResult<T> {
        let slot = self.slot(username);
        let mut guard = slot.lock().await;
        let Some(tx) = guard.as_mut() else {
            return Err(LumenError::no_active_transaction(username));
        };
        if self.is_expired(tx) {
            *guard = None;
            return Err(LumenError::transaction_expired(username));
        }
        if table.database != tx.table.database {
            return Err(LumenError::invalid_input(format!(
                "transaction is bound to database {}, not {}",
                tx.table.database, table.database
            )));
        }
        f(tx)
    }

    /// A pending key is only valid on the table its INSERT targeted.
    fn check_key(tx: &Transaction, table: &TableRef, key: &RowKey) -> LumenResult<()> {
        match key {
            RowKey::Existing(values) if values.is_empty() => Err(LumenError::invalid_input(
                "row key must name at least one column",
            )),
            RowKey::Pending(id) => {
                let inserted_into = tx.ops.iter().find_map(|op| match op {
                    BufferedOp::Insert {
                        table, pending_id, ..
                    } if pending_id == id => Some(table),
                    _ => None,
                });
                match inserted_into {
                    None => Err(LumenError::invalid_input(format!(
                        "pending row {} was not inserted in this transaction",
                        id
                    ))),
                    Some(target) if target != table => Err(LumenError::invalid_input(format!(
                        "pending row {} belongs to {}, not {}",
                        id, target, table
                    ))),
                    Some(_) => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Opens a transaction on `table`. The role must hold UPDATE on it.
    #[instrument(skip(self, table), fields(table = %table))]
    pub async fn start(&self, username: &str, table: &TableRef) -> LumenResult<TransactionStatus> {
        if !self
            .cache
            .has_permission(username, table, Permissions::UPDATE)
        {
            return Err(LumenError::table_access_denied(table.to_string()));
        }

        let slot = self.slot(username);
        let mut guard = slot.lock().await;
        if let Some(existing) = guard.as_ref() {
            if !self.is_expired(existing) {
                return Err(LumenError::active_transaction_exists(username));
            }
            debug!("clearing expired transaction before start");
        }

        let now = self.clock.now();
        let tx = Transaction {
            table: table.clone(),
            started_at: now,
            expires_at: self.clock.add_seconds(now, self.ttl_secs),
            ops: Vec::new(),
            next_pending_id: 0,
            expired: false,
        };
        let status = self.describe(Some(&tx));
        *guard = Some(tx);
        info!("transaction started");
        Ok(status)
    }

    pub async fn edit_cell(
        &self,
        username: &str,
        table: &TableRef,
        key: RowKey,
        column: &str,
        value: Value,
    ) -> LumenResult<()> {
        if column.is_empty() {
            return Err(LumenError::invalid_input("column name is empty"));
        }
        self.with_active(username, table, |tx| {
            Self::check_key(tx, table, &key)?;
            tx.ops.push(BufferedOp::Update {
                table: table.clone(),
                key,
                row_values: RowData::new().with(column, value),
            });
            Ok(())
        })
        .await
    }

    pub async fn delete_row(&self, username: &str, table: &TableRef, key: RowKey) -> LumenResult<()> {
        self.with_active(username, table, |tx| {
            Self::check_key(tx, table, &key)?;
            tx.ops.push(BufferedOp::Delete {
                table: table.clone(),
                key,
            });
            Ok(())
        })
        .await
    }

    /// Buffers an INSERT and returns the key later edits use to reach it.
    pub async fn insert_row(
        &self,
        username: &str,
        table: &TableRef,
        values: RowData,
    ) -> LumenResult<RowKey> {
        if values.is_empty() {
            return Err(LumenError::invalid_input("insert has no values"));
        }
        self.with_active(username, table, |tx| {
            let pending_id = tx.next_pending_id;
            tx.next_pending_id += 1;
            tx.ops.push(BufferedOp::Insert {
                table: table.clone(),
                pending_id,
                row_values: values,
            });
            Ok(RowKey::Pending(pending_id))
        })
        .await
    }

    fn types_for(&self, table: &TableRef) -> ColumnTypes {
        self.cache
            .table(table)
            .map(|t| t.column_types())
            .unwrap_or_default()
    }

    fn plan_statements(&self, planned: &[PlannedOp]) -> LumenResult<Vec<BoundStatement>> {
        planned
            .iter()
            .map(|op| match op {
                PlannedOp::Insert { table, values } => {
                    Ok(build_insert(table, values, &self.types_for(table)))
                }
                PlannedOp::Update {
                    table,
                    key,
                    assignments,
                } => build_update(table, assignments, key, &self.types_for(table)),
                PlannedOp::Delete { table, key } => build_delete(table, key, &self.types_for(table)),
            })
            .collect()
    }

    async fn apply(handle: &mut dyn RoleHandle, statements: &[BoundStatement]) -> LumenResult<u64> {
        handle.begin().await?;
        let mut affected = 0;
        for statement in statements {
            affected += handle.execute(statement).await?;
        }
        handle.commit().await?;
        Ok(affected)
    }

    /// Applies the buffered ops atomically as the user.
    ///
    /// If the connection cannot be opened the transaction stays active so the
    /// user can retry. Once statements run, any failure rolls everything back
    /// and ends the transaction.
    #[instrument(skip(self, credential, cancel), fields(username = %credential.username))]
    pub async fn commit(
        &self,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> LumenResult<CommitOutcome> {
        let username = credential.username.as_str();
        let slot = self.slot(username);
        let mut guard = slot.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(LumenError::no_active_transaction(username));
        };
        if self.is_expired(tx) {
            *guard = None;
            return Err(LumenError::transaction_expired(username));
        }

        let planned = coalesce(&tx.ops);
        if planned.is_empty() {
            *guard = None;
            debug!("nothing to commit");
            return Ok(CommitOutcome {
                affected_rows: 0,
                statements: 0,
            });
        }
        let statements = self.plan_statements(&planned)?;
        let database = tx.table.database.clone();

        let mut handle = self.broker.open(&database, credential, cancel).await?;

        let applied = run_cancellable(cancel, Self::apply(handle.as_mut(), &statements)).await;
        *guard = None;

        match applied {
            Ok(affected_rows) => {
                let _ = handle.close().await;
                metrics::record_commit(true);
                info!(affected_rows, statements = statements.len(), "transaction committed");
                Ok(CommitOutcome {
                    affected_rows,
                    statements: statements.len(),
                })
            }
            Err(LumenError::Cancelled) => {
                // Dropping the connection aborts the open server transaction.
                drop(handle);
                metrics::record_cancel();
                metrics::record_commit(false);
                warn!("commit cancelled");
                Err(LumenError::Cancelled)
            }
            Err(err) => {
                if let Err(rollback_err) = handle.rollback().await {
                    warn!(code = rollback_err.code(), "rollback after failed commit also failed");
                }
                let _ = handle.close().await;
                metrics::record_commit(false);
                warn!(code = err.code(), cause = ?err.cause(), "commit failed, rolled back");
                let cause = err
                    .cause()
                    .map(str::to_string)
                    .or_else(|| Some(err.to_string()));
                Err(LumenError::commit_failed("transaction rolled back", cause))
            }
        }
    }

    /// Ends the transaction without touching the server.
    pub async fn rollback(&self, username: &str) -> LumenResult<()> {
        let slot = self.slot(username);
        let mut guard = slot.lock().await;
        match guard.take() {
            Some(_) => {
                info!(username, "transaction rolled back");
                Ok(())
            }
            None => Err(LumenError::no_active_transaction(username)),
        }
    }

    fn describe(&self, tx: Option<&Transaction>) -> TransactionStatus {
        match tx {
            None => TransactionStatus {
                state: TransactionState::None,
                active: false,
                remaining_seconds: 0,
                edit_count: 0,
                delete_count: 0,
                insert_count: 0,
                table: None,
                started_at: None,
            },
            Some(tx) => {
                let expired = self.is_expired(tx);
                TransactionStatus {
                    state: if expired {
                        TransactionState::Expired
                    } else {
                        TransactionState::Active
                    },
                    active: !expired,
                    remaining_seconds: self.clock.time_until(tx.expires_at).as_secs(),
                    edit_count: tx.count(|op| matches!(op, BufferedOp::Update { .. })),
                    delete_count: tx.count(|op| matches!(op, BufferedOp::Delete { .. })),
                    insert_count: tx.count(|op| matches!(op, BufferedOp::Insert { .. })),
                    table: Some(tx.table.clone()),
                    started_at: Some(tx.started_at),
                }
            }
        }
    }

    /// Current state; never clears anything.
    pub async fn status(&self, username: &str) -> TransactionStatus {
        let slot = self.slot(username);
        let guard = slot.lock().await;
        self.describe(guard.as_ref())
    }

    /// Marks overdue transactions expired and drops empty slots. Slots busy
    /// with a commit are skipped. Returns how many were marked.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut marked = 0;
        let mut slots = self.slots.lock();
        slots.retain(|_, slot| {
            let Ok(mut guard) = slot.try_lock() else {
                return true;
            };
            match guard.as_mut() {
                Some(tx) => {
                    if !tx.expired && tx.expires_at < now {
                        tx.expired = true;
                        marked += 1;
                    }
                    true
                }
                None => Arc::strong_count(slot) > 1,
            }
        });
        if marked > 0 {
            debug!(marked, "expired transactions marked");
        }
        marked
    }
}
