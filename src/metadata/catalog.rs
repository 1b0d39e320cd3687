//! Catalog source
//!
//! Reads the cluster layout and every login role's privileges from
//! `pg_catalog`, connecting as the superadmin to each database in turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lumen_core::{
    run_cancellable, CancellationToken, LumenError, LumenResult, QueryResult, TableRef, Value,
};
use lumen_sql::{BoundStatement, ConnectionTarget};
use tracing::{debug, instrument, warn};

use super::model::{
    ClusterMetadata, ColumnMeta, DatabaseMeta, ForeignKeyEdge, Permissions, RoleGrants,
    SchemaMeta, TableMeta,
};
use crate::engine::{Connector, RoleHandle};

/// Everything a full load produces.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub cluster: ClusterMetadata,
    pub grants: Vec<RoleGrants>,
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Cluster layout plus the grants of every login role.
    async fn load(&self, cancel: &CancellationToken) -> LumenResult<CatalogSnapshot>;

    /// Grants of a single role against an already loaded layout. `None`
    /// when no login role has that name.
    async fn load_grants(
        &self,
        cluster: &ClusterMetadata,
        role: &str,
        cancel: &CancellationToken,
    ) -> LumenResult<Option<RoleGrants>>;
}

const ROW_LIMIT: usize = usize::MAX;

const USER_SCHEMAS: &str = "n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast') \
     AND n.nspname NOT LIKE 'pg_temp_%' AND n.nspname NOT LIKE 'pg_toast_temp_%'";

const RELKINDS: &str = "c.relkind IN ('r', 'p', 'v', 'm', 'f')";

const LIST_DATABASES: &str = "SELECT datname::text FROM pg_database \
     WHERE datallowconn AND NOT datistemplate ORDER BY datname";

fn list_schemas() -> String {
    format!(
        "SELECT n.nspname::text FROM pg_namespace n WHERE {} ORDER BY n.nspname",
        USER_SCHEMAS
    )
}

fn list_columns() -> String {
    format!(
        "SELECT n.nspname::text, c.relname::text, a.attname::text, \
                format_type(a.atttypid, a.atttypmod), NOT a.attnotnull, \
                pg_get_expr(d.adbin, d.adrelid), \
                COALESCE(a.attnum = ANY(i.indkey), false) \
         FROM pg_attribute a \
         JOIN pg_class c ON c.oid = a.attrelid \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
         LEFT JOIN pg_index i ON i.indrelid = c.oid AND i.indisprimary \
         WHERE a.attnum > 0 AND NOT a.attisdropped AND {} AND {} \
         ORDER BY n.nspname, c.relname, a.attnum",
        RELKINDS, USER_SCHEMAS
    )
}

const LIST_FOREIGN_KEYS: &str = "SELECT con.conname::text, \
            sn.nspname::text, sc.relname::text, sa.attname::text, \
            tn.nspname::text, tc.relname::text, ta.attname::text \
     FROM pg_constraint con \
     JOIN pg_class sc ON sc.oid = con.conrelid \
     JOIN pg_namespace sn ON sn.oid = sc.relnamespace \
     JOIN pg_class tc ON tc.oid = con.confrelid \
     JOIN pg_namespace tn ON tn.oid = tc.relnamespace \
     CROSS JOIN LATERAL unnest(con.conkey, con.confkey) AS k(src, dst) \
     JOIN pg_attribute sa ON sa.attrelid = con.conrelid AND sa.attnum = k.src \
     JOIN pg_attribute ta ON ta.attrelid = con.confrelid AND ta.attnum = k.dst \
     WHERE con.contype = 'f' \
     ORDER BY con.conname, sa.attnum";

fn role_filter(role: Option<&str>) -> (&'static str, Vec<Value>) {
    match role {
        Some(role) => (" AND r.rolname = $1", vec![Value::Text(role.to_string())]),
        None => ("", Vec::new()),
    }
}

fn login_role(role: &str) -> BoundStatement {
    BoundStatement {
        sql: "SELECT rolname::text FROM pg_roles WHERE rolcanlogin AND rolname = $1".to_string(),
        params: vec![Value::Text(role.to_string())],
    }
}

fn connect_grants(role: Option<&str>) -> BoundStatement {
    let (filter, params) = role_filter(role);
    BoundStatement {
        sql: format!(
            "SELECT r.rolname::text, d.datname::text \
             FROM pg_roles r CROSS JOIN pg_database d \
             WHERE r.rolcanlogin AND d.datallowconn AND NOT d.datistemplate \
               AND has_database_privilege(r.oid, d.oid, 'CONNECT'){} \
             ORDER BY 1, 2",
            filter
        ),
        params,
    }
}

fn usage_grants(role: Option<&str>) -> BoundStatement {
    let (filter, params) = role_filter(role);
    BoundStatement {
        sql: format!(
            "SELECT r.rolname::text, n.nspname::text \
             FROM pg_roles r CROSS JOIN pg_namespace n \
             WHERE r.rolcanlogin AND {} \
               AND has_schema_privilege(r.oid, n.oid, 'USAGE'){}",
            USER_SCHEMAS, filter
        ),
        params,
    }
}

// Column-level grants count: a role with UPDATE on one column can edit the table.
fn table_grants(role: Option<&str>) -> BoundStatement {
    let (filter, params) = role_filter(role);
    BoundStatement {
        sql: format!(
            "SELECT r.rolname::text, n.nspname::text, c.relname::text, \
                    has_any_column_privilege(r.oid, c.oid, 'SELECT'), \
                    has_any_column_privilege(r.oid, c.oid, 'INSERT'), \
                    has_any_column_privilege(r.oid, c.oid, 'UPDATE'), \
                    has_table_privilege(r.oid, c.oid, 'DELETE') \
             FROM pg_roles r CROSS JOIN pg_class c \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE r.rolcanlogin AND {} AND {}{}",
            RELKINDS, USER_SCHEMAS, filter
        ),
        params,
    }
}

fn text_at(result: &QueryResult, row: usize, col: usize) -> LumenResult<String> {
    match result.rows.get(row).and_then(|r| r.values.get(col)) {
        Some(Value::Text(s)) => Ok(s.clone()),
        other => Err(LumenError::internal(format!(
            "catalog row {} column {}: expected text, got {:?}",
            row, col, other
        ))),
    }
}

fn opt_text_at(result: &QueryResult, row: usize, col: usize) -> Option<String> {
    match result.rows.get(row).and_then(|r| r.values.get(col)) {
        Some(Value::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

fn bool_at(result: &QueryResult, row: usize, col: usize) -> bool {
    matches!(
        result.rows.get(row).and_then(|r| r.values.get(col)),
        Some(Value::Bool(true))
    )
}

/// Production source backed by the superadmin connection string.
pub struct PgCatalogSource {
    connector: Arc<dyn Connector>,
    superadmin: ConnectionTarget,
}

impl PgCatalogSource {
    pub fn new(connector: Arc<dyn Connector>, superadmin: ConnectionTarget) -> Self {
        Self {
            connector,
            superadmin,
        }
    }

    async fn connect(
        &self,
        database: &str,
        cancel: &CancellationToken,
    ) -> LumenResult<Box<dyn RoleHandle>> {
        let target = self.superadmin.with_database(database);
        run_cancellable(cancel, self.connector.connect(&target)).await
    }

    async fn fetch(
        handle: &mut Box<dyn RoleHandle>,
        statement: &BoundStatement,
        cancel: &CancellationToken,
    ) -> LumenResult<QueryResult> {
        run_cancellable(cancel, handle.query(statement, ROW_LIMIT)).await
    }

    /// Schemas, tables, columns and foreign keys of one database.
    async fn load_database(
        &self,
        database: &str,
        cancel: &CancellationToken,
    ) -> LumenResult<(DatabaseMeta, Vec<ForeignKeyEdge>)> {
        let mut handle = self.connect(database, cancel).await?;
        let loaded = Self::read_layout(&mut handle, database, cancel).await;
        let _ = handle.close().await;
        loaded
    }

    async fn read_layout(
        handle: &mut Box<dyn RoleHandle>,
        database: &str,
        cancel: &CancellationToken,
    ) -> LumenResult<(DatabaseMeta, Vec<ForeignKeyEdge>)> {
        let schemas = Self::fetch(handle, &BoundStatement::new(list_schemas()), cancel).await?;
        let columns = Self::fetch(handle, &BoundStatement::new(list_columns()), cancel).await?;
        let fks = Self::fetch(handle, &BoundStatement::new(LIST_FOREIGN_KEYS), cancel).await?;

        let mut tables: BTreeMap<String, Vec<TableMeta>> = BTreeMap::new();
        for i in 0..columns.rows.len() {
            let schema = text_at(&columns, i, 0)?;
            let table = text_at(&columns, i, 1)?;
            let column = ColumnMeta {
                name: text_at(&columns, i, 2)?,
                data_type: text_at(&columns, i, 3)?,
                nullable: bool_at(&columns, i, 4),
                default: opt_text_at(&columns, i, 5),
                is_primary_key: bool_at(&columns, i, 6),
            };
            let entries = tables.entry(schema).or_default();
            match entries.last_mut() {
                Some(last) if last.name == table => last.columns.push(column),
                _ => entries.push(TableMeta {
                    name: table,
                    columns: vec![column],
                }),
            }
        }

        let mut schema_list = Vec::with_capacity(schemas.rows.len());
        for i in 0..schemas.rows.len() {
            let name = text_at(&schemas, i, 0)?;
            let tables = tables.remove(&name).unwrap_or_default();
            schema_list.push(SchemaMeta { name, tables });
        }

        let mut edges = Vec::with_capacity(fks.rows.len());
        for i in 0..fks.rows.len() {
            edges.push(ForeignKeyEdge {
                constraint: text_at(&fks, i, 0)?,
                source: TableRef::new(database, text_at(&fks, i, 1)?, text_at(&fks, i, 2)?),
                source_column: text_at(&fks, i, 3)?,
                target: TableRef::new(database, text_at(&fks, i, 4)?, text_at(&fks, i, 5)?),
                target_column: text_at(&fks, i, 6)?,
            });
        }

        Ok((
            DatabaseMeta {
                name: database.to_string(),
                schemas: schema_list,
            },
            edges,
        ))
    }

    /// Fills `grants` with the USAGE and table privileges found in one
    /// database, creating entries for roles seen for the first time.
    async fn read_grants(
        &self,
        database: &str,
        role: Option<&str>,
        grants: &mut BTreeMap<String, RoleGrants>,
        cancel: &CancellationToken,
    ) -> LumenResult<()> {
        let mut handle = self.connect(database, cancel).await?;
        let usage = Self::fetch(&mut handle, &usage_grants(role), cancel).await;
        let tables = Self::fetch(&mut handle, &table_grants(role), cancel).await;
        let _ = handle.close().await;
        let (usage, tables) = (usage?, tables?);

        for i in 0..usage.rows.len() {
            let role = text_at(&usage, i, 0)?;
            let schema = text_at(&usage, i, 1)?;
            grants
                .entry(role.clone())
                .or_insert_with(|| RoleGrants::new(role))
                .usage
                .insert((database.to_string(), schema));
        }

        for i in 0..tables.rows.len() {
            let mut perms = Permissions::empty();
            for (col, perm) in [
                (3, Permissions::SELECT),
                (4, Permissions::INSERT),
                (5, Permissions::UPDATE),
                (6, Permissions::DELETE),
            ] {
                if bool_at(&tables, i, col) {
                    perms |= perm;
                }
            }
            if perms.is_empty() {
                continue;
            }
            let role = text_at(&tables, i, 0)?;
            let table = TableRef::new(database, text_at(&tables, i, 1)?, text_at(&tables, i, 2)?);
            grants
                .entry(role.clone())
                .or_insert_with(|| RoleGrants::new(role))
                .tables
                .insert(table, perms);
        }
        Ok(())
    }

    async fn read_connect_grants(
        &self,
        role: Option<&str>,
        grants: &mut BTreeMap<String, RoleGrants>,
        cancel: &CancellationToken,
    ) -> LumenResult<()> {
        let mut handle = self.connect(&self.superadmin.database, cancel).await?;
        let connect = Self::fetch(&mut handle, &connect_grants(role), cancel).await;
        let _ = handle.close().await;
        let connect = connect?;

        for i in 0..connect.rows.len() {
            let role = text_at(&connect, i, 0)?;
            let database = text_at(&connect, i, 1)?;
            grants
                .entry(role.clone())
                .or_insert_with(|| RoleGrants::new(role))
                .connect
                .insert(database);
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogSource for PgCatalogSource {
    #[instrument(skip(self, cancel), fields(server = %self.superadmin.display_name()))]
    async fn load(&self, cancel: &CancellationToken) -> LumenResult<CatalogSnapshot> {
        let mut handle = self.connect(&self.superadmin.database, cancel).await?;
        let listed = Self::fetch(&mut handle, &BoundStatement::new(LIST_DATABASES), cancel).await;
        let _ = handle.close().await;
        let listed = listed?;

        let mut databases = Vec::new();
        let mut foreign_keys = Vec::new();
        let mut grants = BTreeMap::new();
        self.read_connect_grants(None, &mut grants, cancel).await?;

        for i in 0..listed.rows.len() {
            let name = text_at(&listed, i, 0)?;
            match self.load_database(&name, cancel).await {
                Ok((db, edges)) => {
                    databases.push(db);
                    foreign_keys.extend(edges);
                    self.read_grants(&name, None, &mut grants, cancel).await?;
                }
                Err(err @ (LumenError::Cancelled | LumenError::Timeout { .. })) => return Err(err),
                Err(err) => {
                    warn!(database = %name, code = err.code(), "skipping database the superadmin cannot read");
                }
            }
        }

        debug!(
            databases = databases.len(),
            roles = grants.len(),
            "catalog loaded"
        );
        Ok(CatalogSnapshot {
            cluster: ClusterMetadata::new(databases, foreign_keys),
            grants: grants.into_values().collect(),
        })
    }

    #[instrument(skip(self, cluster, cancel))]
    async fn load_grants(
        &self,
        cluster: &ClusterMetadata,
        role: &str,
        cancel: &CancellationToken,
    ) -> LumenResult<Option<RoleGrants>> {
        let mut handle = self.connect(&self.superadmin.database, cancel).await?;
        let found = Self::fetch(&mut handle, &login_role(role), cancel).await;
        let _ = handle.close().await;
        if found?.rows.is_empty() {
            debug!("no login role with that name");
            return Ok(None);
        }

        let mut grants = BTreeMap::new();
        self.read_connect_grants(Some(role), &mut grants, cancel).await?;
        for database in cluster.database_names() {
            self.read_grants(&database, Some(role), &mut grants, cancel)
                .await?;
        }
        Ok(Some(
            grants
                .remove(role)
                .unwrap_or_else(|| RoleGrants::new(role)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_role_lookup_is_bound() {
        let lookup = login_role("x' OR true --");
        assert!(lookup.sql.ends_with("rolname = $1"));
        assert_eq!(lookup.params, vec![Value::Text("x' OR true --".into())]);
    }

    #[test]
    fn test_role_filter_binds_name() {
        let all = table_grants(None);
        assert!(all.params.is_empty());
        assert!(!all.sql.contains("$1"));

        let one = table_grants(Some("alice"));
        assert!(one.sql.ends_with("AND r.rolname = $1"));
        assert_eq!(one.params, vec![Value::Text("alice".into())]);
    }

    #[test]
    fn test_catalog_queries_skip_system_schemas() {
        assert!(list_columns().contains("'pg_catalog'"));
        assert!(usage_grants(None).sql.contains("'information_schema'"));
        assert!(connect_grants(None).sql.contains("'CONNECT'"));
    }
}
