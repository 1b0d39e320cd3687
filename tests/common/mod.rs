//! In-memory PostgreSQL stand-ins shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lumen_core::{
    ColumnInfo, LumenError, LumenResult, ManualClock, QueryResult, Row, TableRef, Value,
};
use lumen_pg::config::Config;
use lumen_pg::engine::{Connector, RoleHandle};
use lumen_pg::metadata::{
    CatalogSnapshot, CatalogSource, ClusterMetadata, ColumnMeta, DatabaseMeta, ForeignKeyEdge,
    Permissions, RoleGrants, SchemaMeta, TableMeta,
};
use lumen_pg::AppState;
use lumen_sql::{BoundStatement, ConnectionTarget};
use parking_lot::Mutex;

pub const START_UNIX: i64 = 1_700_000_000;
pub const KEY_HEX: &str = "8f1c2a9e4b7d6053a1e2f3c4d5b6a79881726354453627180f1e2d3c4b5a6978";

/// One statement as the server saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Logged {
    pub role: String,
    pub database: String,
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct ServerState {
    passwords: HashMap<String, String>,
    connect_denied: HashSet<(String, String)>,
    unreachable: bool,
    failures: Vec<(String, LumenError)>,
    responses: Vec<(String, QueryResult)>,
    log: Vec<Logged>,
    opened: usize,
    closed: usize,
}

/// Scriptable server: who may log in, what fails, what queries return.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(self, role: &str, secret: &str) -> Self {
        self.state
            .lock()
            .passwords
            .insert(role.to_string(), secret.to_string());
        self
    }

    /// The server refuses CONNECT for `role` on `database`.
    pub fn deny_connect(&self, role: &str, database: &str) {
        self.state
            .lock()
            .connect_denied
            .insert((role.to_string(), database.to_string()));
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Any statement containing `pattern` fails with `error`.
    pub fn fail_on(&self, pattern: &str, error: LumenError) {
        self.state.lock().failures.push((pattern.to_string(), error));
    }

    /// Statements containing `pattern` return `result`; first match wins.
    pub fn respond(&self, pattern: &str, result: QueryResult) {
        self.state
            .lock()
            .responses
            .push((pattern.to_string(), result));
    }

    pub fn log(&self) -> Vec<Logged> {
        self.state.lock().log.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.log().into_iter().map(|l| l.sql).collect()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            server: self.clone(),
        })
    }

    fn run(&self, role: &str, database: &str, statement: &BoundStatement) -> LumenResult<QueryResult> {
        let mut state = self.state.lock();
        state.log.push(Logged {
            role: role.to_string(),
            database: database.to_string(),
            sql: statement.sql.clone(),
            params: statement.params.clone(),
        });
        if let Some((_, err)) = state
            .failures
            .iter()
            .find(|(pattern, _)| statement.sql.contains(pattern.as_str()))
        {
            return Err(err.clone());
        }
        Ok(state
            .responses
            .iter()
            .find(|(pattern, _)| statement.sql.contains(pattern.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(QueryResult::empty))
    }
}

struct FakeConnector {
    server: FakeServer,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &ConnectionTarget) -> LumenResult<Box<dyn RoleHandle>> {
        let mut state = self.server.state.lock();
        if state.unreachable {
            return Err(LumenError::connection_failed(
                "Failed to connect to PostgreSQL",
                Some("connection refused".into()),
            ));
        }
        let supplied = target.password.as_ref().map(|p| p.expose().as_str());
        if state.passwords.get(&target.username).map(String::as_str) != supplied {
            return Err(LumenError::auth_failed(
                &target.username,
                Some("password authentication failed".into()),
            ));
        }
        if state
            .connect_denied
            .contains(&(target.username.clone(), target.database.clone()))
        {
            return Err(LumenError::permission_denied(
                format!("cannot connect to {}", target.database),
                Some("permission denied for database".into()),
            ));
        }
        state.opened += 1;
        Ok(Box::new(FakeHandle {
            server: self.server.clone(),
            role: target.username.clone(),
            database: target.database.clone(),
        }))
    }
}

struct FakeHandle {
    server: FakeServer,
    role: String,
    database: String,
}

#[async_trait]
impl RoleHandle for FakeHandle {
    fn role(&self) -> &str {
        &self.role
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn query(&mut self, statement: &BoundStatement, cap: usize) -> LumenResult<QueryResult> {
        match statement.sql.as_str() {
            "SELECT current_user::text" => return Ok(single("current_user", Value::Text(self.role.clone()))),
            "SELECT 1" => return Ok(single("?column?", Value::Int(1))),
            _ => {}
        }
        let mut result = self.server.run(&self.role, &self.database, statement)?;
        result.total_size = result.rows.len() as i64;
        result.rows.truncate(cap);
        Ok(result)
    }

    async fn execute(&mut self, statement: &BoundStatement) -> LumenResult<u64> {
        let result = self.server.run(&self.role, &self.database, statement)?;
        Ok(if result.affected_rows > 0 {
            result.affected_rows as u64
        } else {
            1
        })
    }

    async fn begin(&mut self) -> LumenResult<()> {
        self.server
            .run(&self.role, &self.database, &BoundStatement::new("BEGIN"))
            .map(|_| ())
    }

    async fn commit(&mut self) -> LumenResult<()> {
        self.server
            .run(&self.role, &self.database, &BoundStatement::new("COMMIT"))
            .map(|_| ())
    }

    async fn rollback(&mut self) -> LumenResult<()> {
        self.server
            .run(&self.role, &self.database, &BoundStatement::new("ROLLBACK"))
            .map(|_| ())
    }

    async fn close(self: Box<Self>) -> LumenResult<()> {
        self.server.state.lock().closed += 1;
        Ok(())
    }
}

pub fn single(column: &str, value: Value) -> QueryResult {
    rows(&[column], vec![vec![value]])
}

pub fn rows(columns: &[&str], values: Vec<Vec<Value>>) -> QueryResult {
    QueryResult {
        columns: columns
            .iter()
            .map(|name| ColumnInfo {
                name: name.to_string(),
                data_type: "unknown".into(),
            })
            .collect(),
        total_size: values.len() as i64,
        rows: values.into_iter().map(|values| Row { values }).collect(),
        is_select: true,
        affected_rows: 0,
    }
}

/// Catalog answering from a fixed snapshot.
pub struct StaticCatalog {
    snapshot: CatalogSnapshot,
    grant_loads: Arc<AtomicUsize>,
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn load(&self, _cancel: &lumen_core::CancellationToken) -> LumenResult<CatalogSnapshot> {
        Ok(self.snapshot.clone())
    }

    async fn load_grants(
        &self,
        _cluster: &ClusterMetadata,
        role: &str,
        _cancel: &lumen_core::CancellationToken,
    ) -> LumenResult<Option<RoleGrants>> {
        self.grant_loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.snapshot.grants.iter().find(|g| g.role == role).cloned())
    }
}

fn column(name: &str, data_type: &str, pk: bool) -> ColumnMeta {
    ColumnMeta {
        name: name.into(),
        data_type: data_type.into(),
        nullable: !pk,
        default: None,
        is_primary_key: pk,
    }
}

fn table(name: &str, columns: Vec<ColumnMeta>) -> TableMeta {
    TableMeta {
        name: name.into(),
        columns,
    }
}

pub fn app(table: &str) -> TableRef {
    TableRef::new("app", "public", table)
}

fn fk(constraint: &str, source: &str, column: &str) -> ForeignKeyEdge {
    ForeignKeyEdge {
        constraint: constraint.into(),
        source: app(source),
        source_column: column.into(),
        target: app("customers"),
        target_column: "id".into(),
    }
}

/// `app.public.{customers, orders, invoices}` where orders and invoices
/// reference customers, and `reports.public.summary`.
///
/// alice: CONNECT app and reports; all on customers; SELECT+UPDATE on
/// orders; nothing on invoices; SELECT on summary.
/// bob: CONNECT reports; SELECT on summary.
/// carol: no grants.
pub fn catalog() -> CatalogSnapshot {
    let app_db = DatabaseMeta {
        name: "app".into(),
        schemas: vec![SchemaMeta {
            name: "public".into(),
            tables: vec![
                table(
                    "customers",
                    vec![column("id", "integer", true), column("name", "text", false)],
                ),
                table(
                    "orders",
                    vec![
                        column("id", "integer", true),
                        column("customer_id", "integer", false),
                        column("total", "numeric(10,2)", false),
                    ],
                ),
                table(
                    "invoices",
                    vec![column("id", "integer", true), column("customer_id", "integer", false)],
                ),
            ],
        }],
    };
    let reports_db = DatabaseMeta {
        name: "reports".into(),
        schemas: vec![SchemaMeta {
            name: "public".into(),
            tables: vec![table(
                "summary",
                vec![column("id", "integer", true), column("label", "text", false)],
            )],
        }],
    };
    let cluster = ClusterMetadata::new(
        vec![app_db, reports_db],
        vec![
            fk("orders_customer_fk", "orders", "customer_id"),
            fk("invoices_customer_fk", "invoices", "customer_id"),
        ],
    );

    let summary = TableRef::new("reports", "public", "summary");

    let mut alice = RoleGrants::new("alice");
    alice.connect.extend(["app".to_string(), "reports".to_string()]);
    alice.usage.insert(("app".into(), "public".into()));
    alice.usage.insert(("reports".into(), "public".into()));
    alice.tables.insert(
        app("customers"),
        Permissions::SELECT | Permissions::INSERT | Permissions::UPDATE | Permissions::DELETE,
    );
    alice
        .tables
        .insert(app("orders"), Permissions::SELECT | Permissions::UPDATE);
    alice.tables.insert(summary.clone(), Permissions::SELECT);

    let mut bob = RoleGrants::new("bob");
    bob.connect.insert("reports".into());
    bob.usage.insert(("reports".into(), "public".into()));
    bob.tables.insert(summary, Permissions::SELECT);

    CatalogSnapshot {
        cluster,
        grants: vec![alice, bob, RoleGrants::new("carol")],
    }
}

pub fn config() -> Config {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("LUMEN_SUPERADMIN_URL", "postgres://admin:root@pg:5432/postgres"),
        ("LUMEN_ENCRYPTION_KEY", KEY_HEX),
    ]);
    Config::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
        .expect("test config is valid")
}

pub struct Harness {
    pub state: AppState,
    pub server: FakeServer,
    pub clock: Arc<ManualClock>,
    /// Single-role grant reloads served by the catalog.
    pub grant_loads: Arc<AtomicUsize>,
}

/// An `AppState` over the fake server with the catalog already loaded.
pub async fn harness() -> Harness {
    let server = FakeServer::new()
        .with_role("alice", "wonderland")
        .with_role("bob", "builder")
        .with_role("carol", "singer");
    let clock = Arc::new(ManualClock::at_unix(START_UNIX));
    let grant_loads = Arc::new(AtomicUsize::new(0));
    let state = AppState::with_parts(
        &config(),
        server.connector(),
        Arc::new(StaticCatalog {
            snapshot: catalog(),
            grant_loads: grant_loads.clone(),
        }),
        clock.clone(),
    );
    state
        .cache
        .load_all(&lumen_core::CancellationToken::new())
        .await
        .expect("static catalog loads");
    Harness {
        state,
        server,
        clock,
        grant_loads,
    }
}
