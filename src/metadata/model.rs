//! Cluster schema and per-role reachability

use std::collections::{BTreeMap, BTreeSet, HashMap};

use lumen_core::TableRef;
use lumen_sql::ColumnTypes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    /// `format_type` rendering, usable as a cast target.
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
}

impl TableMeta {
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key columns in column order; empty when the table has none.
    pub fn primary_key(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn column_types(&self) -> ColumnTypes {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.data_type.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaMeta {
    pub name: String,
    pub tables: Vec<TableMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseMeta {
    pub name: String,
    pub schemas: Vec<SchemaMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ForeignKeyEdge {
    pub constraint: String,
    pub source: TableRef,
    pub source_column: String,
    pub target: TableRef,
    pub target_column: String,
}

/// Position of a table inside the database/schema/table vectors.
type Slot = (usize, usize, usize);

/// Every database, schema, table and foreign key in the cluster.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterMetadata {
    pub databases: Vec<DatabaseMeta>,
    pub foreign_keys: Vec<ForeignKeyEdge>,
    #[serde(skip)]
    index: HashMap<TableRef, Slot>,
}

impl ClusterMetadata {
    /// Builds the table index and drops FK edges whose endpoints do not
    /// resolve to a known column.
    pub fn new(databases: Vec<DatabaseMeta>, foreign_keys: Vec<ForeignKeyEdge>) -> Self {
        let mut index = HashMap::new();
        for (d, db) in databases.iter().enumerate() {
            for (s, schema) in db.schemas.iter().enumerate() {
                for (t, table) in schema.tables.iter().enumerate() {
                    index.insert(TableRef::new(&db.name, &schema.name, &table.name), (d, s, t));
                }
            }
        }

        let mut cluster = Self {
            databases,
            foreign_keys: Vec::new(),
            index,
        };
        let resolved: Vec<ForeignKeyEdge> = foreign_keys
            .into_iter()
            .filter(|fk| {
                cluster.has_column(&fk.source, &fk.source_column)
                    && cluster.has_column(&fk.target, &fk.target_column)
            })
            .collect();
        cluster.foreign_keys = resolved;
        cluster
    }

    pub fn table(&self, table: &TableRef) -> Option<&TableMeta> {
        let (d, s, t) = *self.index.get(table)?;
        self.databases
            .get(d)?
            .schemas
            .get(s)?
            .tables
            .get(t)
    }

    fn has_column(&self, table: &TableRef, column: &str) -> bool {
        self.table(table)
            .map(|t| t.column(column).is_some())
            .unwrap_or(false)
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseMeta> {
        self.databases.iter().find(|d| d.name == name)
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.iter().map(|d| d.name.clone()).collect()
    }

    pub fn foreign_keys_from(&self, table: &TableRef) -> impl Iterator<Item = &ForeignKeyEdge> {
        let table = table.clone();
        self.foreign_keys.iter().filter(move |fk| fk.source == table)
    }

    pub fn foreign_keys_to<'a>(
        &'a self,
        table: &TableRef,
        column: &'a str,
    ) -> impl Iterator<Item = &'a ForeignKeyEdge> {
        let table = table.clone();
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.target == table && fk.target_column == column)
    }
}

bitflags::bitflags! {
    /// Privileges a role holds on a database, schema or table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
    pub struct Permissions: u8 {
        const CONNECT = 1;
        const USAGE = 1 << 1;
        const SELECT = 1 << 2;
        const INSERT = 1 << 3;
        const UPDATE = 1 << 4;
        const DELETE = 1 << 5;
    }
}

impl Permissions {
    /// Any of SELECT, INSERT, UPDATE or DELETE.
    pub fn table_level() -> Permissions {
        Self::SELECT | Self::INSERT | Self::UPDATE | Self::DELETE
    }

    pub fn writes() -> Permissions {
        Self::INSERT | Self::UPDATE | Self::DELETE
    }
}

/// Raw privileges of one login role as read from the catalogs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleGrants {
    pub role: String,
    /// Databases with CONNECT.
    pub connect: BTreeSet<String>,
    /// `(database, schema)` pairs with USAGE.
    pub usage: BTreeSet<(String, String)>,
    /// Table-level privileges (SELECT/INSERT/UPDATE/DELETE bits only).
    pub tables: BTreeMap<TableRef, Permissions>,
}

impl RoleGrants {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Self::default()
        }
    }
}

/// What one role can reach, in cluster order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleView {
    pub role: String,
    pub databases: Vec<String>,
    pub schemas: BTreeMap<String, Vec<String>>,
    pub tables: BTreeMap<(String, String), Vec<String>>,
    pub permissions: HashMap<TableRef, Permissions>,
}

impl RoleView {
    pub fn empty(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Self::default()
        }
    }

    /// A table is reachable only through a schema with USAGE inside a
    /// database with CONNECT. A database with CONNECT is listed even when
    /// none of its schemas is reachable.
    pub fn build(cluster: &ClusterMetadata, grants: &RoleGrants) -> Self {
        let mut view = Self::empty(&grants.role);

        for db in &cluster.databases {
            if !grants.connect.contains(&db.name) {
                continue;
            }
            view.databases.push(db.name.clone());
            let mut schemas = Vec::new();

            for schema in &db.schemas {
                if !grants.usage.contains(&(db.name.clone(), schema.name.clone())) {
                    continue;
                }
                schemas.push(schema.name.clone());
                let mut tables = Vec::new();

                for table in &schema.tables {
                    let table_ref = TableRef::new(&db.name, &schema.name, &table.name);
                    let granted = grants
                        .tables
                        .get(&table_ref)
                        .copied()
                        .unwrap_or(Permissions::empty());
                    if !granted.intersects(Permissions::table_level()) {
                        continue;
                    }
                    tables.push(table.name.clone());
                    view.permissions
                        .insert(table_ref, granted | Permissions::CONNECT | Permissions::USAGE);
                }

                view.tables
                    .insert((db.name.clone(), schema.name.clone()), tables);
            }

            view.schemas.insert(db.name.clone(), schemas);
        }

        view
    }

    pub fn can_connect(&self, database: &str) -> bool {
        self.databases.iter().any(|d| d == database)
    }

    pub fn permissions(&self, table: &TableRef) -> Permissions {
        self.permissions
            .get(table)
            .copied()
            .unwrap_or(Permissions::empty())
    }

    pub fn schemas_of(&self, database: &str) -> &[String] {
        self.schemas.get(database).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tables_of(&self, database: &str, schema: &str) -> &[String] {
        self.tables
            .get(&(database.to_string(), schema.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First reachable `(database, schema?, table?)` in cluster order,
    /// preferring `preferred_db` when the role can connect to it.
    pub fn initial_location(
        &self,
        preferred_db: &str,
    ) -> Option<(String, Option<String>, Option<String>)> {
        let database = if self.can_connect(preferred_db) {
            preferred_db.to_string()
        } else {
            self.databases.first()?.clone()
        };
        let schemas = self.schemas_of(&database);
        let schema = schemas
            .iter()
            .find(|s| !self.tables_of(&database, s).is_empty())
            .or_else(|| schemas.first())
            .cloned();
        let table = schema
            .as_ref()
            .and_then(|s| self.tables_of(&database, s).first().cloned());
        Some((database, schema, table))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn column(name: &str, data_type: &str, pk: bool) -> ColumnMeta {
        ColumnMeta {
            name: name.into(),
            data_type: data_type.into(),
            nullable: !pk,
            default: None,
            is_primary_key: pk,
        }
    }

    pub fn table(name: &str, columns: Vec<ColumnMeta>) -> TableMeta {
        TableMeta {
            name: name.into(),
            columns,
        }
    }

    /// `app.public.{customers, orders}` with orders.customer_id → customers.id,
    /// plus `app.audit.log` and an empty `reports` database.
    pub fn cluster() -> ClusterMetadata {
        let public = SchemaMeta {
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
            ],
        };
        let audit = SchemaMeta {
            name: "audit".into(),
            tables: vec![table("log", vec![column("entry", "text", false)])],
        };
        ClusterMetadata::new(
            vec![
                DatabaseMeta {
                    name: "app".into(),
                    schemas: vec![public, audit],
                },
                DatabaseMeta {
                    name: "reports".into(),
                    schemas: vec![SchemaMeta {
                        name: "public".into(),
                        tables: vec![],
                    }],
                },
            ],
            vec![
                ForeignKeyEdge {
                    constraint: "orders_customer_fk".into(),
                    source: TableRef::new("app", "public", "orders"),
                    source_column: "customer_id".into(),
                    target: TableRef::new("app", "public", "customers"),
                    target_column: "id".into(),
                },
                ForeignKeyEdge {
                    constraint: "dangling".into(),
                    source: TableRef::new("app", "public", "orders"),
                    source_column: "missing".into(),
                    target: TableRef::new("app", "public", "customers"),
                    target_column: "id".into(),
                },
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::cluster;
    use super::*;

    fn grants() -> RoleGrants {
        let mut g = RoleGrants::new("alice");
        g.connect.insert("app".into());
        g.connect.insert("reports".into());
        g.usage.insert(("app".into(), "public".into()));
        g.tables.insert(
            TableRef::new("app", "public", "orders"),
            Permissions::SELECT | Permissions::UPDATE,
        );
        // No USAGE on audit, so this grant is unreachable.
        g.tables
            .insert(TableRef::new("app", "audit", "log"), Permissions::SELECT);
        g
    }

    #[test]
    fn test_unresolved_fk_edges_dropped() {
        let c = cluster();
        assert_eq!(c.foreign_keys.len(), 1);
        assert_eq!(c.foreign_keys[0].constraint, "orders_customer_fk");
        let orders = TableRef::new("app", "public", "orders");
        assert_eq!(c.foreign_keys_from(&orders).count(), 1);
        let customers = TableRef::new("app", "public", "customers");
        assert_eq!(c.foreign_keys_to(&customers, "id").count(), 1);
        assert_eq!(c.foreign_keys_to(&customers, "name").count(), 0);
    }

    #[test]
    fn test_table_lookup() {
        let c = cluster();
        let orders = c.table(&TableRef::new("app", "public", "orders")).unwrap();
        assert_eq!(orders.primary_key(), vec!["id"]);
        assert_eq!(
            orders.column_types().get("total").map(String::as_str),
            Some("numeric(10,2)")
        );
        assert!(c.table(&TableRef::new("app", "public", "nope")).is_none());
    }

    #[test]
    fn test_role_view_requires_usage_and_connect() {
        let view = RoleView::build(&cluster(), &grants());
        assert_eq!(view.databases, vec!["app", "reports"]);
        assert_eq!(view.schemas_of("app"), ["public".to_string()]);
        assert_eq!(view.tables_of("app", "public"), ["orders".to_string()]);
        assert!(view.tables_of("app", "audit").is_empty());

        let perms = view.permissions(&TableRef::new("app", "public", "orders"));
        assert!(perms.contains(Permissions::SELECT | Permissions::CONNECT | Permissions::USAGE));
        assert!(!perms.contains(Permissions::DELETE));
        assert!(view
            .permissions(&TableRef::new("app", "audit", "log"))
            .is_empty());
    }

    #[test]
    fn test_database_listed_without_schemas() {
        let mut g = RoleGrants::new("bob");
        g.connect.insert("reports".into());
        let view = RoleView::build(&cluster(), &g);
        assert_eq!(view.databases, vec!["reports"]);
        assert!(view.schemas_of("reports").is_empty());
        assert_eq!(
            view.initial_location("app"),
            Some(("reports".to_string(), None, None))
        );
    }

    #[test]
    fn test_initial_location_prefers_probed_db() {
        let view = RoleView::build(&cluster(), &grants());
        assert_eq!(
            view.initial_location("app"),
            Some((
                "app".to_string(),
                Some("public".to_string()),
                Some("orders".to_string())
            ))
        );
        assert!(RoleView::empty("x").initial_location("app").is_none());
    }

    #[test]
    fn test_permissions_serialize_as_names() {
        let perms = Permissions::SELECT | Permissions::DELETE;
        let json = serde_json::to_string(&perms).unwrap();
        assert_eq!(json, r#""SELECT | DELETE""#);
        assert_eq!(serde_json::from_str::<Permissions>(&json).unwrap(), perms);
        assert!(Permissions::default().is_empty());
        assert!(perms.intersects(Permissions::writes()));
        assert!(!perms.contains(Permissions::table_level()));
    }
}
