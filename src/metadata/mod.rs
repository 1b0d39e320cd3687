//! Schema metadata and per-role reachability

pub mod cache;
pub mod catalog;
pub mod erd;
pub mod model;

pub use cache::MetadataCache;
pub use catalog::{CatalogSnapshot, CatalogSource, PgCatalogSource};
pub use erd::{ErdColumn, ErdData, ErdEdge, ErdTable};
pub use model::{
    ClusterMetadata, ColumnMeta, DatabaseMeta, ForeignKeyEdge, Permissions, RoleGrants, RoleView,
    SchemaMeta, TableMeta,
};
