//! ERD data for one schema as seen by one role.

use std::collections::HashSet;

use lumen_core::TableRef;
use serde::Serialize;

use super::model::{ClusterMetadata, RoleView};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErdColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub is_pk: bool,
    pub is_fk: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErdTable {
    pub name: String,
    pub columns: Vec<ErdColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErdEdge {
    pub from_table: String,
    pub from_col: String,
    pub to_table: String,
    pub to_col: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErdData {
    pub tables: Vec<ErdTable>,
    pub edges: Vec<ErdEdge>,
}

impl ErdData {
    /// Tables are the role's reachable tables in `database.schema`; an edge
    /// is kept only when both ends are reachable.
    pub fn build(cluster: &ClusterMetadata, view: &RoleView, database: &str, schema: &str) -> Self {
        let visible: Vec<TableRef> = view
            .tables_of(database, schema)
            .iter()
            .map(|t| TableRef::new(database, schema, t))
            .collect();
        let visible_set: HashSet<&TableRef> = visible.iter().collect();

        let mut tables = Vec::with_capacity(visible.len());
        let mut edges = Vec::new();
        for table_ref in &visible {
            let Some(meta) = cluster.table(table_ref) else {
                continue;
            };
            let outgoing: Vec<_> = cluster.foreign_keys_from(table_ref).collect();

            tables.push(ErdTable {
                name: meta.name.clone(),
                columns: meta
                    .columns
                    .iter()
                    .map(|c| ErdColumn {
                        name: c.name.clone(),
                        data_type: c.data_type.clone(),
                        is_pk: c.is_primary_key,
                        is_fk: outgoing.iter().any(|fk| fk.source_column == c.name),
                    })
                    .collect(),
            });

            edges.extend(
                outgoing
                    .into_iter()
                    .filter(|fk| visible_set.contains(&fk.target))
                    .map(|fk| ErdEdge {
                        from_table: fk.source.table.clone(),
                        from_col: fk.source_column.clone(),
                        to_table: fk.target.table.clone(),
                        to_col: fk.target_column.clone(),
                    }),
            );
        }

        Self { tables, edges }
    }
}
