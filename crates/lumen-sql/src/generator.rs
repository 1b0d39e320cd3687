// SPDX-License-Identifier: Apache-2.0

//! Parameterized SQL generation
//!
//! Builds every statement the core sends on a user's behalf: buffered
//! INSERT/UPDATE/DELETE at commit time, and the SELECTs behind paging and
//! FK/PK navigation. Identifiers are always quoted; values are always bound
//! parameters, cast to the column's declared type when it is known so that
//! text coming from a form lands in an integer or enum column correctly.

use std::collections::BTreeMap;

use lumen_core::{LumenError, LumenResult, RowData, SortDirection, TableRef, Value};
use serde::Serialize;

/// Column name → declared SQL type (`format_type` rendering).
pub type ColumnTypes = BTreeMap<String, String>;

/// SQL text plus the values for its `$n` placeholders, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl BoundStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"`; the database is selected by the connection.
pub fn qualified_table(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.table))
}

#[derive(Default)]
struct Params<'a> {
    values: Vec<Value>,
    types: Option<&'a ColumnTypes>,
}

impl<'a> Params<'a> {
    fn typed(types: &'a ColumnTypes) -> Self {
        Self {
            values: Vec::new(),
            types: Some(types),
        }
    }

    /// Registers `value` and returns its placeholder, cast to `column`'s type.
    fn bind(&mut self, column: Option<&str>, value: Value) -> String {
        self.values.push(value);
        let placeholder = format!("${}", self.values.len());
        match column.and_then(|c| self.types.and_then(|t| t.get(c))) {
            Some(sql_type) => format!("{}::{}", placeholder, sql_type),
            None => placeholder,
        }
    }

    fn finish(self, sql: String) -> BoundStatement {
        BoundStatement {
            sql,
            params: self.values,
        }
    }
}

fn where_clause(params: &mut Params<'_>, key: &RowData) -> LumenResult<String> {
    if key.is_empty() {
        return Err(LumenError::invalid_input(
            "row key must name at least one column",
        ));
    }
    let predicates: Vec<String> = key
        .iter()
        .map(|(column, value)| {
            if value.is_null() {
                format!("{} IS NULL", quote_ident(column))
            } else {
                let placeholder = params.bind(Some(column.as_str()), value.clone());
                format!("{} = {}", quote_ident(column), placeholder)
            }
        })
        .collect();
    Ok(predicates.join(" AND "))
}

fn filter_clause(filter: Option<&str>) -> Option<String> {
    filter
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| format!("({})", f))
}

/// `INSERT INTO … (cols) VALUES ($n, …)`, or `DEFAULT VALUES` for an empty row.
pub fn build_insert(table: &TableRef, values: &RowData, types: &ColumnTypes) -> BoundStatement {
    let mut params = Params::typed(types);
    if values.is_empty() {
        return params.finish(format!("INSERT INTO {} DEFAULT VALUES", qualified_table(table)));
    }

    let mut columns = Vec::with_capacity(values.len());
    let mut placeholders = Vec::with_capacity(values.len());
    for (column, value) in values.iter() {
        columns.push(quote_ident(column));
        placeholders.push(params.bind(Some(column.as_str()), value.clone()));
    }

    params.finish(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified_table(table),
        columns.join(", "),
        placeholders.join(", ")
    ))
}

/// `UPDATE … SET … WHERE <key>`. `assignments` keep the caller's order.
pub fn build_update(
    table: &TableRef,
    assignments: &[(String, Value)],
    key: &RowData,
    types: &ColumnTypes,
) -> LumenResult<BoundStatement> {
    if assignments.is_empty() {
        return Err(LumenError::invalid_input("update has no columns to set"));
    }
    let mut params = Params::typed(types);
    let sets: Vec<String> = assignments
        .iter()
        .map(|(column, value)| {
            let placeholder = params.bind(Some(column.as_str()), value.clone());
            format!("{} = {}", quote_ident(column), placeholder)
        })
        .collect();
    let predicate = where_clause(&mut params, key)?;

    Ok(params.finish(format!(
        "UPDATE {} SET {} WHERE {}",
        qualified_table(table),
        sets.join(", "),
        predicate
    )))
}

/// `DELETE FROM … WHERE <key>`
pub fn build_delete(
    table: &TableRef,
    key: &RowData,
    types: &ColumnTypes,
) -> LumenResult<BoundStatement> {
    let mut params = Params::typed(types);
    let predicate = where_clause(&mut params, key)?;
    Ok(params.finish(format!(
        "DELETE FROM {} WHERE {}",
        qualified_table(table),
        predicate
    )))
}

/// `SELECT COUNT(*)` over a table with an optional (already guarded) filter.
pub fn build_count(table: &TableRef, filter: Option<&str>) -> BoundStatement {
    let mut sql = format!("SELECT COUNT(*) FROM {}", qualified_table(table));
    if let Some(clause) = filter_clause(filter) {
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
    }
    BoundStatement::new(sql)
}

/// Sort key for a paged read: the user's column plus the primary key as a
/// tiebreak. `tiebreak` is empty for tables without a primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct PageOrder {
    pub sort_column: String,
    pub direction: SortDirection,
    pub tiebreak: Vec<String>,
}

impl PageOrder {
    fn order_by(&self) -> String {
        let dir = self.direction.keyword();
        let mut terms = vec![format!("{} {} NULLS LAST", quote_ident(&self.sort_column), dir)];
        terms.extend(
            self.tiebreak_columns()
                .into_iter()
                .map(|c| format!("{} {}", quote_ident(c), dir)),
        );
        terms.join(", ")
    }

    /// Tiebreak columns other than the sort column, in key order. A cursor
    /// position carries one value per entry.
    pub fn tiebreak_columns(&self) -> Vec<&str> {
        self.tiebreak
            .iter()
            .filter(|c| **c != self.sort_column)
            .map(String::as_str)
            .collect()
    }
}

fn bind_tiebreak(params: &mut Params<'_>, columns: &[&str], values: &[Value]) -> Vec<String> {
    columns
        .iter()
        .zip(values)
        .map(|(column, value)| params.bind(Some(*column), value.clone()))
        .collect()
}

/// Position of the last row already emitted by a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct PagePosition {
    pub sort_value: Value,
    pub tiebreak: Vec<Value>,
}

/// One cursor page: rows strictly after `after` in `order`, NULL sort values
/// last, at most `limit` rows.
///
/// Returns `None` when no further row can be addressed (a NULL sort value on a
/// table without a tiebreak).
pub fn build_cursor_page(
    table: &TableRef,
    filter: Option<&str>,
    order: &PageOrder,
    after: Option<&PagePosition>,
    limit: u64,
    types: &ColumnTypes,
) -> Option<BoundStatement> {
    let mut params = Params::typed(types);
    let mut predicates: Vec<String> = filter_clause(filter).into_iter().collect();
    let op = order.direction.forward_operator();
    let sort = quote_ident(&order.sort_column);
    let tiebreak = order.tiebreak_columns();

    if let Some(position) = after {
        let tie_columns: Vec<String> = tiebreak.iter().map(|c| quote_ident(c)).collect();
        let has_tiebreak = !tiebreak.is_empty() && position.tiebreak.len() == tiebreak.len();

        let predicate = match (position.sort_value.is_null(), has_tiebreak) {
            (true, false) => return None,
            (true, true) => {
                let tie_values = bind_tiebreak(&mut params, &tiebreak, &position.tiebreak);
                format!(
                    "({} IS NULL AND ({}) {} ({}))",
                    sort,
                    tie_columns.join(", "),
                    op,
                    tie_values.join(", ")
                )
            }
            (false, true) => {
                let sort_value =
                    params.bind(Some(order.sort_column.as_str()), position.sort_value.clone());
                let tie_values = bind_tiebreak(&mut params, &tiebreak, &position.tiebreak);
                format!(
                    "(({}, {}) {} ({}, {}) OR {} IS NULL)",
                    sort,
                    tie_columns.join(", "),
                    op,
                    sort_value,
                    tie_values.join(", "),
                    sort
                )
            }
            (false, false) => {
                let sort_value =
                    params.bind(Some(order.sort_column.as_str()), position.sort_value.clone());
                format!("({} {} {} OR {} IS NULL)", sort, op, sort_value, sort)
            }
        };
        predicates.push(predicate);
    }

    let mut sql = format!("SELECT * FROM {}", qualified_table(table));
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.order_by());
    let limit_placeholder = params.bind(None, Value::Int(limit as i64));
    sql.push_str(" LIMIT ");
    sql.push_str(&limit_placeholder);

    Some(params.finish(sql))
}

/// One offset page. Without an explicit order, rows follow `fallback_order`
/// (usually the primary key) so repeated reads are stable.
pub fn build_offset_page(
    table: &TableRef,
    filter: Option<&str>,
    order: Option<&PageOrder>,
    fallback_order: &[String],
    offset: u64,
    limit: u64,
) -> BoundStatement {
    let mut params = Params::default();
    let mut sql = format!("SELECT * FROM {}", qualified_table(table));
    if let Some(clause) = filter_clause(filter) {
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
    }
    match order {
        Some(order) => {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.order_by());
        }
        None if !fallback_order.is_empty() => {
            let terms: Vec<String> = fallback_order.iter().map(|c| quote_ident(c)).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }
        None => {}
    }
    let limit_placeholder = params.bind(None, Value::Int(limit as i64));
    let offset_placeholder = params.bind(None, Value::Int(offset as i64));
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit_placeholder, offset_placeholder));

    params.finish(sql)
}

/// Rows where `column = value`, capped at `limit`.
pub fn build_lookup(
    table: &TableRef,
    column: &str,
    value: &Value,
    limit: u64,
    types: &ColumnTypes,
) -> BoundStatement {
    let mut params = Params::typed(types);
    let placeholder = params.bind(Some(column), value.clone());
    let limit_placeholder = params.bind(None, Value::Int(limit as i64));
    params.finish(format!(
        "SELECT * FROM {} WHERE {} = {} LIMIT {}",
        qualified_table(table),
        quote_ident(column),
        placeholder,
        limit_placeholder
    ))
}

/// `SELECT COUNT(*)` of rows where `column = value`.
pub fn build_count_matching(
    table: &TableRef,
    column: &str,
    value: &Value,
    types: &ColumnTypes,
) -> BoundStatement {
    let mut params = Params::typed(types);
    let placeholder = params.bind(Some(column), value.clone());
    params.finish(format!(
        "SELECT COUNT(*) FROM {} WHERE {} = {}",
        qualified_table(table),
        quote_ident(column),
        placeholder
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableRef {
        TableRef::new("app", "public", "users")
    }

    fn types() -> ColumnTypes {
        let mut types = ColumnTypes::new();
        types.insert("id".into(), "integer".into());
        types.insert("name".into(), "text".into());
        types.insert("created_at".into(), "timestamp with time zone".into());
        types
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(
            qualified_table(&TableRef::new("db", "Sales", "Order Lines")),
            "\"Sales\".\"Order Lines\""
        );
    }

    #[test]
    fn test_insert_binds_with_casts() {
        let row = RowData::new().with("name", "ada").with("id", 7);
        let stmt = build_insert(&users(), &row, &types());
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\") VALUES ($1::integer, $2::text)"
        );
        assert_eq!(stmt.params, vec![Value::Int(7), Value::Text("ada".into())]);
    }

    #[test]
    fn test_insert_empty_row_uses_defaults() {
        let stmt = build_insert(&users(), &RowData::new(), &types());
        assert_eq!(stmt.sql, "INSERT INTO \"public\".\"users\" DEFAULT VALUES");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_update_and_delete_by_key() {
        let key = RowData::new().with("id", 7);
        let stmt = build_update(
            &users(),
            &[("name".to_string(), Value::Text("grace".into()))],
            &key,
            &types(),
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"public\".\"users\" SET \"name\" = $1::text WHERE \"id\" = $2::integer"
        );
        assert_eq!(stmt.params.len(), 2);

        let stmt = build_delete(&users(), &key, &types()).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM \"public\".\"users\" WHERE \"id\" = $1::integer");
    }

    #[test]
    fn test_null_key_uses_is_null() {
        let mut key = RowData::new().with("id", 1);
        key.insert("name", Value::Null);
        let stmt = build_delete(&users(), &key, &types()).unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM \"public\".\"users\" WHERE \"id\" = $1::integer AND \"name\" IS NULL"
        );
        assert_eq!(stmt.params, vec![Value::Int(1)]);
    }

    #[test]
    fn test_empty_key_is_rejected() {
        assert!(build_delete(&users(), &RowData::new(), &types()).is_err());
        assert!(build_update(&users(), &[], &RowData::new().with("id", 1), &types()).is_err());
    }

    #[test]
    fn test_cursor_first_and_next_page() {
        let order = PageOrder {
            sort_column: "created_at".into(),
            direction: SortDirection::Asc,
            tiebreak: vec!["id".into()],
        };
        let first = build_cursor_page(&users(), Some("name <> ''"), &order, None, 50, &types())
            .unwrap();
        assert_eq!(
            first.sql,
            "SELECT * FROM \"public\".\"users\" WHERE (name <> '') ORDER BY \"created_at\" ASC NULLS LAST, \"id\" ASC LIMIT $1"
        );
        assert_eq!(first.params, vec![Value::Int(50)]);

        let position = PagePosition {
            sort_value: Value::Text("2024-01-01T00:00:00Z".into()),
            tiebreak: vec![Value::Int(9)],
        };
        let next =
            build_cursor_page(&users(), None, &order, Some(&position), 50, &types()).unwrap();
        assert_eq!(
            next.sql,
            "SELECT * FROM \"public\".\"users\" WHERE ((\"created_at\", \"id\") > ($1::timestamp with time zone, $2::integer) OR \"created_at\" IS NULL) ORDER BY \"created_at\" ASC NULLS LAST, \"id\" ASC LIMIT $3"
        );
        assert_eq!(
            next.params,
            vec![
                Value::Text("2024-01-01T00:00:00Z".into()),
                Value::Int(9),
                Value::Int(50)
            ]
        );
    }

    #[test]
    fn test_cursor_desc_on_primary_key() {
        let order = PageOrder {
            sort_column: "id".into(),
            direction: SortDirection::Desc,
            tiebreak: vec!["id".into()],
        };
        let position = PagePosition {
            sort_value: Value::Int(100),
            tiebreak: vec![Value::Int(100)],
        };
        let stmt = build_cursor_page(&users(), None, &order, Some(&position), 10, &types()).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"public\".\"users\" WHERE (\"id\" < $1::integer OR \"id\" IS NULL) ORDER BY \"id\" DESC NULLS LAST LIMIT $2"
        );
    }

    #[test]
    fn test_cursor_null_tail_without_tiebreak_stops() {
        let order = PageOrder {
            sort_column: "name".into(),
            direction: SortDirection::Asc,
            tiebreak: vec![],
        };
        let position = PagePosition {
            sort_value: Value::Null,
            tiebreak: vec![],
        };
        assert!(build_cursor_page(&users(), None, &order, Some(&position), 10, &types()).is_none());
    }

    #[test]
    fn test_offset_page_and_lookup() {
        let stmt = build_offset_page(&users(), None, None, &["id".to_string()], 20, 10);
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"public\".\"users\" ORDER BY \"id\" LIMIT $1 OFFSET $2"
        );
        assert_eq!(stmt.params, vec![Value::Int(10), Value::Int(20)]);

        let stmt = build_lookup(&users(), "id", &Value::Text("3".into()), 25, &types());
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"public\".\"users\" WHERE \"id\" = $1::integer LIMIT $2"
        );

        let stmt = build_count_matching(&users(), "id", &Value::Int(3), &types());
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) FROM \"public\".\"users\" WHERE \"id\" = $1::integer"
        );
        assert_eq!(
            build_count(&users(), Some("  ")).sql,
            "SELECT COUNT(*) FROM \"public\".\"users\""
        );
    }
}
