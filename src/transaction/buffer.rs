//! Buffered operations and commit-time coalescing

use lumen_core::{RowData, TableRef, Value};
use serde::{Deserialize, Serialize};

/// Identifies a row inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RowKey {
    /// Column → value map matching an existing row, usually its primary key.
    Existing(RowData),
    /// Row inserted earlier in the same transaction.
    Pending(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BufferedOp {
    Insert {
        table: TableRef,
        pending_id: u64,
        row_values: RowData,
    },
    Update {
        table: TableRef,
        key: RowKey,
        row_values: RowData,
    },
    Delete {
        table: TableRef,
        key: RowKey,
    },
}

impl BufferedOp {
    pub fn table(&self) -> &TableRef {
        match self {
            BufferedOp::Insert { table, .. }
            | BufferedOp::Update { table, .. }
            | BufferedOp::Delete { table, .. } => table,
        }
    }
}

/// A statement to run at commit, after coalescing.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedOp {
    Insert {
        table: TableRef,
        values: RowData,
    },
    Update {
        table: TableRef,
        key: RowData,
        assignments: Vec<(String, Value)>,
    },
    Delete {
        table: TableRef,
        key: RowData,
    },
}

enum Entry {
    Insert {
        table: TableRef,
        pending_id: u64,
        values: RowData,
    },
    Update {
        table: TableRef,
        key: RowData,
        assignments: Vec<(String, Value)>,
    },
    Delete {
        table: TableRef,
        key: RowData,
    },
}

/// Folds an op list into the statements to run, preserving append order.
///
/// - Updates to the same existing row merge at the row's first position;
///   the latest value wins per column.
/// - Updates to a pending row fold into its INSERT.
/// - Deleting a pending row drops the INSERT and its edits.
/// - Deleting an existing row drops that row's earlier updates.
pub fn coalesce(ops: &[BufferedOp]) -> Vec<PlannedOp> {
    let mut entries: Vec<Option<Entry>> = Vec::with_capacity(ops.len());

    for op in ops {
        match op {
            BufferedOp::Insert {
                table,
                pending_id,
                row_values,
            } => entries.push(Some(Entry::Insert {
                table: table.clone(),
                pending_id: *pending_id,
                values: row_values.clone(),
            })),

            BufferedOp::Update {
                table,
                key: RowKey::Pending(id),
                row_values,
            } => {
                // Edits of a pending row that was already deleted vanish with it.
                if let Some(Entry::Insert { values, .. }) =
                    find_pending(&mut entries, table, *id)
                {
                    for (column, value) in row_values.iter() {
                        values.insert(column.clone(), value.clone());
                    }
                }
            }

            BufferedOp::Update {
                table,
                key: RowKey::Existing(key),
                row_values,
            } => match find_update(&mut entries, table, key) {
                Some(Entry::Update { assignments, .. }) => {
                    for (column, value) in row_values.iter() {
                        match assignments.iter_mut().find(|(c, _)| c == column) {
                            Some(slot) => slot.1 = value.clone(),
                            None => assignments.push((column.clone(), value.clone())),
                        }
                    }
                }
                _ => entries.push(Some(Entry::Update {
                    table: table.clone(),
                    key: key.clone(),
                    assignments: row_values
                        .iter()
                        .map(|(c, v)| (c.clone(), v.clone()))
                        .collect(),
                })),
            },

            BufferedOp::Delete {
                table,
                key: RowKey::Pending(id),
            } => {
                for entry in entries.iter_mut() {
                    if matches!(entry, Some(Entry::Insert { table: t, pending_id, .. }) if t == table && pending_id == id)
                    {
                        *entry = None;
                    }
                }
            }

            BufferedOp::Delete {
                table,
                key: RowKey::Existing(key),
            } => {
                for entry in entries.iter_mut() {
                    if matches!(entry, Some(Entry::Update { table: t, key: k, .. }) if t == table && k == key)
                    {
                        *entry = None;
                    }
                }
                entries.push(Some(Entry::Delete {
                    table: table.clone(),
                    key: key.clone(),
                }));
            }
        }
    }

    entries
        .into_iter()
        .flatten()
        .map(|entry| match entry {
            Entry::Insert { table, values, .. } => PlannedOp::Insert { table, values },
            Entry::Update {
                table,
                key,
                assignments,
            } => PlannedOp::Update {
                table,
                key,
                assignments,
            },
            Entry::Delete { table, key } => PlannedOp::Delete { table, key },
        })
        .collect()
}

fn find_pending<'a>(
    entries: &'a mut [Option<Entry>],
    table: &TableRef,
    id: u64,
) -> Option<&'a mut Entry> {
    entries.iter_mut().flatten().find(|entry| {
        matches!(entry, Entry::Insert { table: t, pending_id, .. } if t == table && *pending_id == id)
    })
}

/// The live update of an existing row, unless a delete of that row came
/// after it.
fn find_update<'a>(
    entries: &'a mut [Option<Entry>],
    table: &TableRef,
    key: &RowData,
) -> Option<&'a mut Entry> {
    let deleted_at = entries.iter().rposition(|entry| {
        matches!(entry, Some(Entry::Delete { table: t, key: k }) if t == table && k == key)
    });
    let start = deleted_at.map(|i| i + 1).unwrap_or(0);
    entries[start..].iter_mut().flatten().find(|entry| {
        matches!(entry, Entry::Update { table: t, key: k, .. } if t == table && k == key)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t() -> TableRef {
        TableRef::new("app", "public", "items")
    }

    fn key(id: i64) -> RowKey {
        RowKey::Existing(RowData::new().with("id", id))
    }

    fn edit(key: RowKey, column: &str, value: impl Into<Value>) -> BufferedOp {
        BufferedOp::Update {
            table: t(),
            key,
            row_values: RowData::new().with(column, value),
        }
    }

    #[test]
    fn test_insert_then_edit_folds() {
        let ops = vec![
            BufferedOp::Insert {
                table: t(),
                pending_id: 0,
                row_values: RowData::new().with("a", 1),
            },
            edit(RowKey::Pending(0), "a", 2),
        ];
        assert_eq!(
            coalesce(&ops),
            vec![PlannedOp::Insert {
                table: t(),
                values: RowData::new().with("a", 2),
            }]
        );
    }

    #[test]
    fn test_latest_edit_wins_at_first_position() {
        let ops = vec![
            edit(key(1), "name", "a"),
            edit(key(2), "name", "x"),
            edit(key(1), "qty", 5),
            edit(key(1), "name", "b"),
        ];
        assert_eq!(
            coalesce(&ops),
            vec![
                PlannedOp::Update {
                    table: t(),
                    key: RowData::new().with("id", 1),
                    assignments: vec![
                        ("name".to_string(), Value::from("b")),
                        ("qty".to_string(), Value::Int(5)),
                    ],
                },
                PlannedOp::Update {
                    table: t(),
                    key: RowData::new().with("id", 2),
                    assignments: vec![("name".to_string(), Value::from("x"))],
                },
            ]
        );
    }

    #[test]
    fn test_delete_pending_drops_insert_and_edits() {
        let ops = vec![
            BufferedOp::Insert {
                table: t(),
                pending_id: 3,
                row_values: RowData::new().with("a", 1),
            },
            edit(RowKey::Pending(3), "a", 2),
            BufferedOp::Delete {
                table: t(),
                key: RowKey::Pending(3),
            },
            edit(RowKey::Pending(3), "a", 9),
        ];
        assert!(coalesce(&ops).is_empty());
    }

    #[test]
    fn test_delete_existing_discards_earlier_edits() {
        let ops = vec![
            edit(key(1), "name", "a"),
            BufferedOp::Delete {
                table: t(),
                key: key(1),
            },
        ];
        assert_eq!(
            coalesce(&ops),
            vec![PlannedOp::Delete {
                table: t(),
                key: RowData::new().with("id", 1),
            }]
        );
    }

    #[test]
    fn test_edit_after_delete_stays_after_it() {
        let ops = vec![
            edit(key(1), "name", "a"),
            BufferedOp::Delete {
                table: t(),
                key: key(1),
            },
            edit(key(1), "name", "b"),
        ];
        let planned = coalesce(&ops);
        assert_eq!(planned.len(), 2);
        assert!(matches!(planned[0], PlannedOp::Delete { .. }));
        assert!(matches!(planned[1], PlannedOp::Update { .. }));
    }

    #[test]
    fn test_row_key_serialization() {
        let json = serde_json::to_string(&RowKey::Pending(4)).unwrap();
        assert_eq!(json, r#"{"kind":"pending","value":4}"#);
        let parsed: RowKey =
            serde_json::from_str(r#"{"kind":"existing","value":{"id":7}}"#).unwrap();
        assert_eq!(parsed, key(7));
    }
}
