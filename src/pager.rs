//! Result pager
//!
//! Two strategies over a role-authenticated handle: keyset cursors for
//! infinite scrolling and offset pages for jump-to-page. Both stop at the
//! hard cap; rows past it are never fetched.

use lumen_core::{LumenResult, QueryResult, TableRef, Value};
use lumen_sql::generator::{build_count, build_cursor_page, build_offset_page};
use lumen_sql::{ColumnTypes, PageOrder, PagePosition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::RoleHandle;

pub const HARD_CAP: u64 = 1000;
pub const MAX_PAGE_SIZE: u64 = 50;

fn default_hard_cap() -> u64 {
    HARD_CAP
}

/// Keyset position plus how much has been loaded so far.
///
/// A cursor with `total_loaded == 0` has no position yet. The hard cap is
/// server-side state and never travels with the cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_sort_value: Value,
    pub last_tiebreak_id: Vec<Value>,
    pub page_size: u64,
    pub total_loaded: u64,
    #[serde(skip, default = "default_hard_cap")]
    pub hard_cap: u64,
}

impl Cursor {
    /// `page_size` is clamped into `1..=50`.
    pub fn new(page_size: u64) -> Self {
        Self {
            last_sort_value: Value::Null,
            last_tiebreak_id: Vec::new(),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            total_loaded: 0,
            hard_cap: HARD_CAP,
        }
    }

    pub fn with_hard_cap(mut self, hard_cap: u64) -> Self {
        self.hard_cap = hard_cap.clamp(1, HARD_CAP);
        self
    }

    pub fn can_load_more(&self) -> bool {
        self.total_loaded < self.hard_cap
    }

    /// Rows the next page may request.
    pub fn next_limit(&self) -> u64 {
        self.page_size
            .min(self.hard_cap.saturating_sub(self.total_loaded))
    }

    pub fn position(&self) -> Option<PagePosition> {
        (self.total_loaded > 0).then(|| PagePosition {
            sort_value: self.last_sort_value.clone(),
            tiebreak: self.last_tiebreak_id.clone(),
        })
    }

    /// Moves past `emitted` rows ending at `(last_value, last_id)`.
    pub fn advance(&mut self, last_value: Value, last_id: Vec<Value>, emitted: u64) {
        if emitted == 0 {
            return;
        }
        self.last_sort_value = last_value;
        self.last_tiebreak_id = last_id;
        self.total_loaded = (self.total_loaded + emitted).min(self.hard_cap);
    }
}

/// One cursor page. `total_size` counts the rows of this page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TablePage {
    #[serde(flatten)]
    pub result: QueryResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

impl TablePage {
    /// The empty, final page.
    pub fn exhausted() -> Self {
        Self {
            result: QueryResult::empty(),
            next_cursor: None,
            has_more: false,
        }
    }
}

/// One offset page. `result.total_size` is the truthful row count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OffsetPage {
    #[serde(flatten)]
    pub result: QueryResult,
    pub offset: u64,
    pub limit: u64,
    pub total_count: i64,
    pub accessible_count: i64,
    pub truncated: bool,
}

/// What to read: table, guarded filter and the column types used for casts.
pub struct PageSource<'a> {
    pub table: &'a TableRef,
    pub filter: Option<&'a str>,
    pub types: &'a ColumnTypes,
}

#[derive(Debug, Clone, Copy)]
pub struct Pager {
    pub page_size: u64,
    pub hard_cap: u64,
}

impl Default for Pager {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            hard_cap: HARD_CAP,
        }
    }
}

impl Pager {
    pub fn new(page_size: u64, hard_cap: u64) -> Self {
        Self {
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            hard_cap: hard_cap.clamp(1, HARD_CAP),
        }
    }

    /// A fresh cursor with this pager's limits.
    pub fn cursor(&self, page_size: Option<u64>) -> Cursor {
        Cursor::new(page_size.unwrap_or(self.page_size)).with_hard_cap(self.hard_cap)
    }

    /// Re-applies this pager's limits to a cursor handed back by a client.
    pub fn resume(&self, cursor: Cursor) -> Cursor {
        let mut cursor = cursor.with_hard_cap(self.hard_cap);
        cursor.page_size = cursor.page_size.clamp(1, MAX_PAGE_SIZE);
        cursor.total_loaded = cursor.total_loaded.min(cursor.hard_cap);
        cursor
    }

    pub async fn fetch_cursor_page(
        &self,
        handle: &mut dyn RoleHandle,
        source: &PageSource<'_>,
        order: &PageOrder,
        cursor: &Cursor,
    ) -> LumenResult<TablePage> {
        if !cursor.can_load_more() {
            return Ok(TablePage::exhausted());
        }
        let limit = cursor.next_limit();
        let position = cursor.position();
        let Some(statement) = build_cursor_page(
            source.table,
            source.filter,
            order,
            position.as_ref(),
            limit,
            source.types,
        ) else {
            return Ok(TablePage::exhausted());
        };

        let mut result = handle.query(&statement, limit as usize).await?;
        let emitted = result.rows.len() as u64;
        result.total_size = emitted as i64;

        let mut next = cursor.clone();
        if emitted > 0 {
            let last = result.rows.len() - 1;
            let sort_value = result
                .value(last, &order.sort_column)
                .cloned()
                .unwrap_or(Value::Null);
            let tiebreak: Vec<Value> = order
                .tiebreak_columns()
                .into_iter()
                .map(|c| result.value(last, c).cloned().unwrap_or(Value::Null))
                .collect();
            next.advance(sort_value, tiebreak, emitted);
        }

        let has_more = emitted == limit && next.can_load_more();
        debug!(table = %source.table, emitted, total_loaded = next.total_loaded, has_more, "cursor page");
        Ok(TablePage {
            result,
            next_cursor: has_more.then_some(next),
            has_more,
        })
    }

    /// `limit` is clamped into `[1, hard_cap]`, `offset` into `[0, ∞)`.
    /// Positions at or beyond the hard cap are never fetched.
    pub async fn fetch_offset_page(
        &self,
        handle: &mut dyn RoleHandle,
        source: &PageSource<'_>,
        order: Option<&PageOrder>,
        fallback_order: &[String],
        offset: i64,
        limit: i64,
    ) -> LumenResult<OffsetPage> {
        let offset = offset.max(0) as u64;
        let limit = (limit.max(1) as u64).min(self.hard_cap);
        let effective = limit.min(self.hard_cap.saturating_sub(offset));

        let count = handle
            .query(&build_count(source.table, source.filter), 1)
            .await?;
        let total_count = count
            .rows
            .first()
            .and_then(|r| r.values.first())
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let mut result = if effective == 0 {
            QueryResult::empty()
        } else {
            let statement = build_offset_page(
                source.table,
                source.filter,
                order,
                fallback_order,
                offset,
                effective,
            );
            handle.query(&statement, effective as usize).await?
        };
        result.total_size = total_count;

        Ok(OffsetPage {
            result,
            offset,
            limit: effective,
            total_count,
            accessible_count: total_count.min(self.hard_cap as i64),
            truncated: total_count > self.hard_cap as i64,
        })
    }
}
