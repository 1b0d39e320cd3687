// SPDX-License-Identifier: Apache-2.0

//! SQL surface for Lumen-PG
//!
//! Statement splitting, classification and WHERE guarding; connection string
//! validation; parameterized statement generation.

pub mod connection_url;
pub mod generator;
pub mod statement;

pub use connection_url::{validate_connection_string, ConnectionTarget, SslMode};
pub use generator::{BoundStatement, ColumnTypes, PageOrder, PagePosition};
pub use statement::{classify, guard_where, split, StatementKind};
