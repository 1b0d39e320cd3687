// SPDX-License-Identifier: Apache-2.0

//! Statement surface
//!
//! Three pure functions guard everything user-typed before it reaches the
//! server: [`split`] breaks a script into statements, [`classify`] decides
//! which permission a statement needs, and [`guard_where`] vets a WHERE
//! fragment that is about to be interpolated into a generated query.

use std::sync::OnceLock;

use lumen_core::{LumenError, LumenResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Permission class of a single statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    DmlWrite,
    Ddl,
    Other,
}

impl StatementKind {
    pub fn is_select(self) -> bool {
        matches!(self, StatementKind::Select)
    }
}

/// Splits a script on semicolons that sit outside `'…'` and `"…"` literals.
///
/// Statements come back trimmed; empty ones are dropped.
pub fn split(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in sql.chars() {
        match quote {
            Some(open) => {
                current.push(ch);
                if ch == open {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                ';' => {
                    push_statement(&mut statements, &current);
                    current.clear();
                }
                _ => current.push(ch),
            },
        }
    }
    push_statement(&mut statements, &current);

    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// Classifies a single statement by its leading keyword.
pub fn classify(stmt: &str) -> StatementKind {
    let keyword: String = stmt
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    match keyword.as_str() {
        "SELECT" => StatementKind::Select,
        "WITH" => classify_cte(stmt),
        "INSERT" | "UPDATE" | "DELETE" => StatementKind::DmlWrite,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => StatementKind::Ddl,
        _ => StatementKind::Other,
    }
}

/// A CTE counts as a read only when nothing inside it writes and its main
/// statement is a query.
fn classify_cte(stmt: &str) -> StatementKind {
    let words = bare_words(stmt);

    if words
        .iter()
        .any(|(word, _)| matches!(word.as_str(), "INSERT" | "UPDATE" | "DELETE" | "MERGE"))
    {
        return StatementKind::DmlWrite;
    }

    if let Ok(parsed) = Parser::parse_sql(&PostgreSqlDialect {}, stmt) {
        if matches!(parsed.as_slice(), [Statement::Query(_)]) {
            return StatementKind::Select;
        }
    }

    // Parser gaps (newer Postgres syntax) fall back to the top-level keyword.
    if words
        .iter()
        .any(|(word, depth)| *depth == 0 && word == "SELECT")
    {
        StatementKind::Select
    } else {
        StatementKind::Other
    }
}

/// Upper-cased words outside literals, each with its parenthesis depth.
fn bare_words(stmt: &str) -> Vec<(String, usize)> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;

    for ch in stmt.chars() {
        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            continue;
        }
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch.to_ascii_uppercase());
            continue;
        }
        if !current.is_empty() {
            words.push((std::mem::take(&mut current), depth));
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if !current.is_empty() {
        words.push((current, depth));
    }

    words
}

const BLOCKED_VERBS: [&str; 9] = [
    "drop", "alter", "create", "truncate", "grant", "revoke", "insert", "update", "delete",
];

fn verb_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(&format!(
                r"(?:^|[^a-z0-9_])({})\s",
                BLOCKED_VERBS.join("|")
            ))
            .ok()
        })
        .as_ref()
}

fn blocked_verb(lowered: &str) -> Option<String> {
    match verb_pattern() {
        Some(pattern) => pattern
            .captures(lowered)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string()),
        None => BLOCKED_VERBS
            .iter()
            .find(|verb| lowered.contains(&format!("{} ", verb)))
            .map(|verb| verb.to_string()),
    }
}

/// Vets a WHERE fragment before it is interpolated into a generated query.
///
/// Rejects DDL/DML/DCL verbs, comment openers, statement terminators, and
/// unterminated literals. An empty fragment is accepted.
pub fn guard_where(fragment: &str) -> LumenResult<()> {
    let lowered = fragment.to_lowercase();
    if lowered.trim().is_empty() {
        return Ok(());
    }

    if lowered.contains("--") || lowered.contains("/*") {
        return Err(LumenError::sql_injection("comment sequence in filter"));
    }

    if let Some(verb) = blocked_verb(&lowered) {
        return Err(LumenError::sql_injection(format!(
            "keyword '{}' not allowed in filter",
            verb
        )));
    }

    let mut quote: Option<char> = None;
    for ch in lowered.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                ';' => {
                    return Err(LumenError::sql_injection(
                        "statement terminator in filter",
                    ))
                }
                _ => {}
            },
        }
    }
    if quote.is_some() {
        return Err(LumenError::sql_injection("unterminated literal in filter"));
    }

    Ok(())
}
