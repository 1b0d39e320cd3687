// SPDX-License-Identifier: Apache-2.0

//! Lumen-PG core abstractions
//!
//! Error taxonomy, normalized values and result sets, the clock used for every
//! deadline, cancellation helpers, and the redaction wrapper for secrets.

pub mod cancel;
pub mod clock;
pub mod error;
pub mod sensitive;
pub mod types;

pub use cancel::{run_cancellable, run_with_deadline, CancellationToken};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorKind, ErrorReport, LumenError, LumenResult};
pub use sensitive::Sensitive;
pub use types::{
    ColumnInfo, Credential, QueryResult, Row, RowData, SortDirection, TableRef, Value,
};
