//! Buffered per-user transactions

pub mod buffer;
pub mod engine;

pub use buffer::{coalesce, BufferedOp, PlannedOp, RowKey};
pub use engine::{
    CommitOutcome, TransactionEngine, TransactionState, TransactionStatus, TRANSACTION_TTL_SECS,
};
