//! Resumable stage execution: ledgers, resume planning, call classification
//! and the generic executor every pipeline stage runs through.

pub mod adapter;
pub mod clock;
pub mod executor;
pub mod identity;
pub mod join;
pub mod ledger;
pub mod planner;

pub use adapter::{CallAdapter, Invocation, Outcome, PermanentFailure, RetryPolicy};
pub use clock::{Clock, ManualClock, RateLimiter, SystemClock};
pub use executor::{
    append_line, list_ids, write_atomic, Completion, ExecutionContext, Stage, StageExecutor,
    StageReport, StageSettings, StatusVocabulary,
};
pub use identity::{resolve, Metadata, WorkItem};
pub use join::{join, join_with, JoinedRow, Row, Table};
pub use ledger::{read_entries, Ledger, LedgerEntry, LedgerState, LedgerStatus, Metrics};
pub use planner::{plan, Plan};
