//! Persistence: libSQL storage for campaigns, the delivery
//! queue and the pacing ledger.

mod ledger;
pub mod libsql_backend;
pub mod migrations;
pub mod queue;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use queue::LibSqlQueue;
pub use traits::{Candidate, Database, StepAdvance};
