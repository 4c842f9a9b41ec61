//! Persistence layer: message records, cycle jobs and the account directory.

pub mod accounts;
pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use accounts::{ConnectionStatus, InMemoryAccounts};
pub use libsql_backend::LibSqlStore;
pub use memory::{InMemoryJobLog, InMemoryMessageStore};
pub use traits::{
    CreditLedger, JobLog, MessageRecord, MessageStatus, MessageStore, ProcessingStats, UserProfile,
    UserStore,
};
