//! Persistence layer — durable storage for rules, campaigns, cursors, and
//! the execution log.

pub mod collaborators;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use collaborators::StoreCollaborators;
pub use libsql_backend::LibSqlStore;
pub use traits::{MessageTemplate, Store, SubjectRecord};
