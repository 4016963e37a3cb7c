//! SQLite-backed persistence and credential pool.
//!
//! [`SqliteStore`] implements both collaborator ports of `mediaflow-core`:
//! it owns the task list, records remote jobs and their progress, downloads
//! finished results and hands out bearer tokens.

pub mod db;
pub mod error;
mod persistence;

pub use db::{DownloadRecord, SqliteStore, TokenRecord};
pub use error::{StoreError, StoreResult};
