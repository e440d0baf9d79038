//! Durable, transactional persistence for the annotation harness.
//!
//! One SQLite file (`annotator.db`) holds the glossary with its FTS5
//! index, the append-only revision log, snapshots with serialized context,
//! and the run-state singleton. All writes go through a single
//! [`Database`] owned by the runner.

pub mod database;
pub mod error;
pub mod glossary;
pub mod migrations;
pub mod revisions;
mod row_helpers;
pub mod snapshots;
pub mod state;

pub use database::Database;
pub use error::StoreError;
pub use glossary::{GlossaryRepo, SearchOptions, StatusFilter};
pub use revisions::RevisionRepo;
pub use snapshots::{SnapshotContext, SnapshotInput, SnapshotRepo};
pub use state::{RunStateRepo, StateAdvance, ThreadAdvance, ThreadStateRepo};
