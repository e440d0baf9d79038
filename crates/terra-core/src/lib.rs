//! Shared domain types for the terra annotation harness.
//!
//! Everything that crosses a crate boundary lives here: glossary entries
//! and revisions, corpus posts and scenes, chat messages in the
//! OpenAI-compatible wire shape, tagged conversation turns, and the
//! summary records the compactor produces.

pub mod corpus;
pub mod entry;
pub mod messages;
pub mod snapshot;
pub mod summary;
pub mod turn;

/// Current UTC time as an ISO-8601 string, second precision.
pub fn utcnow() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
