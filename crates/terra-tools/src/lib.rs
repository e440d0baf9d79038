//! The tool layer: translates model tool calls into store and corpus
//! operations and renders structured XML results back to the model.
//!
//! Domain failures (duplicate terms, missing entries, blocked writes) are
//! values routed back to the model as `<tool_error>` results; only
//! storage-layer failures escape upward.

pub mod dispatcher;
pub mod schemas;
pub mod summon;
pub mod xml;

pub use dispatcher::{DispatchError, SceneStats, ToolDispatcher, ToolOutcome};
pub use summon::SummonState;
