//! Read-only access to the story corpus and the scene batcher that turns
//! its posts into the runner's work units.

pub mod batcher;
pub mod reader;

pub use batcher::{SceneBatcher, SceneEvent};
pub use reader::{CorpusError, CorpusReader};
