//! LLM-driven relevance filtering of search previews.
//!
//! Two layers: a per-engine filter applied inside `SearchEngine::run`, and a
//! cross-engine filter that ranks the concatenated previews from several
//! engines and owns citation re-indexing.

pub mod cross_engine;
pub mod relevance;

pub use cross_engine::{CrossEngineFilter, CROSS_ENGINE_FILTER_MIN};
pub use relevance::filter_for_relevance;
