//! The research pipeline: findings, citations, strategies and the
//! orchestrator that fronts them.

pub mod citations;
pub mod findings;
pub mod orchestrator;
pub mod strategies;

pub use citations::{CitationHandler, CitationResult};
pub use findings::FindingsRepository;
pub use orchestrator::ResearchOrchestrator;
