pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod state;
pub mod types;

pub use config::{FileSettings, SettingsProvider, StaticSettings};
pub use context::{null_progress, ProgressCallback, ResearchContext, ResearchResult};
pub use error::SearchError;
pub use llm::{LlmProvider, OpenAiCompatLlm};
pub use metrics::{MemoryMetricsSink, MetricsSink, NullMetricsSink, SearchMetric};
pub use state::AppState;
pub use types::{Citation, Finding, SearchResult};
