//! Shared fixtures: scripted LLMs, mock engines and canned app state.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use delver::core::{AppState, MemoryMetricsSink, ResearchContext, SearchError, SearchResult, StaticSettings};
use delver::engines::{EngineServices, SearchEngine};
use delver::LlmProvider;

/// LLM stub driven by a routing closure over the prompt text.
pub struct FnLlm(pub Box<dyn Fn(&str) -> String + Send + Sync>);

impl FnLlm {
    pub fn new(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self(Box::new(f)))
    }
}

#[async_trait]
impl LlmProvider for FnLlm {
    async fn invoke(&self, prompt: &str) -> Result<String, SearchError> {
        Ok((self.0)(prompt))
    }
}

/// One scripted behavior per `get_previews` call.
#[derive(Clone)]
pub enum MockBehavior {
    Previews(Vec<SearchResult>),
    RateLimited,
    Transport,
}

/// Scripted engine: pops one behavior per call, repeating the last one when
/// the script runs dry.
pub struct MockEngine {
    name: String,
    script: std::sync::Mutex<Vec<MockBehavior>>,
    pub preview_calls: AtomicUsize,
    pub full_content_calls: AtomicUsize,
    max_results: usize,
    available: bool,
    full_search: bool,
}

impl MockEngine {
    pub fn new(name: &str, script: Vec<MockBehavior>) -> Self {
        Self {
            name: name.to_string(),
            script: std::sync::Mutex::new(script),
            preview_calls: AtomicUsize::new(0),
            full_content_calls: AtomicUsize::new(0),
            max_results: 10,
            available: true,
            full_search: false,
        }
    }

    pub fn with_max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_full_search(mut self) -> Self {
        self.full_search = true;
        self
    }
}

#[async_trait]
impl SearchEngine for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn supports_full_search(&self) -> bool {
        self.full_search
    }

    fn max_results(&self) -> usize {
        self.max_results
    }

    async fn get_previews(&self, _query: &str) -> Result<Vec<SearchResult>, SearchError> {
        self.preview_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        let behavior = if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().cloned().unwrap_or(MockBehavior::Previews(vec![]))
        };
        match behavior {
            MockBehavior::Previews(previews) => Ok(previews),
            MockBehavior::RateLimited => Err(SearchError::rate_limited("scripted")),
            MockBehavior::Transport => Err(SearchError::Transport("scripted".into())),
        }
    }

    async fn get_full_content(
        &self,
        previews: Vec<SearchResult>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.full_content_calls.fetch_add(1, Ordering::SeqCst);
        Ok(previews
            .into_iter()
            .map(|mut p| {
                p.content = Some(format!("full content for {}", p.id));
                p
            })
            .collect())
    }
}

pub fn previews(engine: &str, n: usize) -> Vec<SearchResult> {
    (0..n)
        .map(|i| {
            SearchResult::preview(
                format!("{engine}-{i}"),
                format!("Title {i} from {engine}"),
                format!("https://{engine}.example.com/{i}"),
                format!("Snippet {i} from {engine}"),
                engine,
            )
        })
        .collect()
}

/// AppState with unpersisted tracker and an in-memory metrics sink.
pub fn test_state() -> (AppState, Arc<MemoryMetricsSink>) {
    let metrics = Arc::new(MemoryMetricsSink::new());
    let state = AppState::with_settings(
        reqwest::Client::new(),
        Arc::new(StaticSettings::new().set("rate_limiting.persist", false)),
    )
    .with_metrics(metrics.clone());
    (state, metrics)
}

pub fn services(state: &AppState) -> EngineServices {
    EngineServices::from_state(state, CancellationToken::new())
}

pub fn context() -> ResearchContext {
    ResearchContext::default()
}
