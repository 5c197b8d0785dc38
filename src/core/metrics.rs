use std::sync::Mutex;

use serde::Serialize;

/// One per-search row. The schema is the sink's concern — the core only
/// promises these fields.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMetric {
    pub engine: String,
    pub query: String,
    pub result_count: usize,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_id: Option<String>,
}

/// Injected metrics sink. Every `SearchEngine::run` records exactly one row,
/// success or failure.
pub trait MetricsSink: Send + Sync {
    fn record_search(&self, metric: SearchMetric);
}

/// Default sink: drops everything.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record_search(&self, _metric: SearchMetric) {}
}

/// In-memory sink, mainly for tests and ad-hoc inspection.
#[derive(Default)]
pub struct MemoryMetricsSink {
    rows: Mutex<Vec<SearchMetric>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<SearchMetric> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record_search(&self, metric: SearchMetric) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.push(metric);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_accumulates_rows() {
        let sink = MemoryMetricsSink::new();
        sink.record_search(SearchMetric {
            engine: "test".into(),
            query: "q".into(),
            result_count: 3,
            latency_ms: 12,
            success: true,
            error: None,
            research_id: Some("r1".into()),
        });
        let rows = sink.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].engine, "test");
        assert_eq!(rows[0].result_count, 3);
    }
}
