use crate::core::types::{Citation, Finding};

/// Append-only log of intermediate findings, scoped to one research run.
/// No persistence here — archiving is the outer system's choice.
#[derive(Default)]
pub struct FindingsRepository {
    findings: Vec<Finding>,
    documents: Vec<Citation>,
}

impl FindingsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    pub fn add_documents(&mut self, documents: impl IntoIterator<Item = Citation>) {
        self.documents.extend(documents);
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn documents(&self) -> &[Citation] {
        &self.documents
    }

    pub fn into_findings(self) -> Vec<Finding> {
        self.findings
    }

    /// Render the run's findings into the text block returned to the caller:
    /// current knowledge first, then each phase, then the source list.
    pub fn format_findings_to_text(&self, current_knowledge: &str) -> String {
        let mut out = String::new();

        if !current_knowledge.trim().is_empty() {
            out.push_str(current_knowledge.trim());
            out.push_str("\n\n");
        }

        if !self.findings.is_empty() {
            out.push_str("=== DETAILED FINDINGS ===\n\n");
            for finding in &self.findings {
                out.push_str(&format!("--- {} ---\n", finding.phase));
                if !finding.question.trim().is_empty() {
                    out.push_str(&format!("Question: {}\n", finding.question.trim()));
                }
                out.push_str(finding.content.trim());
                out.push_str("\n\n");
            }
        }

        let mut cited: Vec<&Citation> = self.documents.iter().collect();
        cited.sort_by_key(|c| c.index.parse::<usize>().unwrap_or(usize::MAX));
        cited.dedup_by(|a, b| a.index == b.index);
        if !cited.is_empty() {
            out.push_str("=== SOURCES ===\n");
            for citation in cited {
                out.push_str(&format!("[{}] {} — {}\n", citation.index, citation.title, citation.link));
            }
        }

        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn findings_append_in_order() {
        let mut repo = FindingsRepository::new();
        repo.add(Finding {
            phase: "Iteration 1".into(),
            question: "q1".into(),
            content: "first".into(),
            search_results: vec![],
            documents: vec![],
        });
        repo.add(Finding {
            phase: "Iteration 2".into(),
            question: "q2".into(),
            content: "second".into(),
            search_results: vec![],
            documents: vec![],
        });
        assert_eq!(repo.findings().len(), 2);
        assert_eq!(repo.findings()[0].content, "first");
        assert_eq!(repo.findings()[1].content, "second");
    }

    #[test]
    fn formatting_includes_knowledge_findings_and_sources() {
        let mut repo = FindingsRepository::new();
        repo.add(Finding {
            phase: "Direct Search".into(),
            question: "capital of France".into(),
            content: "Paris is the capital [1].".into(),
            search_results: vec![],
            documents: vec![],
        });
        repo.add_documents(vec![Citation {
            index: "1".into(),
            link: "https://en.wikipedia.org/wiki/Paris".into(),
            title: "Paris".into(),
            snippet: None,
        }]);

        let text = repo.format_findings_to_text("Paris is the capital of France.");
        assert!(text.starts_with("Paris is the capital of France."));
        assert!(text.contains("--- Direct Search ---"));
        assert!(text.contains("=== SOURCES ==="));
        assert!(text.contains("[1] Paris"));
    }

    #[test]
    fn duplicate_source_indices_collapse() {
        let mut repo = FindingsRepository::new();
        let citation = Citation {
            index: "1".into(),
            link: "https://a".into(),
            title: "A".into(),
            snippet: None,
        };
        repo.add_documents(vec![citation.clone(), citation]);
        let text = repo.format_findings_to_text("");
        assert_eq!(text.matches("[1] A").count(), 1);
    }
}
