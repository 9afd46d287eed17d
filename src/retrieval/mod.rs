//! Retrieval store
//!
//! Top-k similarity lookup over a small passage corpus (policies, docs,
//! FAQs). The index and metric belong to whatever engine sits behind the
//! trait; this crate only fixes the contract: results ordered by
//! descending score with ties broken by ascending source id, at most `k`
//! of them, and identical output for identical calls against an
//! unmodified corpus.

use crate::error::PipelineError;
use crate::models::RetrievedPassage;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

#[async_trait]
pub trait RetrievalStore: Send + Sync {
    /// Search the corpus. Fails with `EmptyCorpus` when nothing is indexed.
    async fn search(&self, query_text: &str, k: usize) -> Result<Vec<RetrievedPassage>>;
}

/// One indexed passage. The corpus is read-only from the pipeline's
/// perspective; updates happen out of band by rebuilding the store.
#[derive(Debug, Clone)]
pub struct CorpusPassage {
    pub source_id: String,
    pub text: String,
}

/// In-memory lexical-overlap store. Stands in for an external similarity
/// engine in the demo binary and in tests; scoring is deterministic for a
/// fixed corpus snapshot.
pub struct InMemoryRetrievalStore {
    passages: Vec<CorpusPassage>,
}

impl InMemoryRetrievalStore {
    pub fn new(passages: Vec<CorpusPassage>) -> Self {
        Self { passages }
    }

    pub fn empty() -> Self {
        Self {
            passages: Vec::new(),
        }
    }

    /// Small built-in corpus covering the three demo domains.
    pub fn with_default_corpus() -> Self {
        let seed = [
            (
                "policy-refunds",
                "Refund policy: purchases may be refunded within 30 days of the original \
                 transaction. Refunds are issued to the original payment method.",
            ),
            (
                "policy-trading-hours",
                "Trading desk policy: orders placed outside regular market hours are queued \
                 and executed at the next market open.",
            ),
            (
                "faq-data-delay",
                "Market data shown in chat is delayed by up to fifteen minutes and is \
                 provided for informational purposes only, not as investment advice.",
            ),
            (
                "docs-python-errors",
                "Python raises a traceback when an unhandled exception occurs. Read the \
                 last line first: it names the exception type and message.",
            ),
            (
                "docs-js-async",
                "JavaScript promises settle exactly once. Use async/await with try/catch \
                 to handle rejections near the call site.",
            ),
        ];

        Self::new(
            seed.into_iter()
                .map(|(source_id, text)| CorpusPassage {
                    source_id: source_id.to_string(),
                    text: text.to_string(),
                })
                .collect(),
        )
    }

    pub fn passage_count(&self) -> usize {
        self.passages.len()
    }
}

#[async_trait]
impl RetrievalStore for InMemoryRetrievalStore {
    async fn search(&self, query_text: &str, k: usize) -> Result<Vec<RetrievedPassage>> {
        if self.passages.is_empty() {
            return Err(PipelineError::EmptyCorpus);
        }

        let query_terms = tokenize(query_text);

        let mut scored: Vec<RetrievedPassage> = self
            .passages
            .iter()
            .filter_map(|passage| {
                let score = overlap_score(&query_terms, &passage.text);
                (score > 0.0).then(|| RetrievedPassage {
                    text: passage.text.clone(),
                    score,
                    source_id: passage.source_id.clone(),
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        scored.truncate(k);

        debug!(
            query = query_text,
            k,
            hits = scored.len(),
            "retrieval search complete"
        );

        Ok(scored)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Term overlap normalized by passage vocabulary size. Not a real
/// similarity metric, but stable: identical inputs always score
/// identically.
fn overlap_score(query_terms: &HashSet<String>, passage_text: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }

    let passage_terms = tokenize(passage_text);
    if passage_terms.is_empty() {
        return 0.0;
    }

    let shared = query_terms.intersection(&passage_terms).count();
    shared as f32 / (passage_terms.len() as f32).sqrt()
}
