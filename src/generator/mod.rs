//! Response generator
//!
//! Wraps the language-model call: a fully assembled prompt context goes
//! in, a complete reply comes out. On timeout or a malformed upstream
//! response the caller receives a typed failure, never a partial reply.

use crate::models::{ContextBundle, RetrievedPassage};
use crate::providers::MARKET_DATA;
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

pub mod llm;
pub use llm::LlmGenerator;

/// Prompt assembly for one request. Rendering order is a correctness
/// contract: request text first, then retrieved passages by descending
/// score (ascending source id on ties), then provider bundles in the
/// order they were issued. Absent context is omitted, never replaced by
/// placeholder text.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    request_text: String,
    passages: Vec<RetrievedPassage>,
    bundles: Vec<ContextBundle>,
}

impl PromptContext {
    pub fn new(request_text: impl Into<String>) -> Self {
        Self {
            request_text: request_text.into(),
            passages: Vec::new(),
            bundles: Vec::new(),
        }
    }

    /// Install retrieved passages, re-asserting the contract ordering in
    /// case the store behind the trait returned them loosely sorted.
    pub fn set_passages(&mut self, mut passages: Vec<RetrievedPassage>) {
        passages.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        self.passages = passages;
    }

    /// Append one provider bundle. Call order must match fetch-issue order.
    pub fn push_bundle(&mut self, bundle: ContextBundle) {
        self.bundles.push(bundle);
    }

    pub fn request_text(&self) -> &str {
        &self.request_text
    }

    pub fn passages(&self) -> &[RetrievedPassage] {
        &self.passages
    }

    pub fn bundles(&self) -> &[ContextBundle] {
        &self.bundles
    }

    /// Render the prompt in the fixed documented order.
    pub fn render(&self) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.request_text);

        if !self.passages.is_empty() {
            prompt.push_str("\n\nReference passages:\n");
            for passage in &self.passages {
                prompt.push_str(&format!("[{}] {}\n", passage.source_id, passage.text));
            }
        }

        for bundle in &self.bundles {
            prompt.push_str(&format!(
                "\n\nContext from {}:\n{}",
                bundle.source_name,
                render_payload(&bundle.payload)
            ));
        }

        prompt
    }
}

fn render_payload(payload: &Value) -> String {
    match payload.as_str() {
        Some(s) => s.to_string(),
        None => payload.to_string(),
    }
}

/// A complete generated reply.
#[derive(Debug, Clone)]
pub struct GeneratedReply {
    pub text: String,
    pub structured_fields: Option<Value>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &PromptContext) -> Result<GeneratedReply>;
}

/// Pull (symbol, price) out of a market-data bundle when one is present.
pub(crate) fn market_quote(prompt: &PromptContext) -> Option<(String, f64)> {
    prompt
        .bundles()
        .iter()
        .find(|b| b.source_name == MARKET_DATA)
        .and_then(|b| {
            let symbol = b.payload.get("symbol")?.as_str()?.to_string();
            let price = b.payload.get("price")?.as_f64()?;
            Some((symbol, price))
        })
}

/// Structured fields carried alongside the reply text when the prompt
/// contains a market quote.
pub(crate) fn structured_fields_from(prompt: &PromptContext) -> Option<Value> {
    market_quote(prompt).map(|(symbol, price)| json!({ "symbol": symbol, "price": price }))
}

/// Deterministic generator for development & testing.
/// Keeps the pipeline functional without an LLM dependency.
pub struct MockGenerator;

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, prompt: &PromptContext) -> Result<GeneratedReply> {
        let mut text = match market_quote(prompt) {
            Some((symbol, price)) => format!("{} is trading at {}.", symbol, price),
            None => format!("Here's what I can tell you about: {}", prompt.request_text()),
        };

        if !prompt.passages().is_empty() {
            text.push_str(&format!(
                " Grounded on {} reference passage(s).",
                prompt.passages().len()
            ));
        }

        Ok(GeneratedReply {
            text,
            structured_fields: structured_fields_from(prompt),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn passage(source_id: &str, score: f32, text: &str) -> RetrievedPassage {
        RetrievedPassage {
            text: text.to_string(),
            score,
            source_id: source_id.to_string(),
        }
    }

    #[test]
    fn test_render_order_is_exact() {
        let mut prompt = PromptContext::new("price of AAPL");
        prompt.set_passages(vec![
            passage("src-b", 0.4, "second passage"),
            passage("src-a", 0.9, "first passage"),
        ]);
        prompt.push_bundle(ContextBundle::new(
            "market_data",
            json!({"price": 190.12, "symbol": "AAPL"}),
            Duration::from_secs(30),
        ));
        prompt.push_bundle(ContextBundle::new(
            "news",
            json!(["headline one"]),
            Duration::from_secs(300),
        ));

        let rendered = prompt.render();
        let expected = "price of AAPL\n\n\
            Reference passages:\n\
            [src-a] first passage\n\
            [src-b] second passage\n\n\n\
            Context from market_data:\n\
            {\"price\":190.12,\"symbol\":\"AAPL\"}\n\n\
            Context from news:\n\
            [\"headline one\"]";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_passage_ties_order_by_source_id() {
        let mut prompt = PromptContext::new("q");
        prompt.set_passages(vec![
            passage("zzz", 0.5, "z"),
            passage("aaa", 0.5, "a"),
            passage("mmm", 0.9, "m"),
        ]);

        let ids: Vec<&str> = prompt
            .passages()
            .iter()
            .map(|p| p.source_id.as_str())
            .collect();
        assert_eq!(ids, vec!["mmm", "aaa", "zzz"]);
    }

    #[test]
    fn test_absent_context_is_omitted_not_placeholder() {
        let prompt = PromptContext::new("just a question");
        let rendered = prompt.render();
        assert_eq!(rendered, "just a question");
        assert!(!rendered.contains("unavailable"));
        assert!(!rendered.contains("Context from"));
    }

    #[tokio::test]
    async fn test_mock_generator_surfaces_market_quote() {
        let mut prompt = PromptContext::new("price of AAPL");
        prompt.push_bundle(ContextBundle::new(
            "market_data",
            json!({"symbol": "AAPL", "price": 190.12}),
            Duration::from_secs(30),
        ));

        let reply = MockGenerator.generate(&prompt).await.unwrap();
        assert!(reply.text.contains("190.12"));
        let fields = reply.structured_fields.unwrap();
        assert_eq!(fields["symbol"], "AAPL");
        assert_eq!(fields["price"], 190.12);
    }

    #[tokio::test]
    async fn test_mock_generator_without_context() {
        let prompt = PromptContext::new("hello there");
        let reply = MockGenerator.generate(&prompt).await.unwrap();
        assert!(reply.text.contains("hello there"));
        assert!(reply.structured_fields.is_none());
    }
}
