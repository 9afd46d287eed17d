//! Intent classifier
//!
//! Cheap, synchronous, keyword-based routing that decides which external
//! data providers (if any) a request needs and whether the retrieval store
//! should be consulted. Total: every message gets a classification, with
//! generic/no-extra-context as the default.

use serde::{Deserialize, Serialize};

use crate::providers::{DOCS, MARKET_DATA, NEWS, SANDBOX};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    StockQuote,
    MarketNews,
    Recommendation,
    CodeExecution,
    DocLookup,
    Generic,
}

/// Result of classifying one request.
#[derive(Debug, Clone)]
pub struct Classification {
    pub intent: Intent,
    /// Provider names to query, in fetch-issue order.
    pub providers: Vec<&'static str>,
    pub use_retrieval: bool,
    /// Ticker symbol extracted from the message, when one is present.
    pub symbol: Option<String>,
}

impl Classification {
    fn generic() -> Self {
        Self {
            intent: Intent::Generic,
            providers: Vec::new(),
            use_retrieval: false,
            symbol: None,
        }
    }
}

const CODE_KEYWORDS: &[&str] = &[
    "run this", "execute", "my code", "this code", "python", "javascript", "script", "stack trace",
    "traceback", "syntax error",
];

const RECOMMENDATION_KEYWORDS: &[&str] = &[
    "should i", "recommend", "recommendation", "analyze", "analysis", "buy", "sell", "outlook",
    "advice",
];

const QUOTE_KEYWORDS: &[&str] = &["price", "quote", "trading at", "ticker", "worth", "how much is"];

const NEWS_KEYWORDS: &[&str] = &["news", "headline", "article", "happening with", "latest on"];

const DOC_KEYWORDS: &[&str] = &[
    "what is", "what are", "how do", "how does", "explain", "policy", "refund", "documentation",
    "docs", "faq",
];

/// Classify a raw message into an intent plus the context sources it needs.
pub fn classify(raw_text: &str) -> Classification {
    let lowered = raw_text.to_lowercase();
    let has_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));
    let symbol = extract_symbol(raw_text);

    // Priority order matters: "should I buy AAPL" must route to
    // recommendation even though "AAPL" alone would satisfy a quote.
    if has_any(CODE_KEYWORDS) {
        return Classification {
            intent: Intent::CodeExecution,
            providers: vec![SANDBOX],
            use_retrieval: true,
            symbol: None,
        };
    }

    if has_any(RECOMMENDATION_KEYWORDS) && symbol.is_some() {
        return Classification {
            intent: Intent::Recommendation,
            providers: vec![MARKET_DATA, NEWS],
            use_retrieval: true,
            symbol,
        };
    }

    if has_any(QUOTE_KEYWORDS) && symbol.is_some() {
        return Classification {
            intent: Intent::StockQuote,
            providers: vec![MARKET_DATA],
            use_retrieval: false,
            symbol,
        };
    }

    if has_any(NEWS_KEYWORDS) {
        return Classification {
            intent: Intent::MarketNews,
            providers: vec![NEWS],
            use_retrieval: false,
            symbol,
        };
    }

    if has_any(DOC_KEYWORDS) {
        return Classification {
            intent: Intent::DocLookup,
            providers: vec![DOCS],
            use_retrieval: true,
            symbol: None,
        };
    }

    Classification::generic()
}

/// Extract the first token that looks like a ticker symbol: 2-5 ASCII
/// uppercase letters as written by the user, punctuation stripped.
fn extract_symbol(raw_text: &str) -> Option<String> {
    raw_text
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .find(|word| {
            word.len() >= 2 && word.len() <= 5 && word.chars().all(|c| c.is_ascii_uppercase())
        })
        .map(|word| word.to_string())
}
