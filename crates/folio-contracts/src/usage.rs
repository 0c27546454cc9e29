use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Model name used when a provider response does not say which model ran.
pub const UNKNOWN_MODEL: &str = "unknown";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub candidate_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, candidate_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            candidate_tokens,
            total_tokens,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.candidate_tokens = self.candidate_tokens.saturating_add(other.candidate_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// Cumulative token accounting since the last explicit reset.
///
/// `totals` is always the field-wise sum of `per_model`; documents that
/// disagree are reconciled from the per-model buckets on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageLedger {
    since: DateTime<Utc>,
    totals: TokenUsage,
    per_model: BTreeMap<String, TokenUsage>,
}

#[derive(Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    since: Option<DateTime<Utc>>,
    #[serde(default)]
    per_model: BTreeMap<String, TokenUsage>,
}

impl<'de> Deserialize<'de> for UsageLedger {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let document = LedgerDocument::deserialize(deserializer)?;
        let mut ledger = UsageLedger::new(document.since.unwrap_or_else(Utc::now));
        for (model, usage) in document.per_model {
            ledger.record(&model, usage);
        }
        Ok(ledger)
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl UsageLedger {
    pub fn new(since: DateTime<Utc>) -> Self {
        Self {
            since,
            totals: TokenUsage::default(),
            per_model: BTreeMap::new(),
        }
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn totals(&self) -> TokenUsage {
        self.totals
    }

    pub fn per_model(&self) -> &BTreeMap<String, TokenUsage> {
        &self.per_model
    }

    pub fn model(&self, model: &str) -> Option<TokenUsage> {
        self.per_model.get(model).copied()
    }

    pub fn record(&mut self, model: &str, usage: TokenUsage) {
        let model = match model.trim() {
            "" => UNKNOWN_MODEL,
            named => named,
        };
        self.totals.accumulate(&usage);
        self.per_model
            .entry(model.to_string())
            .or_default()
            .accumulate(&usage);
    }

    pub fn reset(&mut self) {
        self.reset_at(Utc::now());
    }

    pub fn reset_at(&mut self, since: DateTime<Utc>) {
        self.since = since;
        self.totals = TokenUsage::default();
        self.per_model.clear();
    }

    pub fn snapshot(&self) -> UsageLedger {
        self.clone()
    }
}
