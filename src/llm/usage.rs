//! Token accounting shared by all clients.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time token usage for one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub llm_calls: u64,
}

/// Lock-free running totals, safe to read while a run is in flight.
#[derive(Debug, Default)]
pub struct TokenAccumulator {
    input: AtomicU64,
    output: AtomicU64,
    calls: AtomicU64,
}

impl TokenAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one completed call.
    pub fn record(&self, input_tokens: u64, output_tokens: u64) {
        self.input.fetch_add(input_tokens, Ordering::Relaxed);
        self.output.fetch_add(output_tokens, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TokenUsage {
        let input_tokens = self.input.load(Ordering::Relaxed);
        let output_tokens = self.output.load(Ordering::Relaxed);
        TokenUsage {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            llm_calls: self.calls.load(Ordering::Relaxed),
        }
    }
}
