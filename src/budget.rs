//! Token budget allocation.
//!
//! Partitions a model's context window into instruction, retrieval, history,
//! and response allotments by ratio, and greedily picks retrieval chunks that
//! fit an allotment.
//!
//! # Greedy selection
//!
//! [`select_chunks_with_budget`] makes one pass in relevance order. A chunk
//! that would overflow the remaining budget is *skipped* and the pass goes
//! on, so a smaller, less relevant chunk later in the list can still be
//! picked. This is best-effort, not optimal packing, and it must not be
//! turned into an early exit: that changes how many chunks get selected.
//!
//! ```text
//! tokens [2000, 2000, 1000], budget 3000  →  picks #1 and #3
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::ContextChunk;

/// Allowed distance of the ratio sum from 1.0.
pub const RATIO_TOLERANCE: f64 = 0.01;

/// Share of the context window given to each category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetRatios {
    #[serde(default = "default_instructions")]
    pub instructions: f64,
    #[serde(default = "default_retrieval")]
    pub retrieval: f64,
    #[serde(default = "default_history")]
    pub history: f64,
    #[serde(default = "default_response")]
    pub response: f64,
}

fn default_instructions() -> f64 {
    0.20
}
fn default_retrieval() -> f64 {
    0.40
}
fn default_history() -> f64 {
    0.30
}
fn default_response() -> f64 {
    0.10
}

impl Default for BudgetRatios {
    fn default() -> Self {
        Self {
            instructions: default_instructions(),
            retrieval: default_retrieval(),
            history: default_history(),
            response: default_response(),
        }
    }
}

impl BudgetRatios {
    pub fn new(instructions: f64, retrieval: f64, history: f64, response: f64) -> Self {
        Self {
            instructions,
            retrieval,
            history,
            response,
        }
    }

    pub fn with_instructions(self, instructions: f64) -> Self {
        Self {
            instructions,
            ..self
        }
    }

    pub fn with_retrieval(self, retrieval: f64) -> Self {
        Self { retrieval, ..self }
    }

    pub fn with_history(self, history: f64) -> Self {
        Self { history, ..self }
    }

    pub fn with_response(self, response: f64) -> Self {
        Self { response, ..self }
    }

    pub fn sum(&self) -> f64 {
        self.instructions + self.retrieval + self.history + self.response
    }

    /// Every ratio must lie in `[0, 1]` and the four must sum to 1.0 within
    /// [`RATIO_TOLERANCE`]. The allocator never renormalizes.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("instructions", self.instructions),
            ("retrieval", self.retrieval),
            ("history", self.history),
            ("response", self.response),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(Error::Validation(format!(
                    "ratio '{}' must be in [0.0, 1.0], got {}",
                    name, value
                )));
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > RATIO_TOLERANCE {
            return Err(Error::Validation(format!(
                "ratios must sum to 1.0 (±{}), got {:.4}",
                RATIO_TOLERANCE, sum
            )));
        }
        Ok(())
    }
}

/// Resolved limits of the target model, injected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub max_context_tokens: usize,
    pub max_output_tokens: usize,
}

/// Token allotments per category. Each category is
/// `floor(total * ratio)`, so the parts may fall a few tokens short of `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetAllocation {
    pub instructions: usize,
    pub retrieval: usize,
    pub history: usize,
    pub response: usize,
    pub total: usize,
}

impl BudgetAllocation {
    pub fn allocated(&self) -> usize {
        self.instructions + self.retrieval + self.history + self.response
    }
}

pub fn get_budget(max_tokens: usize, ratios: &BudgetRatios) -> BudgetAllocation {
    let part = |ratio: f64| (max_tokens as f64 * ratio).floor().max(0.0) as usize;
    BudgetAllocation {
        instructions: part(ratios.instructions),
        retrieval: part(ratios.retrieval),
        history: part(ratios.history),
        response: part(ratios.response),
        total: max_tokens,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetAllocator {
    max_tokens: usize,
    ratios: BudgetRatios,
}

impl BudgetAllocator {
    pub fn new(max_tokens: usize, ratios: BudgetRatios) -> Self {
        Self { max_tokens, ratios }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn ratios(&self) -> &BudgetRatios {
        &self.ratios
    }

    pub fn budget(&self) -> BudgetAllocation {
        get_budget(self.max_tokens, &self.ratios)
    }

    /// Whether the three input categories fit beside the response reserve.
    pub fn can_fit(&self, instr_tokens: usize, ctx_tokens: usize, hist_tokens: usize) -> bool {
        self.can_fit_with_margin(instr_tokens, ctx_tokens, hist_tokens, 0.0)
    }

    /// Like [`can_fit`](Self::can_fit), with the available space shrunk by
    /// `margin` (a fraction in `[0, 1)`) first.
    pub fn can_fit_with_margin(
        &self,
        instr_tokens: usize,
        ctx_tokens: usize,
        hist_tokens: usize,
        margin: f64,
    ) -> bool {
        let available = self.max_tokens.saturating_sub(self.budget().response);
        let margin = margin.clamp(0.0, 1.0);
        let available = (available as f64 * (1.0 - margin)).floor() as usize;
        instr_tokens
            .saturating_add(ctx_tokens)
            .saturating_add(hist_tokens)
            <= available
    }
}

/// Order candidates most relevant first. Ties keep a stable path order.
pub fn sort_by_relevance(chunks: &mut [ContextChunk]) {
    chunks.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source_path.cmp(&b.source_path))
    });
}

/// Single greedy pass, skipping (not stopping at) chunks that do not fit.
pub fn select_chunks_with_budget(chunks: &[ContextChunk], budget: usize) -> Vec<ContextChunk> {
    select_chunks_with_limit(chunks, budget, usize::MAX)
}

/// Greedy selection with an additional cap on the number of chunks.
pub fn select_chunks_with_limit(
    chunks: &[ContextChunk],
    budget: usize,
    max_count: usize,
) -> Vec<ContextChunk> {
    let mut selected = Vec::new();
    let mut remaining = budget;

    for chunk in chunks {
        if selected.len() >= max_count {
            break;
        }
        if chunk.token_count > remaining {
            continue;
        }
        remaining -= chunk.token_count;
        selected.push(chunk.clone());
    }

    selected
}
