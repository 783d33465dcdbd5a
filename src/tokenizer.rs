//! BPE token counting, windowed splitting, and truncation.
//!
//! Wraps a `tiktoken-rs` encoder. Counting is deterministic for a given
//! encoder, and `encode`/`decode` round-trip. Windows produced by
//! [`Tokenizer::split`] and [`Tokenizer::truncate`] are re-counted after
//! cutting so a window never exceeds its token limit even when a token
//! boundary lands inside a multi-byte character.

use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::error::{Error, Result};

/// Window size used when a caller passes a zero target size.
pub const DEFAULT_TARGET_SIZE: usize = 512;

/// Overlap fractions are clamped into `[0, MAX_OVERLAP]`, keeping the step positive.
pub const MAX_OVERLAP: f64 = 0.89;

#[derive(Clone)]
pub struct Tokenizer {
    name: String,
    bpe: Arc<CoreBPE>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").field("name", &self.name).finish()
    }
}

impl Tokenizer {
    /// Build a tokenizer from an encoding name or a model name.
    ///
    /// Unknown identifiers fall back to `cl100k_base`.
    pub fn new(identifier: &str) -> Result<Self> {
        let (name, bpe) = match identifier {
            "cl100k_base" => ("cl100k_base".to_string(), tiktoken_rs::cl100k_base()),
            "o200k_base" => ("o200k_base".to_string(), tiktoken_rs::o200k_base()),
            "p50k_base" => ("p50k_base".to_string(), tiktoken_rs::p50k_base()),
            model => match tiktoken_rs::get_bpe_from_model(model) {
                Ok(bpe) => (model.to_string(), Ok(bpe)),
                Err(_) => {
                    tracing::debug!(identifier = model, "unknown tokenizer, using cl100k_base");
                    ("cl100k_base".to_string(), tiktoken_rs::cl100k_base())
                }
            },
        };
        let bpe = bpe.map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(Self {
            name,
            bpe: Arc::new(bpe),
        })
    }

    pub fn cl100k() -> Result<Self> {
        Self::new("cl100k_base")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_ordinary(text)
    }

    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    /// Number of tokens in `text`. Empty text is 0.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.encode(text).len()
    }

    /// Split text into overlapping windows of at most `target_size` tokens.
    ///
    /// A text that already fits comes back as a single, unchanged element.
    /// Otherwise windows start every `target_size * (1 - overlap)` tokens
    /// (at least one) until the final window reaches the end of the text.
    /// Window edges land on character boundaries, and a window cut short by
    /// one pulls the next start back with it, so no text is skipped.
    pub fn split(&self, text: &str, target_size: usize, overlap: f64) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }

        let target = if target_size == 0 {
            DEFAULT_TARGET_SIZE
        } else {
            target_size
        };
        let overlap = clamp_overlap(overlap);

        let tokens = self.encode(text);
        if tokens.len() <= target {
            return vec![text.to_string()];
        }

        let step = ((target as f64 * (1.0 - overlap)).floor() as usize).max(1);
        let offsets = self.byte_offsets(&tokens);
        let n = tokens.len();
        let boundary = |i: usize| text.is_char_boundary(offsets[i]);

        let mut windows = Vec::new();
        let mut start = 0;
        loop {
            let mut end = (start + target).min(n);
            while end > start
                && !(boundary(end) && self.count(&text[offsets[start]..offsets[end]]) <= target)
            {
                end -= 1;
            }
            if end == start {
                // A single character wider than the window; it goes out whole.
                end = (start + 1..=n).find(|&i| boundary(i)).unwrap_or(n);
            }
            windows.push(text[offsets[start]..offsets[end]].to_string());
            if end == n {
                break;
            }

            // The next window starts no later than where this one ended.
            let mut next = (start + step).min(end);
            while next > start && !boundary(next) {
                next -= 1;
            }
            start = if next == start { end } else { next };
        }
        windows
    }

    /// Byte offset of every token boundary in the encoded text, from 0 to
    /// the text length.
    fn byte_offsets(&self, tokens: &[u32]) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(tokens.len() + 1);
        let mut at = 0;
        offsets.push(at);
        for bytes in self.bpe._decode_native_and_split(tokens.to_vec()) {
            at += bytes.len();
            offsets.push(at);
        }
        offsets
    }

    /// Cut `text` down to `max_tokens`, keeping the prefix, or the suffix
    /// when `keep_end` is set. Text already within budget is returned as is.
    pub fn truncate(&self, text: &str, max_tokens: usize, keep_end: bool) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        let tokens = self.encode(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        let slice = if keep_end {
            &tokens[tokens.len() - max_tokens..]
        } else {
            &tokens[..max_tokens]
        };
        self.decode_fitting(slice, max_tokens, keep_end)
            .unwrap_or_default()
    }

    /// Decode the longest run of `tokens` that is valid UTF-8 and re-counts
    /// to at most `limit`, shrinking from the end (or from the start when
    /// `from_start` is set).
    fn decode_fitting(&self, tokens: &[u32], limit: usize, from_start: bool) -> Option<String> {
        let mut lo = 0;
        let mut hi = tokens.len();
        while lo < hi {
            if let Ok(text) = self.decode(&tokens[lo..hi]) {
                if self.count(&text) <= limit {
                    return Some(text);
                }
            }
            if from_start {
                lo += 1;
            } else {
                hi -= 1;
            }
        }
        None
    }
}

fn clamp_overlap(overlap: f64) -> f64 {
    if overlap.is_nan() || overlap < 0.0 {
        0.0
    } else {
        overlap.min(MAX_OVERLAP)
    }
}
