//! Token-bounded chunking with overlap.
//!
//! Text is split into paragraphs on blank lines and packed greedily into
//! chunks of at most `max_tokens`. A paragraph that is too large on its
//! own is broken into sentences first. When a chunk closes, the next one
//! is seeded with the last `overlap_tokens` *words* of the closed chunk;
//! the overlap is word-based even when the budget uses a different token
//! counter, so it is approximate.
//!
//! Chunking is pure and deterministic: the same text, options and counter
//! always produce the same chunks.

mod tokenizer;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub use tokenizer::{counter_by_name, TokenCounter, WhitespaceTokenCounter};

#[cfg(feature = "tiktoken")]
pub use tokenizer::BpeTokenCounter;

/// Default chunk budget.
pub const DEFAULT_MAX_TOKENS: usize = 500;
/// Default number of words carried into the next chunk.
pub const DEFAULT_OVERLAP_TOKENS: usize = 100;

static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n[ \t]*\n").unwrap());
static SENTENCE_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.\s+").unwrap());

const PARAGRAPH_SEPARATOR: &str = "\n\n";
const SENTENCE_SEPARATOR: &str = " ";

/// Chunk size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingOptions {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

/// One chunk of output, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub token_count: u32,
}

/// Splits `text` into ordered, token-bounded chunks.
pub fn chunk_text(
    text: &str,
    options: &ChunkingOptions,
    counter: &dyn TokenCounter,
) -> Vec<TextChunk> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut builder = ChunkBuilder::new(options, counter);

    for paragraph in PARAGRAPH_BREAK
        .split(&normalized)
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        let tokens = counter.count(paragraph);
        if tokens > options.max_tokens {
            for sentence in split_sentences(paragraph) {
                let sentence_tokens = counter.count(sentence);
                builder.push(sentence, sentence_tokens, SENTENCE_SEPARATOR);
            }
        } else {
            builder.push(paragraph, tokens, PARAGRAPH_SEPARATOR);
        }
    }

    builder.finish()
}

/// Splits after every period that is followed by whitespace, dropping the
/// whitespace. Empty pieces are skipped.
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_BREAK.find_iter(paragraph) {
        // keep the period, drop the whitespace
        let sentence = paragraph[start..m.start() + 1].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = m.end();
    }
    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Last `n` whitespace-separated words of `text`.
fn trailing_words(text: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    let skip = words.len().saturating_sub(n);
    words[skip..].join(" ")
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

struct ChunkBuilder<'a> {
    options: &'a ChunkingOptions,
    counter: &'a dyn TokenCounter,
    buffer: String,
    tokens: usize,
    chunks: Vec<TextChunk>,
}

impl<'a> ChunkBuilder<'a> {
    fn new(options: &'a ChunkingOptions, counter: &'a dyn TokenCounter) -> Self {
        Self {
            options,
            counter,
            buffer: String::new(),
            tokens: 0,
            chunks: Vec::new(),
        }
    }

    fn push(&mut self, piece: &str, piece_tokens: usize, separator: &str) {
        if self.tokens + piece_tokens > self.options.max_tokens {
            let overlap = trailing_words(&self.buffer, self.options.overlap_tokens);
            self.close();

            self.buffer = overlap;
            if !self.buffer.is_empty() {
                self.buffer.push(' ');
            }
            self.buffer.push_str(piece);
            self.tokens = self.counter.count(&self.buffer);
        } else {
            if !self.buffer.is_empty() {
                self.buffer.push_str(separator);
            }
            self.buffer.push_str(piece);
            self.tokens += piece_tokens;
        }
    }

    /// Emits the buffer as a chunk unless it is blank.
    fn close(&mut self) {
        let text = self.buffer.trim();
        if !text.is_empty() {
            self.chunks.push(TextChunk {
                text: text.to_string(),
                token_count: to_u32(self.tokens),
            });
        }
        self.buffer.clear();
        self.tokens = 0;
    }

    fn finish(mut self) -> Vec<TextChunk> {
        self.close();
        self.chunks
    }
}
