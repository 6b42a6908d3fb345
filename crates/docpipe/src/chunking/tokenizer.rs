//! Token counters used for chunk budgets.

/// Counts tokens in a piece of text. Any counter works for chunking as
/// long as one run uses the same counter throughout.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// One token per whitespace-separated word.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhitespaceTokenCounter;

impl TokenCounter for WhitespaceTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn name(&self) -> &'static str {
        "whitespace"
    }
}

/// BPE token counts using the `cl100k_base` vocabulary.
#[cfg(feature = "tiktoken")]
pub struct BpeTokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl BpeTokenCounter {
    pub fn cl100k() -> Result<Self, String> {
        tiktoken_rs::cl100k_base()
            .map(|bpe| Self { bpe })
            .map_err(|e| format!("failed to load cl100k_base: {}", e))
    }
}

#[cfg(feature = "tiktoken")]
impl TokenCounter for BpeTokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn name(&self) -> &'static str {
        "cl100k"
    }
}

/// Picks a counter by name (`whitespace`, or `cl100k` with the `tiktoken`
/// feature).
pub fn counter_by_name(name: &str) -> Result<Box<dyn TokenCounter>, String> {
    match name {
        "whitespace" => Ok(Box::new(WhitespaceTokenCounter)),
        #[cfg(feature = "tiktoken")]
        "cl100k" => Ok(Box::new(BpeTokenCounter::cl100k()?)),
        other => Err(format!("unknown token counter '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_counter() {
        let counter = WhitespaceTokenCounter;
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("   "), 0);
        assert_eq!(counter.count("one two\tthree\nfour"), 4);
    }

    #[test]
    fn test_counter_by_name() {
        assert_eq!(counter_by_name("whitespace").unwrap().name(), "whitespace");
        assert!(counter_by_name("bogus").is_err());
    }

    #[cfg(feature = "tiktoken")]
    #[test]
    fn test_bpe_counter_counts_something() {
        let counter = BpeTokenCounter::cl100k().unwrap();
        assert!(counter.count("hello world") >= 2);
    }
}
