use crate::chunking::ChunkingOptions;
use crate::config::Config;
use crate::jobs::RetryPolicy;

/// The slice of [`Config`] a pipeline run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub chunking: ChunkingOptions,
    pub min_text_length: usize,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: config.chunking.options(),
            min_text_length: config.extraction.min_text_length,
            retry: config.retry.policy(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
