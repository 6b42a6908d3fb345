use crate::chunking::TextChunk;
use crate::document::Document;
use crate::extraction::Extraction;
use crate::jobs::Job;

/// State carried through one execution of a job.
pub struct PipelineContext {
    // Input, as returned by the claim
    pub job: Job,

    // Step 1 result
    pub document: Option<Document>,

    // Step 3 result
    pub extraction: Option<Extraction>,

    // Step 5 result
    pub chunks: Vec<TextChunk>,
}

impl PipelineContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            document: None,
            extraction: None,
            chunks: Vec::new(),
        }
    }

    pub fn page_count(&self) -> u32 {
        self.extraction.as_ref().map_or(0, |e| e.page_count)
    }

    pub fn chunk_count(&self) -> u32 {
        u32::try_from(self.chunks.len()).unwrap_or(u32::MAX)
    }
}
