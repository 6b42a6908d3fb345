//! Builders for test inputs: extractor scripts, audit sinks and text.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use docpipe::audit::{AuditError, AuditEvent, AuditSink};
use docpipe::extraction::{Extraction, ExtractionError, Extractor};

/// Extractor that replays a fixed script of results, one per call.
///
/// Once the script runs out, the last entry is repeated.
pub struct ScriptedExtractor {
    script: Mutex<VecDeque<Result<Extraction, String>>>,
    last: Mutex<Option<Result<Extraction, String>>>,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new(script: Vec<Result<Extraction, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always returns `text` as a single page.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(extraction(text, 1))])
    }

    /// Always fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(vec![Err(message.into())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Extractor for ScriptedExtractor {
    fn extract(&self, _path: &Path, _mime_type: &str) -> Result<Extraction, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = Some(next);
        }
        match last.as_ref() {
            Some(result) => result.clone().map_err(ExtractionError::Other),
            None => Err(ExtractionError::Other("empty extractor script".to_string())),
        }
    }
}

pub fn extraction(text: impl Into<String>, page_count: u32) -> Extraction {
    Extraction {
        text: text.into(),
        page_count,
    }
}

/// Audit sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.action).collect()
    }

    pub fn actions_for(&self, resource_id: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.resource_id == resource_id)
            .map(|e| e.action)
            .collect()
    }
}

impl AuditSink for RecordingSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Audit sink whose store is always down.
pub struct BrokenSink;

impl AuditSink for BrokenSink {
    fn record(&self, _event: &AuditEvent) -> Result<(), AuditError> {
        Err(AuditError::Other("audit table is gone".to_string()))
    }
}

/// `count` distinct whitespace-separated words, no sentence breaks.
pub fn words(count: usize) -> String {
    (0..count)
        .map(|i| format!("w{}", i))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `count` sentences of `words_each` words, all in one paragraph.
pub fn sentences(count: usize, words_each: usize) -> String {
    (0..count)
        .map(|s| {
            let body = (0..words_each)
                .map(|w| format!("s{}w{}", s, w))
                .collect::<Vec<_>>()
                .join(" ");
            format!("{}.", body)
        })
        .collect::<Vec<_>>()
        .join(" ")
}
