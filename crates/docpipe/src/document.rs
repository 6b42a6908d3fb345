//! Uploaded documents and the data derived from them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::ParseEnumError;

/// Processing lifecycle of a document. Only ever moves forward:
/// `uploaded -> processing -> active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Active,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Active => "active",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(DocumentStatus::Uploaded),
            "processing" => Ok(DocumentStatus::Processing),
            "active" => Ok(DocumentStatus::Active),
            other => Err(ParseEnumError {
                kind: "document status",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted document record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub file_name: String,
    pub file_path: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub status: DocumentStatus,
    pub page_count: u32,
    pub chunk_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the upload collaborator knows about a freshly stored file.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: String,
    pub title: String,
    pub file_name: String,
    pub file_path: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// Cached full text of a document, kept so re-chunking never needs
/// re-extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub document_id: String,
    pub text: String,
    pub page_count: u32,
    pub extraction_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted chunk of a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub token_count: u32,
    pub embedding_status: String,
}
