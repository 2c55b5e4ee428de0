//! Remote search RPC: wire types, validation and the local handler.
//!
//! Requests and responses are validated at the boundary and rejected with
//! a specific reason; nothing is coerced. Responses are sorted by filename
//! so repeated queries against unchanged data return the same page.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::index::{IndexedFile, LibraryIndex};

pub const MAX_SEARCH_TEXT_LEN: usize = 200;
pub const MIN_RESULTS: i64 = 1;
pub const MAX_RESULTS: i64 = 100;
/// Hard cap on files in one response.
pub const MAX_RESPONSE_FILES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchValidationError {
    #[error("request_id is not a valid UUID: {0:?}")]
    InvalidRequestId(String),
    #[error("search_text is empty")]
    EmptySearchText,
    #[error("search_text exceeds {max} characters ({len})")]
    SearchTextTooLong { len: usize, max: usize },
    #[error("max_results {0} outside 1..=100")]
    MaxResultsOutOfRange(i64),
    #[error("response has {count} files, cap is {max}")]
    TooManyFiles { count: usize, max: usize },
    #[error("file at index {0} has an empty filename")]
    EmptyFilename(usize),
    #[error("file {filename:?} has negative size {size}")]
    NegativeSize { filename: String, size: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub request_id: String,
    pub search_text: String,
    pub max_results: i64,
}

impl SearchRequest {
    pub fn new(search_text: impl Into<String>, max_results: i64) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            search_text: search_text.into(),
            max_results,
        }
    }

    pub fn validate(&self) -> Result<(), SearchValidationError> {
        validate_request_id(&self.request_id)?;
        if self.search_text.trim().is_empty() {
            return Err(SearchValidationError::EmptySearchText);
        }
        let len = self.search_text.chars().count();
        if len > MAX_SEARCH_TEXT_LEN {
            return Err(SearchValidationError::SearchTextTooLong {
                len,
                max: MAX_SEARCH_TEXT_LEN,
            });
        }
        if !(MIN_RESULTS..=MAX_RESULTS).contains(&self.max_results) {
            return Err(SearchValidationError::MaxResultsOutOfRange(self.max_results));
        }
        Ok(())
    }
}

fn validate_request_id(id: &str) -> Result<(), SearchValidationError> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| SearchValidationError::InvalidRequestId(id.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFile {
    pub filename: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl From<&IndexedFile> for SearchFile {
    fn from(f: &IndexedFile) -> Self {
        Self {
            filename: f.filename.clone(),
            size: i64::try_from(f.size).unwrap_or(i64::MAX),
            item_id: Some(f.item_id.clone()),
            recording_id: f.recording_id.clone(),
            fingerprint: f.fingerprint.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub request_id: String,
    pub files: Vec<SearchFile>,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SearchResponse {
    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            files: Vec::new(),
            truncated: false,
            error: Some(error.into()),
        }
    }

    pub fn validate(&self) -> Result<(), SearchValidationError> {
        validate_request_id(&self.request_id)?;
        if self.files.len() > MAX_RESPONSE_FILES {
            return Err(SearchValidationError::TooManyFiles {
                count: self.files.len(),
                max: MAX_RESPONSE_FILES,
            });
        }
        for (i, f) in self.files.iter().enumerate() {
            if f.filename.trim().is_empty() {
                return Err(SearchValidationError::EmptyFilename(i));
            }
            if f.size < 0 {
                return Err(SearchValidationError::NegativeSize {
                    filename: f.filename.clone(),
                    size: f.size,
                });
            }
        }
        Ok(())
    }
}

/// Answers search requests from the local library.
pub struct LocalSearchHandler {
    index: Arc<dyn LibraryIndex>,
}

impl LocalSearchHandler {
    pub fn new(index: Arc<dyn LibraryIndex>) -> Self {
        Self { index }
    }

    /// Always returns a well-formed response. Invalid requests and index
    /// failures come back empty with `error` set.
    pub fn handle(&self, request: &SearchRequest) -> SearchResponse {
        if let Err(e) = request.validate() {
            debug!(request_id = %request.request_id, "Rejected search request: {}", e);
            return SearchResponse::failed(request.request_id.clone(), e.to_string());
        }

        let mut files = match self.index.search(&request.search_text) {
            Ok(files) => files,
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Local search failed");
                return SearchResponse::failed(request.request_id.clone(), "local search failed");
            }
        };

        files.sort_by(|a, b| a.filename.cmp(&b.filename).then_with(|| a.path.cmp(&b.path)));
        let limit = (request.max_results as usize).min(MAX_RESPONSE_FILES);
        let truncated = files.len() > limit;
        files.truncate(limit);

        SearchResponse {
            request_id: request.request_id.clone(),
            files: files.iter().map(SearchFile::from).collect(),
            truncated,
            error: None,
        }
    }
}
