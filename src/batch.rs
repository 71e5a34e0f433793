//! Per-item batch results and severity aggregation
//!
//! Every fan-out operation reports one [`BatchItemResult`] per input, in input
//! order, plus one overall [`StatusClass`] computed as the worst item severity.

use crate::error::{Error, ErrorKind};
use crate::models::UploadOutcome;
use serde::{Deserialize, Serialize};

/// Severity of an item or a whole batch. Ordered so that `max` picks the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Success,
    ClientError,
    ServerError,
}

/// How a successful item's asset came to be at its remote key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Created,
    AlreadyExists,
    Cached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub key: String,
    pub digest: String,
    pub url: String,
    pub disposition: Disposition,
}

impl AssetRef {
    pub fn from_outcome(outcome: &UploadOutcome, url: String) -> Self {
        let disposition = match outcome {
            UploadOutcome::Created { .. } => Disposition::Created,
            UploadOutcome::AlreadyExists { .. } => Disposition::AlreadyExists,
        };

        Self {
            key: outcome.key().to_string(),
            digest: outcome.digest().to_string(),
            url,
            disposition,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ItemFailure {
    pub fn from_error(error: &Error) -> Self {
        let kind = error.kind();
        Self {
            kind,
            code: kind.code().to_string(),
            message: error.to_string(),
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = code.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub identifier: String,
    pub status: StatusClass,
    pub result: std::result::Result<AssetRef, ItemFailure>,
}

impl BatchItemResult {
    pub fn success(identifier: impl Into<String>, asset: AssetRef) -> Self {
        Self {
            identifier: identifier.into(),
            status: StatusClass::Success,
            result: Ok(asset),
        }
    }

    pub fn failure(identifier: impl Into<String>, failure: ItemFailure) -> Self {
        Self {
            identifier: identifier.into(),
            status: failure.kind.status_class(),
            result: Err(failure),
        }
    }

    pub fn from_error(identifier: impl Into<String>, error: &Error) -> Self {
        Self::failure(identifier, ItemFailure::from_error(error))
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub status: StatusClass,
    pub items: Vec<BatchItemResult>,
}

impl BatchResult {
    /// Builds a batch from already-ordered items. An empty batch is a success.
    pub fn from_items(items: Vec<BatchItemResult>) -> Self {
        let status = items
            .iter()
            .map(|item| item.status)
            .max()
            .unwrap_or(StatusClass::Success);

        Self { status, items }
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.is_success()).count()
    }
}
