use thiserror::Error;

use crate::PageNumber;

/// Failures the annotation engine reports to its host.
///
/// Transport failures are logged and degrade to empty or stale state, except
/// for explicit imports. Stored data that no longer decodes makes the store
/// read-only for the session.
#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("annotation store transport failed: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("stored annotations at {location} could not be decoded: {reason}")]
    CorruptStore { location: String, reason: String },

    #[error("malformed annotation import: {reason}")]
    MalformedImport { reason: String },

    #[error("{operation} is not supported in {topology} view")]
    UnsupportedInTopology {
        operation: &'static str,
        topology: &'static str,
    },

    #[error("page {page} is out of range (document has {page_count} pages)")]
    PageOutOfRange { page: PageNumber, page_count: u32 },

    #[error("invalid color {0:?}")]
    InvalidColor(String),
}

impl AnnotationError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedImport {
            reason: reason.into(),
        }
    }
}
