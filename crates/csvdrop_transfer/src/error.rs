use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PayloadTooLarge,
    MalformedOrOversizedForm,
    MissingFileField,
    UnsupportedFileType,
    StreamNotSeekable,
    StorageUnavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::MalformedOrOversizedForm => "malformed_or_oversized_form",
            ErrorKind::MissingFileField => "missing_file_field",
            ErrorKind::UnsupportedFileType => "unsupported_file_type",
            ErrorKind::StreamNotSeekable => "stream_not_seekable",
            ErrorKind::StorageUnavailable => "storage_unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("the uploaded file is too big, please choose a file that's less than {limit} bytes in size")]
    PayloadTooLarge { limit: u64 },
    #[error("malformed multipart form: {0}")]
    MalformedOrOversizedForm(String),
    #[error("no multipart field named `{0}` was provided")]
    MissingFileField(&'static str),
    #[error("the provided file format `{declared}` is not allowed, please upload a csv file")]
    UnsupportedFileType { declared: String },
    #[error("failed to rewind upload stream: {0}")]
    StreamNotSeekable(#[source] io::Error),
    #[error("storage unavailable while trying to {action}: {source}")]
    StorageUnavailable {
        action: &'static str,
        #[source]
        source: io::Error,
    },
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            UploadError::MalformedOrOversizedForm(_) => ErrorKind::MalformedOrOversizedForm,
            UploadError::MissingFileField(_) => ErrorKind::MissingFileField,
            UploadError::UnsupportedFileType { .. } => ErrorKind::UnsupportedFileType,
            UploadError::StreamNotSeekable(_) => ErrorKind::StreamNotSeekable,
            UploadError::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
        }
    }

    pub fn rejected_content_type(&self) -> Option<&str> {
        match self {
            UploadError::UnsupportedFileType { declared } => Some(declared),
            _ => None,
        }
    }

    pub(crate) fn storage(action: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| UploadError::StorageUnavailable { action, source }
    }
}
