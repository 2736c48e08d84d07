//! Codec error types

use thiserror::Error;

/// Errors produced while drying or undrying a value graph
#[derive(Debug, Error)]
pub enum CodecError {
    /// A back-reference path does not resolve within the decoded tree
    #[error("unresolvable back-reference path: {path:?}")]
    BadBackref { path: String },

    /// A buffer tag points outside the side buffer list
    #[error("buffer index {index} outside side list of length {len}")]
    MissingBuffer { index: usize, len: usize },

    /// A stream tag points outside the side stream list
    #[error("stream index {index} outside side list of length {len}")]
    MissingStream { index: usize, len: usize },

    /// The payload text is not valid JSON
    #[error("parse error: {0}")]
    Parse(String),

    /// The transformed tree could not be written out
    #[error("write error: {0}")]
    Write(String),

    /// A dry-tagged object is missing a required field
    #[error("malformed dry tag: {0}")]
    MalformedTag(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CodecError::Parse(err.to_string())
        } else {
            CodecError::Write(err.to_string())
        }
    }
}
