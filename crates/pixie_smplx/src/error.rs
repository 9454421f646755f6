//! Error types for loading, converting and writing pose records.

use crate::codec::{numpy::NumpyError, pickle::PickleError};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Errors surfaced by the converter. All of them abort only the current
/// conversion.
#[derive(Debug, Error)]
pub enum Error {
    /// The source file could not be read or decoded.
    #[error("failed to load {}: {source}", path.display())]
    Load {
        /// File that was being loaded.
        path: PathBuf,
        /// Why loading failed.
        #[source]
        source: LoadError,
    },

    /// A recognized field holds an array of an unusable shape.
    #[error("field `{field}` has shape {shape:?}, expected {expected}")]
    Shape {
        /// Source field name.
        field: String,
        /// Shape that was found.
        shape: Vec<usize>,
        /// Human readable description of the accepted shapes.
        expected: String,
    },

    /// The output file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// Destination that was being written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Why a pickle blob could not be turned into a record.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The file could not be read.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The pickle stream is malformed or uses unsupported features.
    #[error(transparent)]
    Pickle(#[from] PickleError),

    /// A field looked like a numpy array but could not be decoded.
    #[error("field `{field}`: {source}")]
    Array {
        /// Field holding the array.
        field: String,
        /// Decoding failure.
        #[source]
        source: NumpyError,
    },

    /// The top-level object is not a dict.
    #[error("top-level object is {0}, expected a dict")]
    NotAMapping(&'static str),

    /// Both the default and the latin-1 decoding failed.
    #[error("default decoding failed ({default}); latin-1 fallback failed ({latin1})")]
    Fallback {
        /// Error of the first attempt.
        default: Box<LoadError>,
        /// Error of the latin-1 attempt.
        latin1: Box<LoadError>,
    },
}

impl Error {
    pub(crate) fn shape(field: &str, shape: &[usize], expected: impl Into<String>) -> Self {
        Self::Shape {
            field: field.to_string(),
            shape: shape.to_vec(),
            expected: expected.into(),
        }
    }
}

/// Result type for converter operations.
pub type Result<T> = std::result::Result<T, Error>;
