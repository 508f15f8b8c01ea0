// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types for the point-cloud index.

use thiserror::Error;

use crate::id::Id;

/// Point-cloud index errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Unsupported or inconsistent configuration (structure, dimensionality, subset).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metadata record could not be read or parsed.
    #[error("Malformed metadata at {path}: {reason}")]
    Metadata {
        /// Storage key of the metadata record.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// Blob is absent from storage.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage failure while reading or writing a blob.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Storage key involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A persisted base, flat or chunk file is corrupt or incompatible.
    #[error("Format error at {path}: {reason}")]
    Format {
        /// Storage key of the offending file.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// A chunk reader was asked for its buffer after it was released.
    #[error("No chunk data for {0}: buffer was released")]
    ChunkReleased(Id),

    /// An id is not inside the subtree it was normalized against.
    #[error("Id {id} is outside the subtree of {anchor}")]
    OutOfRange {
        /// The id being normalized.
        id: Id,
        /// The ancestor it was normalized against.
        anchor: Id,
    },

    /// A tube lookup missed the range held by a base reader.
    #[error("No tube for {0}")]
    TubeMissing(Id),

    /// Two indexes can not be combined.
    #[error("Incompatible index: {0}")]
    Incompatible(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn format(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for index operations.
pub type Result<T> = std::result::Result<T, Error>;
