// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types for building and merging.

use thiserror::Error;

/// Build and merge errors.
#[derive(Error, Debug)]
pub enum BuildError {
    /// No index was found to merge.
    #[error("Nothing to merge at {0}: no subset index found")]
    NotMergeable(String),

    /// The index has no subsets left to merge.
    #[error("Index at {0} is already whole")]
    AlreadyWhole(String),

    /// One of the subsets could not be opened; nothing was written.
    #[error("Subset {id} of {path} could not be opened: {source}")]
    SubsetMissing {
        /// Index path.
        path: String,
        /// The subset that failed.
        id: usize,
        /// Why it failed.
        #[source]
        source: understory_cloud::Error,
    },

    /// Invalid build settings.
    #[error("Invalid build configuration: {0}")]
    Config(String),

    /// The worker pool could not be started.
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Error from the index itself.
    #[error(transparent)]
    Index(#[from] understory_cloud::Error),
}

/// Result type for build operations.
pub type Result<T> = std::result::Result<T, BuildError>;
