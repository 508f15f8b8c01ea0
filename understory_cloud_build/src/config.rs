// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Builder settings.

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, usize::from)
}

fn default_batch_size() -> usize {
    16_384
}

/// How a [`Builder`](crate::Builder) schedules work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Worker threads for insertion.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Records handed to one worker at a time.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Page chunks out after an insertion once more than this many are live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_live_chunks: Option<usize>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            batch_size: default_batch_size(),
            max_live_chunks: None,
        }
    }
}

impl BuildConfig {
    /// Default settings with `threads` workers.
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    /// Check the settings, returning them unchanged on success.
    pub fn validate(self) -> Result<Self> {
        if self.threads == 0 {
            return Err(BuildError::Config("at least one thread is required".into()));
        }
        if self.batch_size == 0 {
            return Err(BuildError::Config("batch size must be positive".into()));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: BuildConfig = serde_json::from_str(r#"{"threads": 3}"#).unwrap();
        assert_eq!(config.threads, 3);
        assert_eq!(config.batch_size, 16_384);
        assert_eq!(config.max_live_chunks, None);
        let paged: BuildConfig = serde_json::from_str(r#"{"maxLiveChunks": 8}"#).unwrap();
        assert_eq!(paged.max_live_chunks, Some(8));
        assert!(paged.threads >= 1);
    }

    #[test]
    fn rejects_empty_pools_and_batches() {
        assert!(BuildConfig::with_threads(0).validate().is_err());
        let config = BuildConfig {
            batch_size: 0,
            ..BuildConfig::with_threads(2)
        };
        assert!(matches!(config.validate(), Err(BuildError::Config(_))));
        assert!(BuildConfig::with_threads(2).validate().is_ok());
    }
}
