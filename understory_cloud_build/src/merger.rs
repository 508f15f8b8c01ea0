// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Folding independently built subsets into one whole index.

use std::sync::Arc;

use tracing::info;
use understory_cloud::{Index, Storage};

use crate::builder::Builder;
use crate::error::{BuildError, Result};
use crate::scope::OuterScope;

/// Merges every subset saved under one path into a whole index.
///
/// Subsets are opened one at a time and folded into the first. Nothing is
/// written until every subset has been folded, so a missing or corrupt subset
/// leaves storage untouched.
#[derive(Debug)]
pub struct Merger {
    path: String,
    scope: OuterScope,
    builder: Builder,
    others: Vec<usize>,
    of: usize,
}

impl Merger {
    /// Open the accumulating subset: `subset_id`, or subset 0, and check that
    /// its stored chunks are readable.
    ///
    /// Fails with [`BuildError::AlreadyWhole`] if only a whole index exists at
    /// `path`, and with [`BuildError::NotMergeable`] if nothing does.
    pub fn new(
        path: impl Into<String>,
        threads: usize,
        subset_id: Option<usize>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let path = path.into();
        let first = subset_id.unwrap_or(0);
        let mut scope = OuterScope::new(storage);

        let Some(builder) = Builder::create(&path, threads, Some(first), &scope)? else {
            return Err(if Index::exists(scope.storage().as_ref(), &path, None)? {
                BuildError::AlreadyWhole(path)
            } else {
                BuildError::NotMergeable(path)
            });
        };
        let Some(subset) = builder.index().subset() else {
            return Err(BuildError::AlreadyWhole(path));
        };
        builder
            .index()
            .registry()
            .verify_stored()
            .map_err(|source| BuildError::SubsetMissing {
                path: path.clone(),
                id: first,
                source,
            })?;
        scope.share(builder.index().schema());

        let of = subset.of();
        let others = (0..of).filter(|&id| id != first).collect();
        info!("Awakened 1 / {of}");
        Ok(Self {
            path,
            scope,
            builder,
            others,
            of,
        })
    }

    /// Number of subsets being merged.
    pub fn subsets(&self) -> usize {
        self.of
    }

    /// Fold the remaining subsets in ascending order, make the result whole and
    /// save it.
    pub fn go(mut self) -> Result<Index> {
        for (done, id) in self.others.iter().copied().enumerate() {
            let subset = Index::open_with_schema(
                self.scope.storage().clone(),
                self.path.as_str(),
                Some(id),
                self.scope.schema().cloned(),
            )
            .and_then(|subset| subset.registry().verify_stored().map(|()| subset))
            .map_err(|source| BuildError::SubsetMissing {
                path: self.path.clone(),
                id,
                source,
            })?;
            info!("Merging {} / {}", done + 2, self.of);
            self.builder.merge(subset)?;
        }
        self.builder.make_whole();
        self.builder.save()?;
        info!("Merge complete");
        Ok(self.builder.into_index())
    }
}
