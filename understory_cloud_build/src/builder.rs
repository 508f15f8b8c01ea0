// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Parallel construction of one index or subset.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;
use understory_cloud::{
    Bounds, Error, Index, InsertStats, Origin, PointBuffer, Schema, Structure, Subset,
};

use crate::config::BuildConfig;
use crate::error::Result;
use crate::scope::OuterScope;

/// Drives insertion into an [`Index`] from a dedicated worker pool.
#[derive(Debug)]
pub struct Builder {
    index: Index,
    pool: rayon::ThreadPool,
    config: BuildConfig,
}

impl Builder {
    /// A builder over a fresh, empty index.
    pub fn new(
        scope: &OuterScope,
        path: impl Into<String>,
        bounds: Bounds,
        schema: Arc<Schema>,
        structure: Structure,
        subset: Option<Subset>,
        config: BuildConfig,
    ) -> Result<Self> {
        let index = Index::create(
            scope.storage().clone(),
            path,
            bounds,
            schema,
            structure,
            subset,
        )?;
        Self::from_index(index, config)
    }

    /// A builder over the index saved at `path`, or `None` if there is none.
    ///
    /// The index reuses the scope's schema when the stored one matches.
    pub fn create(
        path: &str,
        threads: usize,
        subset_id: Option<usize>,
        scope: &OuterScope,
    ) -> Result<Option<Self>> {
        if !Index::exists(scope.storage().as_ref(), path, subset_id)? {
            return Ok(None);
        }
        let index = Index::open_with_schema(
            scope.storage().clone(),
            path,
            subset_id,
            scope.schema().cloned(),
        )?;
        Self::from_index(index, BuildConfig::with_threads(threads)).map(Some)
    }

    /// Wrap an existing index.
    pub fn from_index(index: Index, config: BuildConfig) -> Result<Self> {
        let config = config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()?;
        Ok(Self {
            index,
            pool,
            config,
        })
    }

    /// The index being built.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Settings in use.
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Release the index.
    pub fn into_index(self) -> Index {
        self.index
    }

    /// Insert `buffer` across the worker pool, tagging every record with `origin`.
    ///
    /// Pages chunks out afterwards if more than
    /// [`max_live_chunks`](BuildConfig::max_live_chunks) are live.
    pub fn insert(&self, buffer: &mut PointBuffer, origin: Origin) -> Result<InsertStats> {
        if **buffer.schema() != **self.index.schema() {
            return Err(
                Error::Incompatible("buffer schema differs from the index schema".into()).into(),
            );
        }
        buffer.stamp_origin(origin);
        let batch = self.config.batch_size * self.index.schema().point_size();
        let index = &self.index;
        let stats = self.pool.install(|| {
            buffer
                .as_bytes()
                .par_chunks(batch)
                .map(|records| index.insert_records(records))
                .try_reduce(InsertStats::default, |mut acc, stats| {
                    acc += stats;
                    Ok(acc)
                })
        })?;
        if let Some(max) = self.config.max_live_chunks {
            let live = self.index.registry().live_chunks();
            if live > max {
                let paged = self.index.page_out()?;
                debug!(path = self.index.path(), live, paged, "paged out chunks");
            }
        }
        Ok(stats)
    }

    /// Fold a sibling subset into this builder's index.
    pub fn merge(&mut self, other: Index) -> Result<()> {
        Ok(self.index.merge(other)?)
    }

    /// Drop subset partitioning.
    pub fn make_whole(&mut self) {
        self.index.make_whole();
    }

    /// Persist the index.
    pub fn save(&self) -> Result<()> {
        Ok(self.index.save()?)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use understory_cloud::{MemoryStorage, Point, Storage};

    use super::*;
    use crate::error::BuildError;

    fn square() -> Bounds {
        Bounds::new(Point::new(0.0, 0.0, 0.0), Point::new(100.0, 100.0, 10.0))
    }

    fn points(schema: &Arc<Schema>, seed: u64, n: usize) -> PointBuffer {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut buf = PointBuffer::new(schema.clone());
        for _ in 0..n {
            buf.push(&[
                rng.random_range(0.0..100.0),
                rng.random_range(0.0..100.0),
                rng.random_range(0.0..10.0),
            ]);
        }
        buf
    }

    fn config(max_live_chunks: Option<usize>) -> BuildConfig {
        BuildConfig {
            threads: 4,
            batch_size: 256,
            max_live_chunks,
        }
    }

    #[test]
    fn parallel_insert_accounts_for_every_point() {
        let scope = OuterScope::new(Arc::new(MemoryStorage::new()));
        let schema = Arc::new(Schema::xyz([]));
        let builder = Builder::new(
            &scope,
            "cloud",
            square(),
            schema.clone(),
            Structure::new(2, 6, 12).unwrap(),
            None,
            config(None),
        )
        .unwrap();
        let mut buf = points(&schema, 1, 5000);
        buf.push(&[200.0, 0.0, 0.0]);
        let stats = builder.insert(&mut buf, 0).unwrap();
        assert_eq!(stats.out_of_bounds, 1);
        assert!(stats.inserted > 0);
        assert_eq!(stats.inserted + stats.tossed, 5000);
        assert_eq!(builder.index().num_points(), stats.inserted);
        assert_eq!(
            builder.index().query(0, 13).unwrap().len() as u64,
            stats.inserted
        );
    }

    #[test]
    fn pages_out_past_the_live_chunk_limit() {
        let scope = OuterScope::new(Arc::new(MemoryStorage::new()));
        let schema = Arc::new(Schema::xyz([]));
        let builder = Builder::new(
            &scope,
            "cloud",
            square(),
            schema.clone(),
            Structure::new(1, 3, 12).unwrap(),
            None,
            config(Some(0)),
        )
        .unwrap();
        let stats = builder.insert(&mut points(&schema, 2, 4000), 0).unwrap();
        assert_eq!(stats.out_of_bounds, 0);
        assert!(stats.inserted > 0);
        assert_eq!(builder.index().registry().live_chunks(), 0);
        assert!(!builder.index().registry().chunk_keys().is_empty());
        assert_eq!(
            builder.index().query(0, 13).unwrap().len() as u64,
            stats.inserted
        );
    }

    #[test]
    fn create_needs_a_saved_index() {
        let storage = MemoryStorage::new();
        let mut scope = OuterScope::new(Arc::new(storage.clone()));
        assert!(Builder::create("cloud", 2, None, &scope).unwrap().is_none());

        let schema = Arc::new(Schema::xyz([]));
        let builder = Builder::new(
            &scope,
            "cloud",
            square(),
            schema.clone(),
            Structure::default(),
            None,
            config(None),
        )
        .unwrap();
        let stats = builder.insert(&mut points(&schema, 3, 100), 0).unwrap();
        assert_eq!(stats.inserted, 100);
        builder.save().unwrap();
        scope.share(&schema);

        let reopened = Builder::create("cloud", 2, None, &scope).unwrap().unwrap();
        assert!(Arc::ptr_eq(reopened.index().schema(), &schema));
        assert_eq!(reopened.index().num_points(), builder.index().num_points());
        assert_eq!(reopened.config().threads, 2);
        assert!(storage.exists("cloud/meta").unwrap());
    }

    #[test]
    fn rejects_bad_config_and_foreign_buffers() {
        let scope = OuterScope::new(Arc::new(MemoryStorage::new()));
        let schema = Arc::new(Schema::xyz([]));
        let zero = Builder::new(
            &scope,
            "cloud",
            square(),
            schema,
            Structure::default(),
            None,
            BuildConfig::with_threads(0),
        );
        assert!(matches!(zero, Err(BuildError::Config(_))));

        let builder = Builder::new(
            &scope,
            "cloud",
            square(),
            Arc::new(Schema::xyz([])),
            Structure::default(),
            None,
            config(None),
        )
        .unwrap();
        let other = Arc::new(Schema::xyz([understory_cloud::DimInfo::new(
            "Intensity",
            understory_cloud::DimType::Uint16,
        )]));
        let mut buf = PointBuffer::new(other);
        buf.push(&[1.0, 1.0, 0.0, 5.0]);
        assert!(matches!(
            builder.insert(&mut buf, 0),
            Err(BuildError::Index(Error::Incompatible(_)))
        ));
    }
}
