// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory Cloud Build: parallel and partitioned construction of
//! [`understory_cloud`] indexes.
//!
//! - [`Builder`] inserts point buffers into one [`Index`](understory_cloud::Index)
//!   from a dedicated `rayon` pool, paging chunks out past a configurable limit.
//! - [`Merger`] folds the subsets of a partitioned build into one whole index.
//! - [`OuterScope`] carries the storage and decoded schema shared between the
//!   builders of one logical index.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use understory_cloud::{Bounds, MemoryStorage, PointBuffer, Schema, Structure, Subset};
//! use understory_cloud_build::{BuildConfig, Builder, Merger, OuterScope};
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let scope = OuterScope::new(storage.clone());
//! let schema = Arc::new(Schema::xyz([]));
//! let bounds = Bounds::new_2d(0.0, 0.0, 10.0, 10.0);
//!
//! for id in 0..4 {
//!     let builder = Builder::new(
//!         &scope,
//!         "cloud",
//!         bounds,
//!         schema.clone(),
//!         Structure::new(2, 4, 8).unwrap(),
//!         Some(Subset::new(id, 4).unwrap()),
//!         BuildConfig::with_threads(2),
//!     )
//!     .unwrap();
//!     let mut points = PointBuffer::new(schema.clone());
//!     points.push(&[1.0, 1.0, 0.0]);
//!     points.push(&[8.0, 8.0, 0.0]);
//!     builder.insert(&mut points, id as u64).unwrap();
//!     builder.save().unwrap();
//! }
//!
//! let whole = Merger::new("cloud", 2, None, storage).unwrap().go().unwrap();
//! assert_eq!(whole.num_points(), 2);
//! ```

mod builder;
mod config;
mod error;
mod merger;
mod scope;

pub use builder::Builder;
pub use config::BuildConfig;
pub use error::{BuildError, Result};
pub use merger::Merger;
pub use scope::OuterScope;
