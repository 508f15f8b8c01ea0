// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory Cloud: a disk-paged level-of-detail index for point clouds.
//!
//! Points are placed into a quadtree whose cells hold vertical "tubes": each
//! cell keeps at most one point per tick, a vertical slot derived from the
//! point's height and the cell's depth. Shallow depths therefore hold a sparse
//! sample of the whole cloud and deeper depths refine it, which gives
//! octree-like level-of-detail queries without branching on Z.
//!
//! - [`Id`] addresses cells; [`Bounds`] and [`Roller`] walk them.
//! - [`Registry`] places points across three regimes: an eagerly allocated base
//!   region, an on-demand flat region, and chunks that can be paged out to
//!   [`Storage`] and read back through [`ChunkReader`].
//! - [`Index`] ties a registry to bounds and a [`Schema`], counts placed and
//!   tossed points, and saves everything under one storage path.
//!
//! Large builds can be split into [`Subset`]s that are built independently and
//! merged with [`Index::merge`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use understory_cloud::{Bounds, Index, MemoryStorage, PointBuffer, Schema, Structure};
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let schema = Arc::new(Schema::xyz([]));
//! let bounds = Bounds::new_2d(0.0, 0.0, 100.0, 100.0);
//! let index = Index::create(
//!     storage.clone(),
//!     "cloud",
//!     bounds,
//!     schema.clone(),
//!     Structure::new(2, 6, 12).unwrap(),
//!     None,
//! )
//! .unwrap();
//!
//! let mut points = PointBuffer::new(schema);
//! points.push(&[10.0, 10.0, 0.0]);
//! points.push(&[12.0, 11.0, 0.0]);
//! points.push(&[100.0, 50.0, 0.0]); // Outside: X is half-open.
//! let stats = index.insert(&mut points, 0).unwrap();
//! assert_eq!(stats.inserted, 2);
//! assert_eq!(stats.out_of_bounds, 1);
//!
//! // The first point takes the root cell; the second one lands a level down.
//! assert_eq!(index.query(0, 1).unwrap().len(), 1);
//! assert_eq!(index.query(0, 2).unwrap().len(), 2);
//!
//! index.save().unwrap();
//! let reopened = Index::open(storage, "cloud", None).unwrap();
//! assert_eq!(reopened.num_points(), 2);
//! ```

mod bounds;
mod chunk;
mod error;
mod format;
mod id;
mod index;
mod metadata;
mod point;
mod reader;
mod registry;
mod roller;
mod schema;
mod storage;
mod structure;
mod tube;

pub use bounds::{Bounds, Point};
pub use chunk::ChunkKey;
pub use error::{Error, Result};
pub use id::{Id, MAX_DENSE_DEPTH, cells_before, cells_through};
pub use index::{Index, InsertStats};
pub use metadata::{Metadata, RegistryMeta, postfix};
pub use point::{Origin, PointId, PointInfo};
pub use reader::{BaseChunkReader, ChunkReader, PointSource};
pub use registry::{Placement, Registry};
pub use roller::Roller;
pub use schema::{DimInfo, DimSlot, DimType, ORIGIN_DIM, PointBuffer, Schema, Value};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use structure::{MAX_BASE_DEPTH, Structure, Subset};
