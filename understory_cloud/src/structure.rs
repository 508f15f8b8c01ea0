// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Depth layout of the registry and subset partitioning.

use serde::{Deserialize, Serialize};

use crate::bounds::Bounds;
use crate::error::{Error, Result};
use crate::id::{Id, MAX_DENSE_DEPTH};
use crate::roller::Roller;

/// Deepest base depth: the base region is allocated eagerly.
pub const MAX_BASE_DEPTH: usize = 10;

/// How many levels live in each residency regime.
///
/// All depth bounds are inclusive: cells at `depth <= base_depth` are in the base
/// region, `base_depth < depth <= flat_depth` in the flat region, and
/// `flat_depth < depth <= disk_depth` in chunks. A point that finds no free slot
/// at `disk_depth` is tossed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Structure {
    dimensions: usize,
    base_depth: usize,
    flat_depth: usize,
    disk_depth: usize,
    chunk_span_depth: usize,
}

impl Default for Structure {
    fn default() -> Self {
        Self {
            dimensions: 2,
            base_depth: 6,
            flat_depth: 10,
            disk_depth: 20,
            chunk_span_depth: 4,
        }
    }
}

impl Structure {
    /// A validated structure with the given regime depths.
    pub fn new(base_depth: usize, flat_depth: usize, disk_depth: usize) -> Result<Self> {
        Self {
            base_depth,
            flat_depth,
            disk_depth,
            ..Self::default()
        }
        .validate()
    }

    /// Set the number of branching dimensions. Only 2 is supported.
    pub fn with_dimensions(self, dimensions: usize) -> Result<Self> {
        Self { dimensions, ..self }.validate()
    }

    /// Set how many levels one chunk spans below its anchor.
    pub fn with_chunk_span_depth(self, chunk_span_depth: usize) -> Result<Self> {
        Self {
            chunk_span_depth,
            ..self
        }
        .validate()
    }

    /// Check every constraint, returning the structure unchanged on success.
    pub fn validate(self) -> Result<Self> {
        if self.dimensions != 2 {
            return Err(Error::Config(format!(
                "{} branching dimensions requested; only 2 (X/Y) are supported",
                self.dimensions
            )));
        }
        if self.base_depth > MAX_BASE_DEPTH {
            return Err(Error::Config(format!(
                "base depth {} exceeds {MAX_BASE_DEPTH}",
                self.base_depth
            )));
        }
        if self.flat_depth > MAX_DENSE_DEPTH {
            return Err(Error::Config(format!(
                "flat depth {} exceeds {MAX_DENSE_DEPTH}",
                self.flat_depth
            )));
        }
        if self.base_depth > self.flat_depth || self.flat_depth > self.disk_depth {
            return Err(Error::Config(format!(
                "depths must satisfy base <= flat <= disk, got {} / {} / {}",
                self.base_depth, self.flat_depth, self.disk_depth
            )));
        }
        if self.chunk_span_depth == 0 {
            return Err(Error::Config("chunk span depth must be at least 1".into()));
        }
        Ok(self)
    }

    /// Branching dimensions.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Last depth of the base region.
    pub fn base_depth(&self) -> usize {
        self.base_depth
    }

    /// Last depth of the flat region.
    pub fn flat_depth(&self) -> usize {
        self.flat_depth
    }

    /// Last depth at which points are stored.
    pub fn disk_depth(&self) -> usize {
        self.disk_depth
    }

    /// Levels between a chunk's anchor and its cells.
    pub fn chunk_span_depth(&self) -> usize {
        self.chunk_span_depth
    }

    /// Whether any depths are chunked.
    pub fn has_chunks(&self) -> bool {
        self.disk_depth > self.flat_depth
    }
}

/// One partition of a logical index: subset `id` of `of`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subset {
    id: usize,
    of: usize,
}

impl Subset {
    /// Create a subset. `of` must be a power of four of at least 4, and `id < of`.
    pub fn new(id: usize, of: usize) -> Result<Self> {
        let power_of_four = of.is_power_of_two() && of.trailing_zeros() % 2 == 0;
        if of < 4 || !power_of_four {
            return Err(Error::Config(format!(
                "subset count {of} must be a power of 4 of at least 4"
            )));
        }
        if id >= of {
            return Err(Error::Config(format!("subset id {id} is not below {of}")));
        }
        Ok(Self { id, of })
    }

    /// This subset's index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Total number of subsets.
    pub fn of(&self) -> usize {
        self.of
    }

    /// Depth whose cells are handed out one per subset.
    pub fn split_depth(&self) -> usize {
        (self.of.trailing_zeros() / 2) as usize
    }

    /// The cell this subset owns.
    pub fn cell(&self) -> Id {
        Id::from_position(self.split_depth(), self.id as u64)
    }

    /// Cursor at the subset's cell within `bounds`.
    pub fn roller(&self, bounds: Bounds) -> Roller {
        Roller::at(bounds, &self.cell())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let s = Structure::default().validate().unwrap();
        assert_eq!(
            (s.base_depth(), s.flat_depth(), s.disk_depth()),
            (6, 10, 20)
        );
        assert_eq!(s.dimensions(), 2);
        assert!(s.has_chunks());
    }

    #[test]
    fn rejects_three_branching_dimensions() {
        let err = Structure::default().with_dimensions(3).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("only 2")));
    }

    #[test]
    fn rejects_bad_depths() {
        assert!(Structure::new(7, 6, 12).is_err());
        assert!(Structure::new(2, 13, 12).is_err());
        assert!(Structure::new(11, 14, 20).is_err());
        assert!(Structure::new(2, 31, 40).is_err());
        assert!(Structure::default().with_chunk_span_depth(0).is_err());
        let flat_only = Structure::new(2, 6, 6).unwrap();
        assert!(!flat_only.has_chunks());
    }

    #[test]
    fn json_is_camel_case() {
        let s = Structure::new(2, 6, 12).unwrap();
        let json = serde_json::to_value(s).unwrap();
        assert_eq!(json["baseDepth"], 2);
        assert_eq!(json["chunkSpanDepth"], 4);
        assert_eq!(serde_json::from_value::<Structure>(json).unwrap(), s);
    }

    #[test]
    fn subsets_split_the_root() {
        assert!(Subset::new(0, 2).is_err());
        assert!(Subset::new(0, 8).is_err());
        assert!(Subset::new(4, 4).is_err());
        let s = Subset::new(2, 4).unwrap();
        assert_eq!(s.split_depth(), 1);
        assert_eq!(s.cell(), Id::root().child(2));
        let deep = Subset::new(5, 16).unwrap();
        assert_eq!(deep.split_depth(), 2);
        assert_eq!(deep.cell(), Id::root().child(1).child(1));
        let bounds = Bounds::new_2d(0.0, 0.0, 4.0, 4.0);
        assert_eq!(
            deep.roller(bounds).bounds(),
            &Bounds::new_2d(3.0, 0.0, 4.0, 1.0)
        );
    }
}
