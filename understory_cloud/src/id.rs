// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hierarchical quadtree addresses.
//!
//! The root cell is `1`, and descending into quadrant `q` (0..4) from `a` yields
//! `4a + q`. Every address is therefore a leading sentinel bit followed by two
//! bits per level, which gives a few useful properties:
//!
//! - depth is `(bits - 1) / 2`,
//! - all cells of depth `d` form the contiguous range `[4^d, 2 * 4^d)`,
//! - an ancestor always compares less than its descendants,
//! - the descendants of `a` that sit `k` levels below it are exactly
//!   `[a * 4^k, a * 4^k + 4^k)`.
//!
//! The last property is what [`Id::normalize`] relies on to turn a global address
//! into a dense index local to an ancestor (a chunk anchor, for example).

use core::fmt;
use core::str::FromStr;

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Deepest level whose cells can be densely addressed with a `u64`.
pub const MAX_DENSE_DEPTH: usize = 30;

/// Arbitrary-precision quadtree path code.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(BigUint);

impl Id {
    /// The root cell.
    pub fn root() -> Self {
        Self(BigUint::one())
    }

    /// First cell of `depth`, i.e. `4^depth`.
    pub fn level_begin(depth: usize) -> Self {
        Self(BigUint::one() << (2 * depth))
    }

    /// The cell at `position` (counted from the left of the level) of `depth`.
    pub fn from_position(depth: usize, position: u64) -> Self {
        Self((BigUint::one() << (2 * depth)) + BigUint::from(position))
    }

    /// Inverse of [`Id::dense_index`].
    pub fn from_dense_index(mut index: u64) -> Self {
        let mut depth = 0_usize;
        loop {
            let width = u32::try_from(2 * depth)
                .ok()
                .and_then(|shift| 1_u64.checked_shl(shift))
                .unwrap_or(u64::MAX);
            if index < width {
                return Self::from_position(depth, index);
            }
            index -= width;
            depth += 1;
        }
    }

    /// Whether this is the root cell.
    pub fn is_root(&self) -> bool {
        self.0.is_one()
    }

    /// Depth below the root.
    #[allow(
        clippy::cast_possible_truncation,
        reason = "A depth is at most half the bit length of the id."
    )]
    pub fn depth(&self) -> usize {
        ((self.0.bits().saturating_sub(1)) / 2) as usize
    }

    /// The child in `quadrant` (bit 0 = east, bit 1 = north).
    pub fn child(&self, quadrant: u8) -> Self {
        debug_assert!(quadrant < 4, "quadrant out of range: {quadrant}");
        Self((&self.0 << 2_usize) + BigUint::from(quadrant))
    }

    /// The parent cell, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            Some(Self(&self.0 >> 2_usize))
        }
    }

    /// Quadrant of this cell within its parent, or `None` for the root.
    pub fn quadrant(&self) -> Option<u8> {
        if self.is_root() {
            return None;
        }
        (&self.0 & &BigUint::from(3_u8)).to_u8()
    }

    /// Ancestor at `depth`; the cell itself when `depth` equals its own depth.
    pub fn ancestor(&self, depth: usize) -> Option<Self> {
        let own = self.depth();
        (depth <= own).then(|| Self(&self.0 >> (2 * (own - depth))))
    }

    /// Whether `self` lies in the subtree rooted at `ancestor` (inclusive).
    pub fn is_within(&self, ancestor: &Self) -> bool {
        self.ancestor(ancestor.depth()).as_ref() == Some(ancestor)
    }

    /// The descendant `levels` below `self` at local `offset`.
    ///
    /// Inverse of [`Id::normalize`].
    pub fn descendant(&self, levels: usize, offset: u64) -> Self {
        debug_assert!(
            levels >= 32 || offset < 1_u64 << (2 * levels),
            "offset {offset} escapes {levels} levels"
        );
        Self((&self.0 << (2 * levels)) + BigUint::from(offset))
    }

    /// Offset of `self` among the descendants of `ancestor` at `self`'s depth.
    ///
    /// Fails with [`Error::OutOfRange`] when `self` is not in `ancestor`'s subtree
    /// or the offset does not fit a `u64`.
    pub fn normalize(&self, ancestor: &Self) -> Result<u64> {
        let out_of_range = || Error::OutOfRange {
            id: self.clone(),
            anchor: ancestor.clone(),
        };
        if !self.is_within(ancestor) {
            return Err(out_of_range());
        }
        let levels = self.depth() - ancestor.depth();
        let first = &ancestor.0 << (2 * levels);
        (&self.0 - &first).to_u64().ok_or_else(out_of_range)
    }

    /// Position of this cell within its level, when it fits a `u64`.
    pub fn position(&self) -> Option<u64> {
        let begin = Self::level_begin(self.depth());
        (&self.0 - &begin.0).to_u64()
    }

    /// Index of this cell in a breadth-first array holding every cell from the
    /// root down to [`MAX_DENSE_DEPTH`].
    pub fn dense_index(&self) -> Option<u64> {
        let depth = self.depth();
        if depth > MAX_DENSE_DEPTH {
            return None;
        }
        Some(cells_before(depth) + self.position()?)
    }

    /// Quadrants walked from the root down to this cell.
    pub fn path(&self) -> impl Iterator<Item = u8> + '_ {
        let three = BigUint::from(3_u8);
        (0..self.depth()).rev().map(move |level| {
            ((&self.0 >> (2 * level)) & &three)
                .to_u8()
                .unwrap_or_default()
        })
    }
}

/// Number of cells strictly above `depth`: `(4^depth - 1) / 3`.
pub const fn cells_before(depth: usize) -> u64 {
    ((1_u64 << (2 * depth)) - 1) / 3
}

/// Number of cells from the root down to and including `depth`.
pub const fn cells_through(depth: usize) -> u64 {
    cells_before(depth + 1)
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        debug_assert!(value != 0, "0 is not a cell address");
        Self(BigUint::from(value))
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = BigUint::from_str(s)
            .map_err(|e| Error::Config(format!("invalid id {s:?}: {e}")))?;
        if value.bits() == 0 {
            return Err(Error::Config("0 is not a cell address".into()));
        }
        Ok(Self(value))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.0)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
