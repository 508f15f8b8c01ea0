// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Positions and bounding volumes with quadrant-split geometry.

use serde::{Deserialize, Serialize};

/// A 3D position. Two-dimensional data uses `z = 0`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
}

impl Point {
    /// Create a new point.
    #[inline(always)]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Axis-aligned bounding volume.
///
/// Branching only ever splits X and Y: a child keeps its parent's Z extent, and
/// vertical resolution comes from [ticks](Bounds::tick) instead. X and Y are
/// half-open (`min <= v < max`) so that every position belongs to exactly one
/// quadrant. Z never decides membership of a cell; heights outside the extent
/// clamp to the first or last tick.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    min: Point,
    max: Point,
}

impl Bounds {
    /// Create a new volume from min/max corners.
    pub fn new(min: Point, max: Point) -> Self {
        debug_assert!(
            min.x <= max.x && min.y <= max.y && min.z <= max.z,
            "bounds min must be <= max on all axes"
        );
        Self { min, max }
    }

    /// A flat (zero-height) rectangle at `z = 0`.
    ///
    /// As index bounds every point gets tick 0; as a query it selects every
    /// height.
    pub fn new_2d(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self::new(Point::new(min_x, min_y, 0.0), Point::new(max_x, max_y, 0.0))
    }

    /// Minimum corner.
    pub fn min(&self) -> Point {
        self.min
    }

    /// Maximum corner.
    pub fn max(&self) -> Point {
        self.max
    }

    /// Center of the volume.
    pub fn center(&self) -> Point {
        Point::new(
            0.5 * (self.min.x + self.max.x),
            0.5 * (self.min.y + self.max.y),
            0.5 * (self.min.z + self.max.z),
        )
    }

    /// Half of the extent along each axis.
    pub fn half_width(&self) -> Point {
        Point::new(
            0.5 * (self.max.x - self.min.x),
            0.5 * (self.max.y - self.min.y),
            0.5 * (self.max.z - self.min.z),
        )
    }

    /// Whether the volume has no height.
    #[inline]
    pub fn is_flat(&self) -> bool {
        self.max.z <= self.min.z
    }

    /// Whether `p` lies in the footprint (half-open in X and Y). Z is ignored.
    #[inline]
    pub fn contains(&self, p: &Point) -> bool {
        self.min.x <= p.x && p.x < self.max.x && self.min.y <= p.y && p.y < self.max.y
    }

    /// Whether `p` matches this volume used as a query: inside the footprint
    /// and, unless the volume [is flat](Self::is_flat), within `min.z..=max.z`.
    #[inline]
    pub fn selects(&self, p: &Point) -> bool {
        self.contains(p) && (self.is_flat() || (self.min.z <= p.z && p.z <= self.max.z))
    }

    /// Whether two footprints share any interior or boundary point.
    #[inline]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    /// The quadrant of `p`: bit 0 is set east of center, bit 1 north of center.
    #[inline]
    pub fn quadrant(&self, p: &Point) -> u8 {
        let mid = self.center();
        u8::from(p.x >= mid.x) | (u8::from(p.y >= mid.y) << 1)
    }

    /// The child volume for `quadrant`, using the same split as [`Bounds::quadrant`].
    pub fn child(&self, quadrant: u8) -> Self {
        debug_assert!(quadrant < 4, "quadrant out of range: {quadrant}");
        let mid = self.center();
        let (min_x, max_x) = if quadrant & 1 == 0 {
            (self.min.x, mid.x)
        } else {
            (mid.x, self.max.x)
        };
        let (min_y, max_y) = if quadrant & 2 == 0 {
            (self.min.y, mid.y)
        } else {
            (mid.y, self.max.y)
        };
        Self {
            min: Point::new(min_x, min_y, self.min.z),
            max: Point::new(max_x, max_y, self.max.z),
        }
    }

    /// Vertical slot of `z` at `depth`.
    ///
    /// The Z extent is divided into `2^depth` equal slots, the count an octree
    /// would have at that depth. Ordering a tube by tick therefore matches the
    /// order an octree traversal would visit its points. Values outside the
    /// extent clamp to the first or last slot.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "The scaled value is clamped to the slot range before the cast."
    )]
    pub fn tick(&self, z: f64, depth: usize) -> u64 {
        let span = self.max.z - self.min.z;
        if span <= 0.0 {
            return 0;
        }
        let slots = 1_u64 << depth.min(62);
        let t = ((z - self.min.z) / span * slots as f64).floor();
        if t <= 0.0 {
            0
        } else {
            (t as u64).min(slots - 1)
        }
    }

    /// Inclusive range of ticks at `depth` that `query` can reach. A flat query
    /// reaches all of them.
    pub fn tick_range(&self, query: &Self, depth: usize) -> (u64, u64) {
        if query.is_flat() {
            return (0, u64::MAX);
        }
        (self.tick(query.min.z, depth), self.tick(query.max.z, depth))
    }
}
