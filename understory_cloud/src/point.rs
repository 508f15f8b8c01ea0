// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Point records and point identifiers.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::bounds::Point;
use crate::id::Id;

/// Provenance tag of the ingestion batch that produced a point.
pub type Origin = u64;

/// A point borrowed from whichever buffer owns its attribute bytes.
///
/// `data` points into an ingestion buffer, a resident tube, or a chunk buffer.
/// The record never owns point storage and is only valid while that buffer is.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PointInfo<'a> {
    point: Point,
    data: &'a [u8],
    tick: u64,
}

impl<'a> PointInfo<'a> {
    /// Create a new record.
    pub fn new(point: Point, data: &'a [u8], tick: u64) -> Self {
        Self { point, data, tick }
    }

    /// Position of the point.
    pub fn point(&self) -> &Point {
        &self.point
    }

    /// Raw attribute bytes in the index's native layout.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Vertical ordering key within the point's tube.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// The same record re-keyed with `tick`.
    pub fn with_tick(self, tick: u64) -> Self {
        Self { tick, ..self }
    }
}

/// Identifies one stored point: the cell holding it plus its tick in that cell's tube.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PointId {
    /// Owning cell.
    pub id: Id,
    /// Slot within the cell's tube.
    pub tick: u64,
}

impl PointId {
    /// Create a new point identifier.
    pub fn new(id: Id, tick: u64) -> Self {
        Self { id, tick }
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_info_borrows_its_bytes() {
        let buffer = vec![1_u8, 2, 3, 4];
        let info = PointInfo::new(Point::new(1.0, 2.0, 3.0), &buffer[1..3], 7);
        assert_eq!(info.data(), &[2, 3]);
        assert_eq!(info.tick(), 7);
        let other = info.with_tick(2);
        assert_eq!(other.tick(), 2);
        assert_eq!(other.point(), info.point());
    }

    #[test]
    fn point_ids_sort_by_cell_then_tick() {
        let a = PointId::new(Id::root(), 3);
        let b = PointId::new(Id::root().child(0), 0);
        let c = PointId::new(Id::root().child(0), 1);
        let mut ids = vec![c.clone(), a.clone(), b.clone()];
        ids.sort();
        assert_eq!(ids, vec![a, b, c]);
        assert_eq!(PointId::new(Id::from(22), 4).to_string(), "22:4");
    }
}
