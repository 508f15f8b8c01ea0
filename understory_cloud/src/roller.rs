// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Traversal cursor pairing a cell address with its bounds.

use crate::bounds::{Bounds, Point};
use crate::id::Id;

/// Immutable cursor over the quadtree.
///
/// A roller is never advanced in place: [`Roller::child`] and [`Roller::descend`]
/// return new cursors, so one can be shared freely between concurrent insertions.
/// Its [`Id`] and [`Bounds`] always follow the same quadrant split.
#[derive(Clone, Debug, PartialEq)]
pub struct Roller {
    id: Id,
    bounds: Bounds,
    depth: usize,
}

impl Roller {
    /// A cursor at the root cell of `bounds`.
    pub fn new(bounds: Bounds) -> Self {
        Self {
            id: Id::root(),
            bounds,
            depth: 0,
        }
    }

    /// A cursor at `id`, walking down from the root `bounds`.
    pub fn at(bounds: Bounds, id: &Id) -> Self {
        id.path().fold(Self::new(bounds), |roller, q| roller.child(q))
    }

    /// Address of the current cell.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Bounds of the current cell.
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Depth of the current cell.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The cursor for `quadrant` of this cell.
    pub fn child(&self, quadrant: u8) -> Self {
        Self {
            id: self.id.child(quadrant),
            bounds: self.bounds.child(quadrant),
            depth: self.depth + 1,
        }
    }

    /// The child cursor whose cell contains `point`.
    pub fn descend(&self, point: &Point) -> Self {
        self.child(self.bounds.quadrant(point))
    }

    /// All four child cursors in quadrant order.
    pub fn children(&self) -> [Self; 4] {
        [self.child(0), self.child(1), self.child(2), self.child(3)]
    }

    /// Vertical slot of `point` within this cell's tube.
    pub fn tick(&self, point: &Point) -> u64 {
        self.bounds.tick(point.z, self.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descend_tracks_id_and_bounds() {
        let root = Roller::new(Bounds::new_2d(0.0, 0.0, 100.0, 100.0));
        let p = Point::new(80.0, 10.0, 0.0);
        let a = root.descend(&p);
        assert_eq!(a.depth(), 1);
        assert_eq!(a.id(), &Id::root().child(1));
        assert_eq!(a.bounds(), &Bounds::new_2d(50.0, 0.0, 100.0, 50.0));
        let b = a.descend(&p);
        assert_eq!(b.id(), &Id::root().child(1).child(1));
        assert!(b.bounds().contains(&p));
        // The parent cursor is untouched.
        assert_eq!(a.depth(), 1);
    }

    #[test]
    fn at_matches_repeated_descent() {
        let bounds = Bounds::new_2d(-10.0, -10.0, 10.0, 10.0);
        let p = Point::new(3.3, -7.1, 0.0);
        let mut roller = Roller::new(bounds);
        for _ in 0..9 {
            roller = roller.descend(&p);
        }
        assert_eq!(Roller::at(bounds, roller.id()), roller);
    }

    #[test]
    fn children_are_quadrant_ordered() {
        let root = Roller::new(Bounds::new_2d(0.0, 0.0, 4.0, 4.0));
        for (q, child) in root.children().iter().enumerate() {
            assert_eq!(child.id().quadrant(), Some(q as u8));
            assert_eq!(child.bounds(), &root.bounds().child(q as u8));
        }
    }

    #[test]
    fn tick_uses_cursor_depth() {
        let root = Roller::new(Bounds::new(
            Point::new(0.0, 0.0, 0.0),
            Point::new(4.0, 4.0, 4.0),
        ));
        let p = Point::new(1.0, 1.0, 3.0);
        assert_eq!(root.tick(&p), 0);
        assert_eq!(root.descend(&p).tick(&p), 1);
        assert_eq!(root.descend(&p).descend(&p).tick(&p), 3);
    }
}
