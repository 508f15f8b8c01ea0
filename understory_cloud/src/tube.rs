// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Vertical point columns occupying one quadtree cell.

use smallvec::SmallVec;

use crate::bounds::Point;
use crate::point::PointInfo;

/// One occupied tick of a tube. Owns a copy of the point's attribute bytes.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Slot {
    pub(crate) tick: u64,
    pub(crate) point: Point,
    pub(crate) data: Box<[u8]>,
}

impl Slot {
    pub(crate) fn new(info: &PointInfo<'_>) -> Self {
        Self {
            tick: info.tick(),
            point: *info.point(),
            data: info.data().into(),
        }
    }

    pub(crate) fn info(&self) -> PointInfo<'_> {
        PointInfo::new(self.point, &self.data, self.tick)
    }
}

/// Points of one cell, sorted by tick, at most one per tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Tube {
    slots: SmallVec<[Slot; 1]>,
}

impl Tube {
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Store `info` at its tick unless that tick is already taken.
    pub(crate) fn try_insert(&mut self, info: &PointInfo<'_>) -> bool {
        match self.slots.binary_search_by_key(&info.tick(), |s| s.tick) {
            Ok(_) => false,
            Err(at) => {
                self.slots.insert(at, Slot::new(info));
                true
            }
        }
    }

    pub(crate) fn get(&self, tick: u64) -> Option<&Slot> {
        self.slots
            .binary_search_by_key(&tick, |s| s.tick)
            .ok()
            .map(|i| &self.slots[i])
    }

    pub(crate) fn iter(&self) -> core::slice::Iter<'_, Slot> {
        self.slots.iter()
    }

    /// Slots whose tick lies in `lo..=hi`.
    pub(crate) fn ticks(&self, lo: u64, hi: u64) -> &[Slot] {
        let begin = self.slots.partition_point(|s| s.tick < lo);
        let end = self.slots.partition_point(|s| s.tick <= hi);
        &self.slots[begin..end.max(begin)]
    }
}
