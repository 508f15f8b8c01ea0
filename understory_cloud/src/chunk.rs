// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Live chunks: the writable form of one persisted address range.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bounds::Bounds;
use crate::error::{Error, Result};
use crate::format::{FileKind, Writer};
use crate::id::Id;
use crate::point::PointInfo;
use crate::reader::{ChunkReader, PointSource};
use crate::tube::{Slot, Tube};

/// Address of a chunk: every cell at `depth` below `anchor`.
///
/// The anchor sits `min(span, depth)` levels above the cells, so one chunk holds
/// up to `4^span` tubes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    /// Depth of the cells held by the chunk.
    pub depth: usize,
    /// Common ancestor of those cells.
    #[serde(rename = "id")]
    pub anchor: Id,
}

impl ChunkKey {
    /// The chunk holding cell `id` when chunks span `span` levels.
    pub fn for_cell(id: &Id, span: usize) -> Self {
        let depth = id.depth();
        let anchor = id
            .ancestor(depth - span.min(depth))
            .unwrap_or_else(Id::root);
        Self { depth, anchor }
    }

    /// Levels between the anchor and the cells.
    pub fn levels(&self) -> usize {
        self.depth - self.anchor.depth()
    }

    /// Offset of cell `id` below the anchor.
    ///
    /// Fails with [`Error::OutOfRange`] when `id` is not one of this chunk's cells.
    pub fn normalize(&self, id: &Id) -> Result<u64> {
        if id.depth() != self.depth {
            return Err(Error::OutOfRange {
                id: id.clone(),
                anchor: self.anchor.clone(),
            });
        }
        id.normalize(&self.anchor)
    }

    /// Storage key of this chunk's file under index `path`.
    pub fn file_key(&self, path: &str, postfix: &str) -> String {
        format!("{path}/chunks/{}-{}{postfix}", self.depth, self.anchor)
    }
}

/// In-memory chunk accepting insertions.
///
/// Tubes are keyed by the cell's offset below the anchor (see [`Id::normalize`]).
#[derive(Clone, Debug)]
pub(crate) struct Chunk {
    key: ChunkKey,
    bounds: Bounds,
    tubes: BTreeMap<u64, Tube>,
    len: usize,
}

impl Chunk {
    /// An empty chunk. `bounds` are the anchor cell's bounds.
    pub(crate) fn new(key: ChunkKey, bounds: Bounds) -> Self {
        Self {
            key,
            bounds,
            tubes: BTreeMap::new(),
            len: 0,
        }
    }

    /// Rebuild a live chunk from a persisted one.
    pub(crate) fn from_reader(reader: &ChunkReader) -> Result<Self> {
        let mut chunk = Self::new(reader.key().clone(), *reader.bounds());
        for i in 0..reader.len() {
            let (cell, info) = reader.local(i)?;
            if chunk.tubes.entry(cell).or_default().try_insert(&info) {
                chunk.len += 1;
            }
        }
        Ok(chunk)
    }

    pub(crate) fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Store `info` in cell `id` unless its tick is taken.
    pub(crate) fn try_insert(&mut self, id: &Id, info: &PointInfo<'_>) -> Result<bool> {
        let cell = self.key.normalize(id)?;
        let placed = self.tubes.entry(cell).or_default().try_insert(info);
        if placed {
            self.len += 1;
        }
        Ok(placed)
    }

    pub(crate) fn get(&self, id: &Id, tick: u64) -> Option<&Slot> {
        let cell = self.key.normalize(id).ok()?;
        self.tubes.get(&cell)?.get(tick)
    }

    /// Every point with its cell, in cell order.
    pub(crate) fn points(&self) -> impl Iterator<Item = (Id, PointInfo<'_>)> + '_ {
        let levels = self.key.levels();
        self.tubes.iter().flat_map(move |(cell, tube)| {
            let id = self.key.anchor.descendant(levels, *cell);
            tube.iter().map(move |slot| (id.clone(), slot.info()))
        })
    }

    /// Serialize in `(tick, cell)` order.
    pub(crate) fn encode(&self, point_size: usize) -> Vec<u8> {
        let mut order: Vec<(u64, u64, &Slot)> = self
            .tubes
            .iter()
            .flat_map(|(cell, tube)| tube.iter().map(move |s| (s.tick, *cell, s)))
            .collect();
        order.sort_unstable_by_key(|(tick, cell, _)| (*tick, *cell));
        let depth = u32::try_from(self.key.depth).unwrap_or(u32::MAX);
        let mut writer = Writer::new(FileKind::Chunk, point_size, order.len() as u64, depth);
        for (tick, cell, slot) in order {
            writer.push(cell, tick, &slot.point, &slot.data);
        }
        writer.finish()
    }
}

impl PointSource for Chunk {
    fn visit_candidates(
        &self,
        query: &Bounds,
        visit: &mut dyn FnMut(Id, PointInfo<'_>),
    ) -> Result<()> {
        let (lo, hi) = self.bounds.tick_range(query, self.key.depth);
        let levels = self.key.levels();
        for (cell, tube) in &self.tubes {
            let slots = tube.ticks(lo, hi);
            if slots.is_empty() {
                continue;
            }
            let id = self.key.anchor.descendant(levels, *cell);
            for slot in slots {
                visit(id.clone(), slot.info());
            }
        }
        Ok(())
    }
}
