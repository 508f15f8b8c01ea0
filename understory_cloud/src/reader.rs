// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Read-only views over persisted point files.
//!
//! Both readers keep the raw file buffer and hand out [`PointInfo`] records that
//! borrow from it. [`ChunkReader`] answers region queries with a tick-range
//! search over a tick-ordered chunk; [`BaseChunkReader`] indexes the base file
//! directly by cell.

use core::ops::Range;

use crate::bounds::Bounds;
use crate::chunk::ChunkKey;
use crate::error::{Error, Result};
use crate::format::{self, Decoded, FileKind, HEADER_LEN, RECORD_PREFIX};
use crate::id::{Id, cells_through};
use crate::point::PointInfo;

/// Ordered point access by region.
pub trait PointSource {
    /// Call `visit` with every point that may intersect `query`.
    ///
    /// This is a broad phase: every point inside `query` is visited, but so may
    /// be some points outside it. Callers test containment themselves.
    fn visit_candidates(
        &self,
        query: &Bounds,
        visit: &mut dyn FnMut(Id, PointInfo<'_>),
    ) -> Result<()>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    tick: u64,
    cell: u64,
}

/// Immutable view over one persisted chunk, ordered by `(tick, cell)`.
#[derive(Debug)]
pub struct ChunkReader {
    path: String,
    key: ChunkKey,
    bounds: Bounds,
    point_size: usize,
    data: Option<Vec<u8>>,
    entries: Vec<Entry>,
}

impl ChunkReader {
    /// Validate and index a chunk file.
    ///
    /// `bounds` are the anchor cell's bounds and `path` is only used in errors.
    pub fn new(
        path: impl Into<String>,
        key: ChunkKey,
        bounds: Bounds,
        point_size: usize,
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let mut reader = Self {
            path: path.into(),
            key,
            bounds,
            point_size,
            data: None,
            entries: Vec::new(),
        };
        reader.reload(bytes)?;
        Ok(reader)
    }

    /// Replace the buffer, re-validating it.
    pub fn reload(&mut self, bytes: Vec<u8>) -> Result<()> {
        let file = Decoded::parse(&self.path, &bytes, FileKind::Chunk, self.point_size)?;
        if file.header.depth as usize != self.key.depth {
            return Err(Error::format(
                &self.path,
                format!(
                    "chunk depth {} does not match key depth {}",
                    file.header.depth, self.key.depth
                ),
            ));
        }
        let levels = self.key.levels();
        let span = u32::try_from(2 * levels)
            .ok()
            .and_then(|s| 1_u64.checked_shl(s));
        let mut entries = Vec::with_capacity(file.len());
        for record in file.records() {
            if span.is_some_and(|span| record.cell >= span) {
                return Err(Error::format(
                    &self.path,
                    format!("cell {} escapes {levels} levels", record.cell),
                ));
            }
            let entry = Entry {
                tick: record.tick,
                cell: record.cell,
            };
            if entries.last().is_some_and(|last: &Entry| *last >= entry) {
                return Err(Error::format(&self.path, "records out of tick order"));
            }
            entries.push(entry);
        }
        self.entries = entries;
        self.data = Some(bytes);
        Ok(())
    }

    /// Drop the raw buffer. The ordering index stays available.
    pub fn release(&mut self) {
        self.data = None;
    }

    /// Key of the chunk.
    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    /// Bounds of the anchor cell.
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chunk holds no points.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of the raw buffer in bytes.
    ///
    /// Fails with [`Error::ChunkReleased`] after [`ChunkReader::release`].
    pub fn size(&self) -> Result<usize> {
        self.bytes().map(<[u8]>::len)
    }

    fn bytes(&self) -> Result<&[u8]> {
        self.data
            .as_deref()
            .ok_or_else(|| Error::ChunkReleased(self.key.anchor.clone()))
    }

    /// Offset of `id` below the chunk's anchor.
    ///
    /// Fails with [`Error::OutOfRange`] when `id` is not one of this chunk's cells.
    pub fn normalize(&self, id: &Id) -> Result<u64> {
        self.key.normalize(id)
    }

    /// Contiguous range of positions whose ticks can reach `query`.
    pub fn candidates(&self, query: &Bounds) -> Range<usize> {
        let (lo, hi) = self.bounds.tick_range(query, self.key.depth);
        let begin = self.entries.partition_point(|e| e.tick < lo);
        let end = self.entries.partition_point(|e| e.tick <= hi);
        begin..end.max(begin)
    }

    /// The `i`-th point with its anchor-relative cell offset.
    pub fn local(&self, i: usize) -> Result<(u64, PointInfo<'_>)> {
        let bytes = self.bytes()?;
        let at = HEADER_LEN + i * (RECORD_PREFIX + self.point_size);
        let record = format::record_at(bytes, at, self.point_size);
        Ok((
            record.cell,
            PointInfo::new(record.point, record.data, record.tick),
        ))
    }

    /// The `i`-th point with its cell.
    pub fn point(&self, i: usize) -> Result<(Id, PointInfo<'_>)> {
        let (cell, info) = self.local(i)?;
        Ok((self.key.anchor.descendant(self.key.levels(), cell), info))
    }

    /// The point stored at `tick` of cell `id`, if any.
    pub fn find(&self, id: &Id, tick: u64) -> Result<Option<PointInfo<'_>>> {
        let cell = self.normalize(id)?;
        match self.entries.binary_search(&Entry { tick, cell }) {
            Ok(i) => self.local(i).map(|(_, info)| Some(info)),
            Err(_) => {
                self.bytes()?;
                Ok(None)
            }
        }
    }
}

impl PointSource for ChunkReader {
    fn visit_candidates(
        &self,
        query: &Bounds,
        visit: &mut dyn FnMut(Id, PointInfo<'_>),
    ) -> Result<()> {
        for i in self.candidates(query) {
            let (id, info) = self.point(i)?;
            visit(id, info);
        }
        Ok(())
    }
}

/// View over the base file: every cell from the root down to the base depth,
/// addressed by dense index.
#[derive(Debug)]
pub struct BaseChunkReader {
    bounds: Bounds,
    depth: usize,
    point_size: usize,
    data: Vec<u8>,
    /// `starts[i]..starts[i + 1]` are the records of dense cell `i`.
    starts: Vec<usize>,
}

impl BaseChunkReader {
    /// Validate and index a base file written for cells down to `depth`.
    ///
    /// `bounds` are the index's root bounds and `path` is only used in errors.
    pub fn new(
        path: &str,
        bounds: Bounds,
        depth: usize,
        point_size: usize,
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let file = Decoded::parse(path, &bytes, FileKind::Base, point_size)?;
        if file.header.depth as usize != depth {
            return Err(Error::format(
                path,
                format!(
                    "base depth {} does not match structure depth {depth}",
                    file.header.depth
                ),
            ));
        }
        let cells = usize::try_from(cells_through(depth))
            .map_err(|_| Error::format(path, "base region too large"))?;
        let mut starts = vec![0_usize; cells + 1];
        let mut previous: Option<(u64, u64)> = None;
        for record in file.records() {
            let key = (record.cell, record.tick);
            if previous.is_some_and(|p| p >= key) {
                return Err(Error::format(path, "records out of cell order"));
            }
            previous = Some(key);
            let cell = usize::try_from(record.cell)
                .ok()
                .filter(|c| *c < cells)
                .ok_or_else(|| {
                    Error::format(path, format!("cell {} beyond depth {depth}", record.cell))
                })?;
            starts[cell + 1] += 1;
        }
        for i in 0..cells {
            starts[i + 1] += starts[i];
        }
        Ok(Self {
            bounds,
            depth,
            point_size,
            data: bytes,
            starts,
        })
    }

    /// Deepest depth held.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total number of points.
    pub fn len(&self) -> usize {
        self.starts.last().copied().unwrap_or(0)
    }

    /// Whether no cell holds a point.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the raw buffer in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn info(&self, i: usize) -> PointInfo<'_> {
        let at = HEADER_LEN + i * (RECORD_PREFIX + self.point_size);
        let record = format::record_at(&self.data, at, self.point_size);
        PointInfo::new(record.point, record.data, record.tick)
    }

    fn dense(&self, id: &Id) -> Result<usize> {
        id.dense_index()
            .and_then(|d| usize::try_from(d).ok())
            .filter(|d| *d + 1 < self.starts.len())
            .ok_or_else(|| Error::TubeMissing(id.clone()))
    }

    /// The whole tube of cell `id`, in tick order.
    ///
    /// Fails with [`Error::TubeMissing`] for cells deeper than [`Self::depth`].
    pub fn tube_data(&self, id: &Id) -> Result<Vec<PointInfo<'_>>> {
        let dense = self.dense(id)?;
        Ok((self.starts[dense]..self.starts[dense + 1])
            .map(|i| self.info(i))
            .collect())
    }

    /// Non-empty tubes in dense order.
    pub fn tubes(&self) -> impl Iterator<Item = (Id, Vec<PointInfo<'_>>)> + '_ {
        self.starts.windows(2).enumerate().filter_map(|(dense, w)| {
            (w[0] < w[1]).then(|| {
                (
                    Id::from_dense_index(dense as u64),
                    (w[0]..w[1]).map(|i| self.info(i)).collect(),
                )
            })
        })
    }
}

impl PointSource for BaseChunkReader {
    fn visit_candidates(
        &self,
        query: &Bounds,
        visit: &mut dyn FnMut(Id, PointInfo<'_>),
    ) -> Result<()> {
        for (id, tube) in self.tubes() {
            let (lo, hi) = self.bounds.tick_range(query, id.depth());
            for info in tube {
                if (lo..=hi).contains(&info.tick()) {
                    visit(id.clone(), info);
                }
            }
        }
        Ok(())
    }
}
