// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hierarchical placement of points across the three residency regimes.
//!
//! - Base region (`depth <= base_depth`): one tube per cell in a dense array,
//!   allocated up front.
//! - Flat region (`depth <= flat_depth`): tubes created on demand, held in
//!   sharded maps keyed by dense index and persisted as one file.
//! - Chunked region (`depth <= disk_depth`): tubes grouped into [`ChunkKey`]
//!   ranges. A chunk is either live in memory or stored; stored chunks are read
//!   through memoized [`ChunkReader`]s and promoted back to live when a point is
//!   placed in them.
//!
//! Every tube is guarded by the lock of its region (cell, shard or chunk), so
//! concurrent insertions only contend when their paths meet.

use core::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::bounds::Bounds;
use crate::chunk::{Chunk, ChunkKey};
use crate::error::{Error, Result};
use crate::format::{Decoded, FileKind, Writer};
use crate::id::{Id, cells_through};
use crate::point::{PointId, PointInfo};
use crate::reader::{BaseChunkReader, ChunkReader, PointSource};
use crate::roller::Roller;
use crate::storage::Storage;
use crate::structure::Structure;
use crate::tube::Tube;

const FLAT_SHARDS: usize = 64;

/// Result of offering a point to the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// The point now occupies this slot.
    Placed(PointId),
    /// The slot at the current depth is taken; the point continues one level down.
    Descend,
    /// No free slot down to the deepest depth.
    Tossed,
}

#[derive(Clone, Debug)]
enum ChunkSlot {
    Live(Chunk),
    Stored { postfix: String },
}

/// Where and how an index's files are laid out.
#[derive(Clone, Debug)]
pub(crate) struct Layout {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) path: String,
    pub(crate) bounds: Bounds,
    pub(crate) structure: Structure,
    pub(crate) point_size: usize,
}

/// Owner of every placed point.
pub struct Registry {
    storage: Arc<dyn Storage>,
    path: String,
    postfix: String,
    bounds: Bounds,
    structure: Structure,
    point_size: usize,
    null_depth: usize,
    base: Vec<Mutex<Tube>>,
    flat: Vec<Mutex<HashMap<u64, Tube>>>,
    chunks: RwLock<HashMap<ChunkKey, Arc<Mutex<ChunkSlot>>>>,
    readers: Mutex<HashMap<ChunkKey, Arc<ChunkReader>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("path", &self.path)
            .field("postfix", &self.postfix)
            .field("structure", &self.structure)
            .field("null_depth", &self.null_depth)
            .field("chunks", &self.chunks.read().len())
            .finish_non_exhaustive()
    }
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "Reduced modulo the shard count."
)]
fn shard(dense: u64) -> usize {
    (dense % FLAT_SHARDS as u64) as usize
}

fn dense(id: &Id) -> Result<u64> {
    id.dense_index().ok_or_else(|| Error::TubeMissing(id.clone()))
}

impl Registry {
    /// An empty registry. Files are written with `postfix` appended to their key.
    pub(crate) fn new(layout: Layout, postfix: String, null_depth: usize) -> Self {
        let Layout {
            storage,
            path,
            bounds,
            structure,
            point_size,
        } = layout;
        let cells = usize::try_from(cells_through(structure.base_depth())).unwrap_or(0);
        Self {
            storage,
            path,
            postfix,
            bounds,
            structure,
            point_size,
            null_depth,
            base: (0..cells).map(|_| Mutex::new(Tube::default())).collect(),
            flat: (0..FLAT_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            chunks: RwLock::new(HashMap::new()),
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild a registry saved under `layout.path` with `postfix`.
    pub(crate) fn load(
        layout: Layout,
        postfix: String,
        null_depth: usize,
        chunks: &[ChunkKey],
    ) -> Result<Self> {
        let registry = Self::new(layout, postfix, null_depth);
        registry.load_base()?;
        registry.load_flat()?;
        let span = registry.structure.chunk_span_depth();
        let mut slots = registry.chunks.write();
        for key in chunks {
            let fits = key.depth > registry.structure.flat_depth()
                && key.depth <= registry.structure.disk_depth()
                && key.anchor.depth() <= key.depth
                && ChunkKey::for_cell(&key.anchor.descendant(key.levels(), 0), span) == *key;
            if !fits {
                return Err(Error::format(
                    key.file_key(&registry.path, &registry.postfix),
                    "chunk key does not fit the structure",
                ));
            }
            slots.insert(
                key.clone(),
                Arc::new(Mutex::new(ChunkSlot::Stored {
                    postfix: registry.postfix.clone(),
                })),
            );
        }
        drop(slots);
        debug!(
            path = %registry.path,
            chunks = chunks.len(),
            "loaded registry"
        );
        Ok(registry)
    }

    fn base_key(&self) -> String {
        format!("{}/base{}", self.path, self.postfix)
    }

    fn flat_key(&self) -> String {
        format!("{}/flat{}", self.path, self.postfix)
    }

    fn load_base(&self) -> Result<()> {
        let key = self.base_key();
        let bytes = self.storage.read(&key)?;
        let reader = BaseChunkReader::new(
            &key,
            self.bounds,
            self.structure.base_depth(),
            self.point_size,
            bytes,
        )?;
        for (id, tube) in reader.tubes() {
            let dense = usize::try_from(dense(&id)?).unwrap_or(usize::MAX);
            let mut cell = self.base[dense].lock();
            for info in &tube {
                cell.try_insert(info);
            }
        }
        Ok(())
    }

    fn load_flat(&self) -> Result<()> {
        let key = self.flat_key();
        let bytes = self.storage.read(&key)?;
        let file = Decoded::parse(&key, &bytes, FileKind::Flat, self.point_size)?;
        if file.header.depth as usize != self.structure.flat_depth() {
            return Err(Error::format(&key, "flat depth does not match structure"));
        }
        let cells = cells_through(self.structure.base_depth())
            ..cells_through(self.structure.flat_depth());
        for record in file.records() {
            if !cells.contains(&record.cell) {
                return Err(Error::format(
                    &key,
                    format!("cell {} outside the flat region", record.cell),
                ));
            }
            let info = PointInfo::new(record.point, record.data, record.tick);
            self.flat[shard(record.cell)]
                .lock()
                .entry(record.cell)
                .or_default()
                .try_insert(&info);
        }
        Ok(())
    }

    /// Depth layout.
    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    /// Depths above this one hold no points by construction.
    pub fn null_depth(&self) -> usize {
        self.null_depth
    }

    pub(crate) fn set_postfix(&mut self, postfix: String) {
        self.postfix = postfix;
    }

    fn anchor_bounds(&self, key: &ChunkKey) -> Bounds {
        *Roller::at(self.bounds, &key.anchor).bounds()
    }

    /// Place `info` at or below `roller`.
    ///
    /// Walks down one level at a time: at each depth the point takes the slot
    /// for its tick if that slot is free, and otherwise moves on to the child
    /// cell containing it. Points already resident are never displaced.
    pub fn add_point(&self, info: &PointInfo<'_>, roller: Roller) -> Result<Placement> {
        let mut roller = roller;
        loop {
            if roller.depth() > self.structure.disk_depth() {
                return Ok(Placement::Tossed);
            }
            if !roller.bounds().contains(info.point()) {
                warn!(
                    id = %roller.id(),
                    point = ?info.point(),
                    "point escaped its cell during placement"
                );
                return Ok(Placement::Tossed);
            }
            match self.place(&roller, info)? {
                Placement::Descend => roller = roller.descend(info.point()),
                done => return Ok(done),
            }
        }
    }

    fn place(&self, roller: &Roller, info: &PointInfo<'_>) -> Result<Placement> {
        let depth = roller.depth();
        let id = roller.id();
        let info = info.with_tick(roller.tick(info.point()));
        let placed = if depth <= self.structure.base_depth() {
            let index = usize::try_from(dense(id)?).unwrap_or(usize::MAX);
            self.base[index].lock().try_insert(&info)
        } else if depth <= self.structure.flat_depth() {
            let index = dense(id)?;
            self.flat[shard(index)]
                .lock()
                .entry(index)
                .or_default()
                .try_insert(&info)
        } else {
            let key = ChunkKey::for_cell(id, self.structure.chunk_span_depth());
            let slot = self.slot(&key);
            let mut slot = slot.lock();
            self.live(&key, &mut slot)?.try_insert(id, &info)?
        };
        Ok(if placed {
            Placement::Placed(PointId::new(id.clone(), info.tick()))
        } else {
            Placement::Descend
        })
    }

    fn slot(&self, key: &ChunkKey) -> Arc<Mutex<ChunkSlot>> {
        if let Some(slot) = self.chunks.read().get(key) {
            return slot.clone();
        }
        self.chunks
            .write()
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(depth = key.depth, anchor = %key.anchor, "new chunk");
                Arc::new(Mutex::new(ChunkSlot::Live(Chunk::new(
                    key.clone(),
                    self.anchor_bounds(key),
                ))))
            })
            .clone()
    }

    fn live<'a>(&self, key: &ChunkKey, slot: &'a mut ChunkSlot) -> Result<&'a mut Chunk> {
        if let ChunkSlot::Stored { postfix } = slot {
            let reader = self.reader(key, postfix)?;
            let chunk = Chunk::from_reader(&reader)?;
            self.readers.lock().remove(key);
            debug!(depth = key.depth, anchor = %key.anchor, "promoted stored chunk");
            *slot = ChunkSlot::Live(chunk);
        }
        match slot {
            ChunkSlot::Live(chunk) => Ok(chunk),
            ChunkSlot::Stored { .. } => Err(Error::ChunkReleased(key.anchor.clone())),
        }
    }

    fn load_reader(&self, key: &ChunkKey, postfix: &str) -> Result<ChunkReader> {
        let file = key.file_key(&self.path, postfix);
        let bytes = self.storage.read(&file)?;
        debug!(chunk = %file, bytes = bytes.len(), "loading chunk");
        ChunkReader::new(file, key.clone(), self.anchor_bounds(key), self.point_size, bytes)
    }

    /// Memoized reader for a stored chunk. Callers hold the chunk's slot lock,
    /// so the file can not be rewritten while the reader is loaded.
    fn reader(&self, key: &ChunkKey, postfix: &str) -> Result<Arc<ChunkReader>> {
        if let Some(reader) = self.readers.lock().get(key) {
            return Ok(reader.clone());
        }
        let reader = Arc::new(self.load_reader(key, postfix)?);
        Ok(self
            .readers
            .lock()
            .entry(key.clone())
            .or_insert(reader)
            .clone())
    }

    /// Identifiers of points in cells with `begin <= depth < end`, optionally
    /// restricted to points inside `query`, sorted by `(Id, tick)`.
    pub fn query(&self, query: Option<&Bounds>, begin: usize, end: usize) -> Result<Vec<PointId>> {
        let mut out = Vec::new();
        if begin < end {
            self.walk(&Roller::new(self.bounds), query, begin, end, &mut out);
            self.query_chunks(query, begin, end, &mut out)?;
        }
        out.sort_unstable();
        Ok(out)
    }

    fn walk(
        &self,
        roller: &Roller,
        query: Option<&Bounds>,
        begin: usize,
        end: usize,
        out: &mut Vec<PointId>,
    ) {
        let depth = roller.depth();
        if depth >= end || depth > self.structure.flat_depth() {
            return;
        }
        let mut occupied = false;
        self.visit_resident(roller.id(), &mut |info| {
            occupied = true;
            if depth >= begin && query.is_none_or(|q| q.selects(info.point())) {
                out.push(PointId::new(roller.id().clone(), info.tick()));
            }
        });
        if !occupied && depth >= self.null_depth {
            return;
        }
        for child in roller.children() {
            if query.is_none_or(|q| q.overlaps(child.bounds())) {
                self.walk(&child, query, begin, end, out);
            }
        }
    }

    fn visit_resident(&self, id: &Id, visit: &mut dyn FnMut(&PointInfo<'_>)) {
        let Some(index) = id.dense_index() else {
            return;
        };
        if id.depth() <= self.structure.base_depth() {
            let Some(cell) = usize::try_from(index).ok().and_then(|i| self.base.get(i)) else {
                return;
            };
            for slot in cell.lock().iter() {
                visit(&slot.info());
            }
        } else if let Some(tube) = self.flat[shard(index)].lock().get(&index) {
            for slot in tube.iter() {
                visit(&slot.info());
            }
        }
    }

    fn query_chunks(
        &self,
        query: Option<&Bounds>,
        begin: usize,
        end: usize,
        out: &mut Vec<PointId>,
    ) -> Result<()> {
        let depths =
            begin.max(self.structure.flat_depth() + 1)..end.min(self.structure.disk_depth() + 1);
        if !self.structure.has_chunks() || depths.is_empty() {
            return Ok(());
        }
        let mut slots: Vec<(ChunkKey, Arc<Mutex<ChunkSlot>>)> = self
            .chunks
            .read()
            .iter()
            .filter(|(key, _)| depths.contains(&key.depth))
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        slots.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let region = query.copied().unwrap_or(self.bounds);
        let mut visit = |id: Id, info: PointInfo<'_>| {
            if query.is_none_or(|q| q.selects(info.point())) {
                out.push(PointId::new(id, info.tick()));
            }
        };
        for (key, slot) in slots {
            if !region.overlaps(&self.anchor_bounds(&key)) {
                continue;
            }
            match &*slot.lock() {
                ChunkSlot::Live(chunk) => chunk.visit_candidates(&region, &mut visit)?,
                ChunkSlot::Stored { postfix } => self
                    .reader(&key, postfix)?
                    .visit_candidates(&region, &mut visit)?,
            }
        }
        Ok(())
    }

    /// Native attribute bytes of `point`, or `None` if nothing is stored there.
    pub fn point_data(&self, point: &PointId) -> Result<Option<Vec<u8>>> {
        let depth = point.id.depth();
        if depth > self.structure.disk_depth() {
            return Ok(None);
        }
        if depth <= self.structure.flat_depth() {
            let mut found = None;
            self.visit_resident(&point.id, &mut |info| {
                if info.tick() == point.tick {
                    found = Some(info.data().to_vec());
                }
            });
            return Ok(found);
        }
        let key = ChunkKey::for_cell(&point.id, self.structure.chunk_span_depth());
        let Some(slot) = self.chunks.read().get(&key).cloned() else {
            return Ok(None);
        };
        let slot = slot.lock();
        match &*slot {
            ChunkSlot::Live(chunk) => Ok(chunk
                .get(&point.id, point.tick)
                .map(|s| s.data.to_vec())),
            ChunkSlot::Stored { postfix } => {
                let reader = self.reader(&key, postfix)?;
                Ok(reader
                    .find(&point.id, point.tick)?
                    .map(|info| info.data().to_vec()))
            }
        }
    }

    /// Keys of every chunk, sorted.
    pub fn chunk_keys(&self) -> Vec<ChunkKey> {
        let mut keys: Vec<ChunkKey> = self.chunks.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Number of chunks currently held in memory.
    pub fn live_chunks(&self) -> usize {
        self.chunks
            .read()
            .values()
            .filter(|slot| matches!(&*slot.lock(), ChunkSlot::Live(_)))
            .count()
    }

    /// Number of memoized chunk readers.
    pub fn cached_readers(&self) -> usize {
        self.readers.lock().len()
    }

    /// Flush every live chunk and drop it from memory, along with every
    /// memoized reader. Returns how many chunks were paged out.
    pub fn page_out(&self) -> Result<usize> {
        let slots: Vec<(ChunkKey, Arc<Mutex<ChunkSlot>>)> = self
            .chunks
            .read()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        let mut paged = 0;
        for (key, slot) in slots {
            let mut slot = slot.lock();
            let bytes = match &*slot {
                ChunkSlot::Live(chunk) => chunk.encode(self.point_size),
                ChunkSlot::Stored { .. } => continue,
            };
            self.storage
                .write(&key.file_key(&self.path, &self.postfix), &bytes)?;
            *slot = ChunkSlot::Stored {
                postfix: self.postfix.clone(),
            };
            paged += 1;
        }
        let readers = {
            let mut readers = self.readers.lock();
            let count = readers.len();
            readers.clear();
            count
        };
        debug!(path = %self.path, paged, readers, "paged out chunks");
        Ok(paged)
    }

    /// Persist chunks, then the base and flat files. Returns the chunk keys.
    ///
    /// Stored chunks saved under another postfix are copied to the current one
    /// without being decoded.
    pub(crate) fn save(&self) -> Result<Vec<ChunkKey>> {
        let slots: Vec<(ChunkKey, Arc<Mutex<ChunkSlot>>)> = self
            .chunks
            .read()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        let mut keys = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            let target = key.file_key(&self.path, &self.postfix);
            let mut slot = slot.lock();
            let moved_from = match &*slot {
                ChunkSlot::Live(chunk) => {
                    self.storage
                        .write(&target, &chunk.encode(self.point_size))?;
                    debug!(chunk = %target, points = chunk.len(), "flushed chunk");
                    None
                }
                ChunkSlot::Stored { postfix } if *postfix != self.postfix => Some(postfix.clone()),
                ChunkSlot::Stored { .. } => None,
            };
            if let Some(from) = moved_from {
                self.storage
                    .copy(&key.file_key(&self.path, &from), &target)?;
                debug!(chunk = %target, from = %from, "relocated chunk");
                *slot = ChunkSlot::Stored {
                    postfix: self.postfix.clone(),
                };
            }
            keys.push(key);
        }
        keys.sort_unstable();

        let base: Vec<(u64, Tube)> = self
            .base
            .iter()
            .enumerate()
            .filter_map(|(i, cell)| {
                let cell = cell.lock();
                (!cell.is_empty()).then(|| (i as u64, cell.clone()))
            })
            .collect();
        self.storage.write(
            &self.base_key(),
            &self.encode_cells(FileKind::Base, self.structure.base_depth(), base),
        )?;

        let flat: Vec<(u64, Tube)> = self
            .flat
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .iter()
                    .map(|(index, tube)| (*index, tube.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        self.storage.write(
            &self.flat_key(),
            &self.encode_cells(FileKind::Flat, self.structure.flat_depth(), flat),
        )?;
        Ok(keys)
    }

    fn encode_cells(&self, kind: FileKind, depth: usize, mut cells: Vec<(u64, Tube)>) -> Vec<u8> {
        cells.sort_unstable_by_key(|(index, _)| *index);
        let count: u64 = cells.iter().map(|(_, tube)| tube.len() as u64).sum();
        let depth = u32::try_from(depth).unwrap_or(u32::MAX);
        let mut writer = Writer::new(kind, self.point_size, count, depth);
        for (index, tube) in &cells {
            for slot in tube.iter() {
                writer.push(*index, slot.tick, &slot.point, &slot.data);
            }
        }
        writer.finish()
    }

    /// Check that every stored chunk's file exists and has a well-formed header
    /// for its key, without decoding its records.
    pub fn verify_stored(&self) -> Result<()> {
        let slots: Vec<(ChunkKey, Arc<Mutex<ChunkSlot>>)> = self
            .chunks
            .read()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        for (key, slot) in slots {
            if let ChunkSlot::Stored { postfix } = &*slot.lock() {
                self.verify_chunk(&key, postfix)?;
            }
        }
        Ok(())
    }

    fn verify_chunk(&self, key: &ChunkKey, postfix: &str) -> Result<()> {
        let file = key.file_key(&self.path, postfix);
        let bytes = self.storage.read(&file)?;
        let decoded = Decoded::parse(&file, &bytes, FileKind::Chunk, self.point_size)?;
        if decoded.header.depth as usize != key.depth {
            return Err(Error::format(&file, "chunk depth does not match its key"));
        }
        Ok(())
    }

    fn replace(&self, id: &Id, info: &PointInfo<'_>) -> Result<u64> {
        let placement = self.add_point(info, Roller::at(self.bounds, id))?;
        Ok(u64::from(placement == Placement::Tossed))
    }

    /// Fold every point of `other` into this registry. Returns how many points
    /// could not be placed.
    ///
    /// Both registries must share storage and path. Resident points are placed
    /// again starting at their own cell; chunks only `other` holds are adopted
    /// as they are, and chunks both hold are decoded and their points placed.
    ///
    /// Every stored chunk of `other` is verified first, so a missing or corrupt
    /// file fails the merge before this registry changes.
    pub(crate) fn merge(&mut self, other: Self) -> Result<u64> {
        other.verify_stored()?;
        let mut tossed = 0;

        for (index, cell) in other.base.into_iter().enumerate() {
            let tube = cell.into_inner();
            if tube.is_empty() {
                continue;
            }
            let id = Id::from_dense_index(index as u64);
            for slot in tube.iter() {
                tossed += self.replace(&id, &slot.info())?;
            }
        }
        for shard in other.flat {
            for (index, tube) in shard.into_inner() {
                let id = Id::from_dense_index(index);
                for slot in tube.iter() {
                    tossed += self.replace(&id, &slot.info())?;
                }
            }
        }

        let mut theirs: Vec<(ChunkKey, ChunkSlot)> = other
            .chunks
            .into_inner()
            .into_iter()
            .map(|(key, slot)| {
                let slot = Arc::try_unwrap(slot)
                    .map_or_else(|shared| shared.lock().clone(), Mutex::into_inner);
                (key, slot)
            })
            .collect();
        theirs.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for (key, slot) in theirs {
            if !self.chunks.get_mut().contains_key(&key) {
                debug!(depth = key.depth, anchor = %key.anchor, "adopted chunk");
                self.chunks
                    .get_mut()
                    .insert(key, Arc::new(Mutex::new(slot)));
                continue;
            }
            match slot {
                ChunkSlot::Live(chunk) => {
                    for (id, info) in chunk.points() {
                        tossed += self.replace(&id, &info)?;
                    }
                }
                ChunkSlot::Stored { postfix } => {
                    let reader = self.load_reader(&key, &postfix)?;
                    for i in 0..reader.len() {
                        let (id, info) = reader.point(i)?;
                        tossed += self.replace(&id, &info)?;
                    }
                }
            }
        }
        self.null_depth = self.null_depth.max(other.null_depth);
        Ok(tossed)
    }
}
