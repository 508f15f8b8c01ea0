// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The top-level index: insertion, queries and persistence.

use core::ops::AddAssign;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::bounds::Bounds;
use crate::error::{Error, Result};
use crate::metadata::{Metadata, RegistryMeta, postfix};
use crate::point::{Origin, PointId, PointInfo};
use crate::registry::{Layout, Placement, Registry};
use crate::roller::Roller;
use crate::schema::{PointBuffer, Schema};
use crate::storage::Storage;
use crate::structure::{Structure, Subset};

/// Counts from one insertion call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertStats {
    /// Points placed.
    pub inserted: u64,
    /// Points inside the bounds that found no free slot.
    pub tossed: u64,
    /// Points outside the bounds this index is responsible for.
    pub out_of_bounds: u64,
}

impl AddAssign for InsertStats {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.tossed += rhs.tossed;
        self.out_of_bounds += rhs.out_of_bounds;
    }
}

/// A point-cloud index living under one storage path.
///
/// Insertion and queries take `&self` and may run from any number of threads.
/// Saving, merging and re-partitioning need exclusive access.
#[derive(Debug)]
pub struct Index {
    storage: Arc<dyn Storage>,
    path: String,
    bounds: Bounds,
    schema: Arc<Schema>,
    subset: Option<Subset>,
    start: Roller,
    registry: Registry,
    num_points: AtomicU64,
    num_tossed: AtomicU64,
}

impl Index {
    /// An empty index.
    ///
    /// Nothing is written until [`Index::save`]. With a `subset`, only points
    /// inside the subset's cell are accepted.
    pub fn create(
        storage: Arc<dyn Storage>,
        path: impl Into<String>,
        bounds: Bounds,
        schema: Arc<Schema>,
        structure: Structure,
        subset: Option<Subset>,
    ) -> Result<Self> {
        let structure = structure.validate()?;
        if !schema.has_xy() {
            return Err(Error::Config("schema must have X and Y dimensions".into()));
        }
        if let Some(subset) = subset
            && subset.split_depth() > structure.disk_depth()
        {
            return Err(Error::Config(format!(
                "subset split depth {} is below disk depth {}",
                subset.split_depth(),
                structure.disk_depth()
            )));
        }
        let path = path.into();
        let layout = Layout {
            storage: storage.clone(),
            path: path.clone(),
            bounds,
            structure,
            point_size: schema.point_size(),
        };
        let null_depth = subset.map_or(0, |s| s.split_depth());
        let registry = Registry::new(layout, postfix(subset.map(|s| s.id())), null_depth);
        Ok(Self {
            storage,
            path,
            bounds,
            schema,
            subset,
            start: start_roller(bounds, subset),
            registry,
            num_points: AtomicU64::new(0),
            num_tossed: AtomicU64::new(0),
        })
    }

    /// Open a saved index, or one of its subsets.
    pub fn open(storage: Arc<dyn Storage>, path: impl Into<String>, subset_id: Option<usize>) -> Result<Self> {
        Self::open_with_schema(storage, path, subset_id, None)
    }

    /// Open a saved index, reusing `shared` as its schema when it matches the
    /// stored one.
    pub fn open_with_schema(
        storage: Arc<dyn Storage>,
        path: impl Into<String>,
        subset_id: Option<usize>,
        shared: Option<Arc<Schema>>,
    ) -> Result<Self> {
        let path = path.into();
        let meta = Metadata::read(storage.as_ref(), &path, subset_id)?;
        let schema = match shared {
            Some(schema) if *schema == meta.schema => schema,
            _ => Arc::new(meta.schema),
        };
        let layout = Layout {
            storage: storage.clone(),
            path: path.clone(),
            bounds: meta.bounds,
            structure: meta.structure,
            point_size: schema.point_size(),
        };
        let registry = Registry::load(
            layout,
            postfix(subset_id),
            meta.null_depth,
            &meta.registry.chunks,
        )?;
        debug!(path = %path, subset = ?subset_id, points = meta.num_points, "opened index");
        Ok(Self {
            storage,
            path,
            bounds: meta.bounds,
            schema,
            subset: meta.subset,
            start: start_roller(meta.bounds, meta.subset),
            registry,
            num_points: AtomicU64::new(meta.num_points),
            num_tossed: AtomicU64::new(meta.num_tossed),
        })
    }

    /// Whether an index (or subset) has been saved under `path`.
    pub fn exists(storage: &dyn Storage, path: &str, subset_id: Option<usize>) -> Result<bool> {
        storage.exists(&Metadata::key(path, subset_id))
    }

    /// Storage path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Storage backend.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Root bounds.
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Native attribute layout.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Depth layout.
    pub fn structure(&self) -> &Structure {
        self.registry.structure()
    }

    /// The partition this index holds, or `None` once whole.
    pub fn subset(&self) -> Option<Subset> {
        self.subset
    }

    /// The placement registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Points placed so far.
    pub fn num_points(&self) -> u64 {
        self.num_points.load(Ordering::Relaxed)
    }

    /// Points that found no free slot.
    pub fn num_tossed(&self) -> u64 {
        self.num_tossed.load(Ordering::Relaxed)
    }

    /// Insert every record of `buffer`, tagging them with `origin`.
    ///
    /// If the schema has an `Origin` dimension it is overwritten in the buffer.
    pub fn insert(&self, buffer: &mut PointBuffer, origin: Origin) -> Result<InsertStats> {
        if **buffer.schema() != *self.schema {
            return Err(Error::Incompatible(
                "buffer schema differs from the index schema".into(),
            ));
        }
        buffer.stamp_origin(origin);
        self.insert_records(buffer.as_bytes())
    }

    /// Insert raw records laid out in the index schema, back to back.
    ///
    /// Records outside the index's bounds (or its subset's cell) are skipped and
    /// counted, not treated as errors.
    pub fn insert_records(&self, records: &[u8]) -> Result<InsertStats> {
        let size = self.schema.point_size();
        if records.len() % size != 0 {
            return Err(Error::Incompatible(format!(
                "{} bytes is not a whole number of {size}-byte records",
                records.len()
            )));
        }
        let mut stats = InsertStats::default();
        for record in records.chunks_exact(size) {
            let point = self.schema.point(record);
            if !self.start.bounds().contains(&point) {
                stats.out_of_bounds += 1;
                continue;
            }
            let info = PointInfo::new(point, record, 0);
            match self.registry.add_point(&info, self.start.clone())? {
                Placement::Placed(_) => stats.inserted += 1,
                Placement::Tossed | Placement::Descend => stats.tossed += 1,
            }
        }
        self.num_points.fetch_add(stats.inserted, Ordering::Relaxed);
        self.num_tossed.fetch_add(stats.tossed, Ordering::Relaxed);
        Ok(stats)
    }

    /// Points whose cell depth is in `begin..end`.
    pub fn query(&self, begin: usize, end: usize) -> Result<Vec<PointId>> {
        self.registry.query(None, begin, end)
    }

    /// Points inside `bounds` whose cell depth is in `begin..end`.
    pub fn query_bounds(&self, bounds: &Bounds, begin: usize, end: usize) -> Result<Vec<PointId>> {
        self.registry.query(Some(bounds), begin, end)
    }

    /// Attributes of `id` re-projected into `schema`.
    ///
    /// Empty if nothing is stored at `id`.
    pub fn fetch_point_data(&self, id: &PointId, schema: &Schema) -> Result<Vec<u8>> {
        Ok(self
            .registry
            .point_data(id)?
            .map(|native| self.schema.translate(&native, schema))
            .unwrap_or_default())
    }

    /// Flush live chunks and drop them from memory.
    pub fn page_out(&self) -> Result<usize> {
        self.registry.page_out()
    }

    /// Persist the index: chunks first, then the resident regions, then metadata.
    pub fn save(&self) -> Result<()> {
        let chunks = self.registry.save()?;
        let meta = Metadata {
            bounds: self.bounds,
            schema: (*self.schema).clone(),
            structure: *self.registry.structure(),
            num_points: self.num_points(),
            num_tossed: self.num_tossed(),
            subset: self.subset,
            null_depth: self.registry.null_depth(),
            registry: RegistryMeta { chunks },
        };
        meta.write(self.storage.as_ref(), &self.path)?;
        debug!(path = %self.path, subset = ?self.subset, points = meta.num_points, "saved index");
        Ok(())
    }

    /// Fold another subset of the same logical index into this one.
    pub fn merge(&mut self, other: Self) -> Result<()> {
        let (Some(mine), Some(theirs)) = (self.subset, other.subset) else {
            return Err(Error::Incompatible("only subsets can be merged".into()));
        };
        if mine.of() != theirs.of() || mine.id() == theirs.id() {
            return Err(Error::Incompatible(format!(
                "subset {}/{} can not absorb subset {}/{}",
                mine.id(),
                mine.of(),
                theirs.id(),
                theirs.of()
            )));
        }
        if self.path != other.path
            || self.bounds != other.bounds
            || self.schema != other.schema
            || self.registry.structure() != other.registry.structure()
        {
            return Err(Error::Incompatible(format!(
                "subset {} of {} does not share path, bounds, schema and structure",
                theirs.id(),
                other.path
            )));
        }
        let points = other.num_points();
        let tossed = other.num_tossed();
        let lost = self.registry.merge(other.registry)?;
        self.num_points
            .fetch_add(points - lost, Ordering::Relaxed);
        self.num_tossed
            .fetch_add(tossed + lost, Ordering::Relaxed);
        Ok(())
    }

    /// Drop subset partitioning: the index now covers the whole bounds and saves
    /// under unsuffixed keys.
    pub fn make_whole(&mut self) {
        self.subset = None;
        self.start = Roller::new(self.bounds);
        self.registry.set_postfix(String::new());
    }
}

fn start_roller(bounds: Bounds, subset: Option<Subset>) -> Roller {
    subset.map_or_else(|| Roller::new(bounds), |s| s.roller(bounds))
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::bounds::Point;
    use crate::schema::{DimInfo, DimType, ORIGIN_DIM, Value};
    use crate::storage::MemoryStorage;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::xyz([
            DimInfo::new("Intensity", DimType::Uint16),
            DimInfo::new(ORIGIN_DIM, DimType::Uint32),
        ]))
    }

    fn square() -> Bounds {
        Bounds::new_2d(0.0, 0.0, 100.0, 100.0)
    }

    fn random_points(seed: u64, n: usize) -> PointBuffer {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut buf = PointBuffer::new(schema());
        for i in 0..n {
            buf.push(&[
                rng.random_range(0.0..100.0),
                rng.random_range(0.0..100.0),
                0.0,
                f64::from(u16::try_from(i % 1000).unwrap()),
                0.0,
            ]);
        }
        buf
    }

    fn index(storage: &MemoryStorage, subset: Option<Subset>) -> Index {
        Index::create(
            Arc::new(storage.clone()),
            "cloud",
            square(),
            schema(),
            Structure::new(2, 6, 12).unwrap(),
            subset,
        )
        .unwrap()
    }

    #[test]
    fn thousand_random_points() {
        let storage = MemoryStorage::new();
        let index = index(&storage, None);
        let stats = index.insert(&mut random_points(1, 1000), 1).unwrap();
        assert_eq!(stats.inserted + stats.tossed, 1000);
        assert_eq!(index.num_tossed(), 0);
        assert_eq!(index.num_points(), 1000);
        let shallow = index.query(0, 3).unwrap();
        assert!(shallow.len() <= 4_usize.pow(3));
        assert!(!shallow.is_empty());
        assert_eq!(index.query(0, 13).unwrap().len(), 1000);
    }

    #[test]
    fn boundary_points_are_rejected() {
        let storage = MemoryStorage::new();
        let index = index(&storage, None);
        let mut buf = PointBuffer::new(schema());
        buf.push(&[100.0, 50.0, 0.0, 0.0, 0.0]);
        buf.push(&[50.0, 100.0, 0.0, 0.0, 0.0]);
        buf.push(&[-1.0, 50.0, 0.0, 0.0, 0.0]);
        buf.push(&[99.5, 50.0, 0.0, 0.0, 0.0]);
        let stats = index.insert(&mut buf, 0).unwrap();
        assert_eq!(stats.out_of_bounds, 3);
        assert_eq!(stats.inserted, 1);
        assert_eq!(index.num_points() + index.num_tossed(), 1);
    }

    #[test]
    fn height_never_rejects_a_point() {
        let storage = MemoryStorage::new();
        let flat = index(&storage, None);
        let mut buf = PointBuffer::new(schema());
        buf.push(&[10.0, 10.0, 5.0, 0.0, 0.0]);
        buf.push(&[60.0, 70.0, -2.0, 0.0, 0.0]);
        let stats = flat.insert(&mut buf, 0).unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.out_of_bounds, 0);

        let tall = Index::create(
            Arc::new(storage),
            "tall",
            Bounds::new(Point::new(0.0, 0.0, 0.0), Point::new(100.0, 100.0, 50.0)),
            schema(),
            Structure::new(2, 6, 12).unwrap(),
            None,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        let mut buf = PointBuffer::new(schema());
        for _ in 0..500 {
            buf.push(&[
                rng.random_range(0.0..100.0),
                rng.random_range(0.0..100.0),
                rng.random_range(0.0..50.0),
                0.0,
                0.0,
            ]);
        }
        assert_eq!(tall.insert(&mut buf, 0).unwrap().inserted, 500);

        // A flat window selects every height.
        let window = Bounds::new_2d(20.0, 20.0, 80.0, 80.0);
        let everything = tall.query_bounds(&window, 0, 13).unwrap();
        assert!(!everything.is_empty());
        let full = Bounds::new(Point::new(20.0, 20.0, 0.0), Point::new(80.0, 80.0, 50.0));
        assert_eq!(tall.query_bounds(&full, 0, 13).unwrap(), everything);
        let low = Bounds::new(Point::new(20.0, 20.0, 0.0), Point::new(80.0, 80.0, 10.0));
        let low = tall.query_bounds(&low, 0, 13).unwrap();
        assert!(low.len() < everything.len());
        assert!(low.iter().all(|id| everything.contains(id)));
    }

    #[test]
    fn accounting_covers_every_contained_point() {
        let storage = MemoryStorage::new();
        let tight = Index::create(
            Arc::new(storage),
            "tight",
            square(),
            schema(),
            Structure::new(0, 1, 2).unwrap(),
            None,
        )
        .unwrap();
        let mut buf = random_points(5, 500);
        buf.push(&[150.0, 0.0, 0.0, 0.0, 0.0]);
        let stats = tight.insert(&mut buf, 3).unwrap();
        assert_eq!(stats.out_of_bounds, 1);
        assert!(stats.tossed > 0);
        assert_eq!(tight.num_points() + tight.num_tossed(), 500);
        // 1 + 4 + 16 cells, one point each on flat data.
        assert_eq!(tight.num_points(), 21);
    }

    #[test]
    fn placement_is_deterministic() {
        let a = index(&MemoryStorage::new(), None);
        let b = index(&MemoryStorage::new(), None);
        a.insert(&mut random_points(9, 700), 0).unwrap();
        b.insert(&mut random_points(9, 700), 0).unwrap();
        let all_a = a.query(0, 13).unwrap();
        assert_eq!(all_a, b.query(0, 13).unwrap());
        let plain = Schema::xyz([]);
        for id in all_a.iter().step_by(37) {
            assert_eq!(
                a.fetch_point_data(id, &plain).unwrap(),
                b.fetch_point_data(id, &plain).unwrap()
            );
        }
    }

    #[test]
    fn save_and_open_round_trip() {
        let storage = MemoryStorage::new();
        let index = index(&storage, None);
        index.insert(&mut random_points(2, 2000), 7).unwrap();
        index.page_out().unwrap();
        index.insert(&mut random_points(3, 500), 8).unwrap();
        index.save().unwrap();
        assert!(Index::exists(&storage, "cloud", None).unwrap());
        assert!(!Index::exists(&storage, "cloud", Some(0)).unwrap());

        let shared = index.schema().clone();
        let opened =
            Index::open_with_schema(Arc::new(storage.clone()), "cloud", None, Some(shared.clone()))
                .unwrap();
        assert!(Arc::ptr_eq(opened.schema(), &shared));
        assert_eq!(opened.bounds(), index.bounds());
        assert_eq!(opened.num_points(), index.num_points());
        assert_eq!(opened.num_tossed(), index.num_tossed());
        assert_eq!(opened.structure(), index.structure());
        let query = Bounds::new_2d(10.0, 20.0, 60.0, 45.0);
        assert_eq!(opened.query(0, 13).unwrap(), index.query(0, 13).unwrap());
        assert_eq!(
            opened.query_bounds(&query, 3, 9).unwrap(),
            index.query_bounds(&query, 3, 9).unwrap()
        );
        let schema = index.schema();
        for id in opened.query(5, 13).unwrap().iter().step_by(11) {
            assert_eq!(
                opened.fetch_point_data(id, schema).unwrap(),
                index.fetch_point_data(id, schema).unwrap()
            );
        }
    }

    #[test]
    fn open_failures() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            Index::open(Arc::new(storage.clone()), "nothing", None),
            Err(Error::NotFound(_))
        ));
        storage.write("broken/meta", b"[]").unwrap();
        assert!(matches!(
            Index::open(Arc::new(storage), "broken", None),
            Err(Error::Metadata { .. })
        ));
    }

    #[test]
    fn fetch_translates_and_stamps_origin() {
        let storage = MemoryStorage::new();
        let index = index(&storage, None);
        let mut buf = PointBuffer::new(schema());
        buf.push(&[12.5, 40.0, 0.0, 300.0, 0.0]);
        index.insert(&mut buf, 77).unwrap();
        let id = index.query(0, 1).unwrap().remove(0);

        let wanted = Schema::new(vec![
            DimInfo::new(ORIGIN_DIM, DimType::Uint64),
            DimInfo::new("X", DimType::Float32),
            DimInfo::new("Intensity", DimType::Int8),
            DimInfo::new("Red", DimType::Uint16),
        ]);
        let bytes = index.fetch_point_data(&id, &wanted).unwrap();
        let get = |name: &str| wanted.find(name).unwrap().read(&bytes);
        assert_eq!(get(ORIGIN_DIM), Value::Unsigned(77));
        assert_eq!(get("X"), Value::Float(12.5));
        assert_eq!(get("Intensity"), Value::Signed(127));
        assert_eq!(get("Red"), Value::Unsigned(0));

        let missing = PointId::new(id.id.child(0), 0);
        assert!(index.fetch_point_data(&missing, &wanted).unwrap().is_empty());
    }

    #[test]
    fn rejects_foreign_buffers() {
        let index = index(&MemoryStorage::new(), None);
        let mut buf = PointBuffer::new(Arc::new(Schema::xyz([])));
        buf.push(&[1.0, 1.0, 0.0]);
        assert!(matches!(index.insert(&mut buf, 0), Err(Error::Incompatible(_))));
        assert!(index.insert_records(&[0_u8; 7]).is_err());
        assert!(matches!(
            Index::create(
                Arc::new(MemoryStorage::new()),
                "x",
                square(),
                Arc::new(Schema::new(vec![DimInfo::new("X", DimType::Float64)])),
                Structure::default(),
                None,
            ),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn subsets_keep_to_their_cell() {
        let storage = MemoryStorage::new();
        let subset = Subset::new(1, 4).unwrap();
        let index = index(&storage, Some(subset));
        let stats = index.insert(&mut random_points(4, 400), 0).unwrap();
        assert!(stats.out_of_bounds > 0);
        assert_eq!(stats.inserted + stats.tossed + stats.out_of_bounds, 400);
        let cell = *subset.roller(square()).bounds();
        for id in index.query(0, 13).unwrap() {
            assert!(id.id.is_within(&subset.cell()));
            assert!(id.id.depth() >= 1);
        }
        assert!(cell.contains(&Point::new(75.0, 25.0, 0.0)));
        index.save().unwrap();
        assert!(storage.exists("cloud/meta-1").unwrap());
        assert!(storage.exists("cloud/base-1").unwrap());
        assert!(!storage.exists("cloud/meta").unwrap());
    }

    #[test]
    fn merge_requires_sibling_subsets() {
        let storage = MemoryStorage::new();
        let mut whole = index(&storage, None);
        let part = index(&storage, Some(Subset::new(0, 4).unwrap()));
        assert!(matches!(whole.merge(part), Err(Error::Incompatible(_))));
        let mut a = index(&storage, Some(Subset::new(0, 4).unwrap()));
        let b = index(&storage, Some(Subset::new(0, 4).unwrap()));
        assert!(matches!(a.merge(b), Err(Error::Incompatible(_))));
        let c = index(&storage, Some(Subset::new(2, 16).unwrap()));
        assert!(matches!(a.merge(c), Err(Error::Incompatible(_))));
    }

    #[test]
    fn merged_subsets_equal_the_union() {
        let storage = MemoryStorage::new();
        let mut parts: Vec<Index> = (0..4)
            .map(|i| {
                let part = index(&storage, Some(Subset::new(i, 4).unwrap()));
                part.insert(&mut random_points(11, 1500), 0).unwrap();
                part.save().unwrap();
                part
            })
            .collect();
        let query = Bounds::new_2d(30.0, 30.0, 70.0, 90.0);
        let mut union: Vec<PointId> = parts
            .iter()
            .flat_map(|p| p.query_bounds(&query, 0, 13).unwrap())
            .collect();
        union.sort_unstable();
        let total: u64 = parts.iter().map(Index::num_points).sum();

        let mut whole = parts.remove(0);
        for part in parts {
            whole.merge(part).unwrap();
        }
        whole.make_whole();
        assert_eq!(whole.subset(), None);
        assert_eq!(whole.num_points(), total);
        assert_eq!(whole.query_bounds(&query, 0, 13).unwrap(), union);
        whole.save().unwrap();

        let reopened = Index::open(Arc::new(storage), "cloud", None).unwrap();
        assert_eq!(reopened.num_points(), total);
        assert_eq!(reopened.query_bounds(&query, 0, 13).unwrap(), union);
        assert_eq!(reopened.query(0, 13).unwrap().len() as u64, total);
    }
}
