// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The JSON record written last on every save.

use serde::{Deserialize, Serialize};

use crate::bounds::Bounds;
use crate::chunk::ChunkKey;
use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::storage::Storage;
use crate::structure::{Structure, Subset};

/// Structural description of a registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMeta {
    /// Every persisted chunk.
    pub chunks: Vec<ChunkKey>,
}

/// Top-level description of a saved index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Root bounds.
    pub bounds: Bounds,
    /// Native attribute layout.
    pub schema: Schema,
    /// Depth layout.
    pub structure: Structure,
    /// Points placed.
    pub num_points: u64,
    /// Points that found no free slot.
    pub num_tossed: u64,
    /// Partition this index was built as, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<Subset>,
    /// Depths above this one are empty.
    #[serde(default)]
    pub null_depth: usize,
    /// Chunk listing.
    pub registry: RegistryMeta,
}

/// Storage key suffix for subset `id`, or none for a whole index.
pub fn postfix(subset_id: Option<usize>) -> String {
    subset_id.map(|id| format!("-{id}")).unwrap_or_default()
}

impl Metadata {
    /// Storage key of the metadata record of `path`.
    pub fn key(path: &str, subset_id: Option<usize>) -> String {
        format!("{path}/meta{}", postfix(subset_id))
    }

    /// Read and parse the record.
    ///
    /// A missing record is [`Error::NotFound`]; anything unparsable is
    /// [`Error::Metadata`].
    pub fn read(storage: &dyn Storage, path: &str, subset_id: Option<usize>) -> Result<Self> {
        let key = Self::key(path, subset_id);
        let bytes = storage.read(&key)?;
        let meta: Self = serde_json::from_slice(&bytes).map_err(|e| Error::Metadata {
            path: key.clone(),
            reason: e.to_string(),
        })?;
        let structure = meta.structure.validate().map_err(|e| Error::Metadata {
            path: key.clone(),
            reason: e.to_string(),
        })?;
        if let Some(subset) = meta.subset {
            Subset::new(subset.id(), subset.of()).map_err(|e| Error::Metadata {
                path: key.clone(),
                reason: e.to_string(),
            })?;
        }
        if meta.subset.map(|s| s.id()) != subset_id {
            return Err(Error::Metadata {
                path: key,
                reason: format!(
                    "record is for subset {:?}, expected {subset_id:?}",
                    meta.subset.map(|s| s.id())
                ),
            });
        }
        Ok(Self { structure, ..meta })
    }

    /// Serialize and store the record.
    pub fn write(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        let key = Self::key(path, self.subset.map(|s| s.id()));
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| Error::Metadata {
            path: key.clone(),
            reason: e.to_string(),
        })?;
        storage.write(&key, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Point;
    use crate::id::Id;
    use crate::storage::MemoryStorage;

    fn sample() -> Metadata {
        Metadata {
            bounds: Bounds::new(Point::new(0.0, 0.0, 0.0), Point::new(100.0, 100.0, 10.0)),
            schema: Schema::xyz([]),
            structure: Structure::new(2, 6, 12).unwrap(),
            num_points: 10,
            num_tossed: 1,
            subset: Some(Subset::new(3, 4).unwrap()),
            null_depth: 1,
            registry: RegistryMeta {
                chunks: vec![ChunkKey {
                    depth: 7,
                    anchor: Id::from(22),
                }],
            },
        }
    }

    #[test]
    fn json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["numPoints"], 10);
        assert_eq!(json["numTossed"], 1);
        assert_eq!(json["nullDepth"], 1);
        assert_eq!(json["subset"]["of"], 4);
        assert_eq!(json["structure"]["diskDepth"], 12);
        assert_eq!(json["registry"]["chunks"][0]["id"], "22");
        assert_eq!(json["schema"][2]["name"], "Z");
    }

    #[test]
    fn stored_under_subset_key() {
        let storage = MemoryStorage::new();
        let meta = sample();
        meta.write(&storage, "idx").unwrap();
        assert!(storage.exists("idx/meta-3").unwrap());
        assert_eq!(Metadata::read(&storage, "idx", Some(3)).unwrap(), meta);
        assert!(matches!(
            Metadata::read(&storage, "idx", None),
            Err(Error::NotFound(_))
        ));
        // A record for another subset is rejected.
        storage.copy("idx/meta-3", "idx/meta-2").unwrap();
        assert!(matches!(
            Metadata::read(&storage, "idx", Some(2)),
            Err(Error::Metadata { .. })
        ));
    }

    #[test]
    fn malformed_records_name_their_path() {
        let storage = MemoryStorage::new();
        storage.write("idx/meta", b"{not json").unwrap();
        match Metadata::read(&storage, "idx", None) {
            Err(Error::Metadata { path, .. }) => assert_eq!(path, "idx/meta"),
            other => panic!("unexpected {other:?}"),
        }
        let mut bad = serde_json::to_value(sample()).unwrap();
        bad["structure"]["dimensions"] = 3.into();
        bad.as_object_mut().unwrap().remove("subset");
        storage.write("idx/meta", &serde_json::to_vec(&bad).unwrap()).unwrap();
        assert!(matches!(
            Metadata::read(&storage, "idx", None),
            Err(Error::Metadata { .. })
        ));
    }
}
