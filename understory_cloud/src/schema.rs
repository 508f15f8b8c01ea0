// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Attribute layouts and ingestion buffers.
//!
//! The index treats point attributes as opaque fixed-size records. It only needs
//! to know where the coordinates live, how large a record is, and how to
//! re-project a record into a different layout for [`Index::fetch_point_data`].
//!
//! [`Index::fetch_point_data`]: crate::Index::fetch_point_data

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bounds::Point;
use crate::point::Origin;

/// Name of the dimension stamped with the ingestion batch's [`Origin`].
pub const ORIGIN_DIM: &str = "Origin";

/// Storage type of one dimension.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimType {
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Unsigned 16-bit integer.
    Uint16,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Unsigned 64-bit integer.
    Uint64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
}

/// A dimension value widened to its family.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    /// Any signed integer.
    Signed(i64),
    /// Any unsigned integer.
    Unsigned(u64),
    /// Any float.
    Float(f64),
}

impl Value {
    /// The value as a float.
    #[allow(
        clippy::cast_precision_loss,
        reason = "Coordinates and attribute conversions accept float rounding."
    )]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Signed(v) => v as f64,
            Self::Unsigned(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        reason = "Float to integer casts saturate, which is the intended conversion."
    )]
    fn as_i64(self) -> i64 {
        match self {
            Self::Signed(v) => v,
            Self::Unsigned(v) => i64::try_from(v).unwrap_or(i64::MAX),
            Self::Float(v) => v.round() as i64,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "Float to integer casts saturate, which is the intended conversion."
    )]
    fn as_u64(self) -> u64 {
        match self {
            Self::Signed(v) => u64::try_from(v).unwrap_or(0),
            Self::Unsigned(v) => v,
            Self::Float(v) => v.round() as u64,
        }
    }
}

macro_rules! le {
    ($ty:ty, $bytes:expr) => {{
        let mut raw = [0_u8; size_of::<$ty>()];
        raw.copy_from_slice(&$bytes[..size_of::<$ty>()]);
        <$ty>::from_le_bytes(raw)
    }};
}

impl DimType {
    /// Size in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
        }
    }

    /// Decode a little-endian value from the front of `bytes`.
    pub fn read(self, bytes: &[u8]) -> Value {
        match self {
            Self::Int8 => Value::Signed(le!(i8, bytes).into()),
            Self::Int16 => Value::Signed(le!(i16, bytes).into()),
            Self::Int32 => Value::Signed(le!(i32, bytes).into()),
            Self::Int64 => Value::Signed(le!(i64, bytes)),
            Self::Uint8 => Value::Unsigned(le!(u8, bytes).into()),
            Self::Uint16 => Value::Unsigned(le!(u16, bytes).into()),
            Self::Uint32 => Value::Unsigned(le!(u32, bytes).into()),
            Self::Uint64 => Value::Unsigned(le!(u64, bytes)),
            Self::Float32 => Value::Float(le!(f32, bytes).into()),
            Self::Float64 => Value::Float(le!(f64, bytes)),
        }
    }

    /// Encode `value` little-endian into the front of `bytes`, converting as needed.
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Narrowing saturates through clamp before each cast."
    )]
    pub fn write(self, bytes: &mut [u8], value: Value) {
        let size = self.size();
        let out = &mut bytes[..size];
        match self {
            Self::Int8 => out.copy_from_slice(
                &(value.as_i64().clamp(i8::MIN.into(), i8::MAX.into()) as i8).to_le_bytes(),
            ),
            Self::Int16 => out.copy_from_slice(
                &(value.as_i64().clamp(i16::MIN.into(), i16::MAX.into()) as i16).to_le_bytes(),
            ),
            Self::Int32 => out.copy_from_slice(
                &(value.as_i64().clamp(i32::MIN.into(), i32::MAX.into()) as i32).to_le_bytes(),
            ),
            Self::Int64 => out.copy_from_slice(&value.as_i64().to_le_bytes()),
            Self::Uint8 => out.copy_from_slice(
                &(value.as_u64().min(u8::MAX.into()) as u8).to_le_bytes(),
            ),
            Self::Uint16 => out.copy_from_slice(
                &(value.as_u64().min(u16::MAX.into()) as u16).to_le_bytes(),
            ),
            Self::Uint32 => out.copy_from_slice(
                &(value.as_u64().min(u32::MAX.into()) as u32).to_le_bytes(),
            ),
            Self::Uint64 => out.copy_from_slice(&value.as_u64().to_le_bytes()),
            Self::Float32 => out.copy_from_slice(&(value.as_f64() as f32).to_le_bytes()),
            Self::Float64 => out.copy_from_slice(&value.as_f64().to_le_bytes()),
        }
    }
}

/// One named dimension.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimInfo {
    /// Dimension name, e.g. `"X"` or `"Intensity"`.
    pub name: String,
    /// Storage type.
    #[serde(rename = "type")]
    pub kind: DimType,
}

impl DimInfo {
    /// Create a new dimension.
    pub fn new(name: impl Into<String>, kind: DimType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Byte offset and type of a dimension inside a record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DimSlot {
    /// Offset from the start of the record.
    pub offset: usize,
    /// Storage type.
    pub kind: DimType,
}

impl DimSlot {
    /// Read this dimension from `record`.
    pub fn read(&self, record: &[u8]) -> Value {
        self.kind.read(&record[self.offset..])
    }

    /// Write this dimension into `record`.
    pub fn write(&self, record: &mut [u8], value: Value) {
        self.kind.write(&mut record[self.offset..], value);
    }
}

/// Ordered attribute layout of a fixed-size point record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<DimInfo>", into = "Vec<DimInfo>")]
pub struct Schema {
    dims: Vec<DimInfo>,
    slots: Vec<DimSlot>,
    point_size: usize,
    coords: [Option<DimSlot>; 3],
}

impl Schema {
    /// Create a layout from dimensions in record order.
    pub fn new(dims: Vec<DimInfo>) -> Self {
        let mut offset = 0;
        let slots: Vec<DimSlot> = dims
            .iter()
            .map(|d| {
                let slot = DimSlot {
                    offset,
                    kind: d.kind,
                };
                offset += d.kind.size();
                slot
            })
            .collect();
        let find = |name: &str| {
            dims.iter()
                .position(|d| d.name == name)
                .map(|i| slots[i])
        };
        let coords = [find("X"), find("Y"), find("Z")];
        Self {
            dims,
            slots,
            point_size: offset,
            coords,
        }
    }

    /// `X`, `Y`, `Z` as 64-bit floats followed by `extra`.
    pub fn xyz(extra: impl IntoIterator<Item = DimInfo>) -> Self {
        let mut dims = vec![
            DimInfo::new("X", DimType::Float64),
            DimInfo::new("Y", DimType::Float64),
            DimInfo::new("Z", DimType::Float64),
        ];
        dims.extend(extra);
        Self::new(dims)
    }

    /// Dimensions in record order.
    pub fn dims(&self) -> &[DimInfo] {
        &self.dims
    }

    /// Size of one record in bytes.
    pub fn point_size(&self) -> usize {
        self.point_size
    }

    /// Location of the dimension called `name`.
    pub fn find(&self, name: &str) -> Option<DimSlot> {
        self.dims
            .iter()
            .position(|d| d.name == name)
            .map(|i| self.slots[i])
    }

    /// Whether the layout carries both horizontal coordinates.
    pub fn has_xy(&self) -> bool {
        self.coords[0].is_some() && self.coords[1].is_some()
    }

    /// Position of the record. A missing `Z` reads as zero.
    pub fn point(&self, record: &[u8]) -> Point {
        let read = |slot: Option<DimSlot>| slot.map_or(0.0, |s| s.read(record).as_f64());
        Point::new(
            read(self.coords[0]),
            read(self.coords[1]),
            read(self.coords[2]),
        )
    }

    /// Re-project `record` into `requested`, field by field.
    ///
    /// Each requested dimension is converted from the native type; dimensions this
    /// layout does not carry are zero-filled.
    pub fn translate(&self, record: &[u8], requested: &Self) -> Vec<u8> {
        let mut out = vec![0_u8; requested.point_size];
        for (dim, slot) in requested.dims.iter().zip(&requested.slots) {
            if let Some(native) = self.find(&dim.name) {
                slot.write(&mut out, native.read(record));
            }
        }
        out
    }
}

impl From<Vec<DimInfo>> for Schema {
    fn from(dims: Vec<DimInfo>) -> Self {
        Self::new(dims)
    }
}

impl From<Schema> for Vec<DimInfo> {
    fn from(schema: Schema) -> Self {
        schema.dims
    }
}

/// Ingestion buffer: owns the raw records the index borrows while inserting.
#[derive(Clone, Debug)]
pub struct PointBuffer {
    schema: Arc<Schema>,
    data: Vec<u8>,
}

impl PointBuffer {
    /// An empty buffer in `schema`'s layout.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            data: Vec::new(),
        }
    }

    /// Layout of the records.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Append a record given one value per dimension, in schema order.
    pub fn push(&mut self, values: &[f64]) {
        debug_assert_eq!(
            values.len(),
            self.schema.dims.len(),
            "one value per dimension"
        );
        let start = self.data.len();
        self.data.resize(start + self.schema.point_size, 0);
        let record = &mut self.data[start..];
        for (slot, value) in self.schema.slots.iter().zip(values) {
            slot.write(record, Value::Float(*value));
        }
    }

    /// Append an already encoded record.
    pub fn push_raw(&mut self, record: &[u8]) {
        debug_assert_eq!(
            record.len(),
            self.schema.point_size,
            "record size must match the schema"
        );
        self.data.extend_from_slice(record);
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.data.len().checked_div(self.schema.point_size).unwrap_or(0)
    }

    /// Whether the buffer holds no records.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The `i`-th record.
    pub fn record(&self, i: usize) -> &[u8] {
        let size = self.schema.point_size;
        &self.data[i * size..(i + 1) * size]
    }

    /// All records back to back.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Write `origin` into every record's [`ORIGIN_DIM`], if the layout has one.
    pub fn stamp_origin(&mut self, origin: Origin) {
        let Some(slot) = self.schema.find(ORIGIN_DIM) else {
            return;
        };
        let size = self.schema.point_size;
        for record in self.data.chunks_exact_mut(size) {
            slot.write(record, Value::Unsigned(origin));
        }
    }
}
