// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Binary layout shared by base, flat and chunk files.
//!
//! ```text
//! header (24 bytes)
//!   magic "UCT1" | version u8 | kind u8 | reserved u16
//!   point_size u32 | count u64 | depth u32
//! count records of RECORD_PREFIX + point_size bytes
//!   cell u64 | tick u64 | x f64 | y f64 | z f64 | attribute bytes
//! ```
//!
//! All integers and floats are little-endian.

use crate::bounds::Point;
use crate::error::{Error, Result};

pub(crate) const MAGIC: &[u8; 4] = b"UCT1";
pub(crate) const VERSION: u8 = 1;
pub(crate) const HEADER_LEN: usize = 24;
/// Fixed bytes at the front of every record.
pub(crate) const RECORD_PREFIX: usize = 40;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FileKind {
    Base = 0,
    Flat = 1,
    Chunk = 2,
}

impl FileKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Base),
            1 => Some(Self::Flat),
            2 => Some(Self::Chunk),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) kind: FileKind,
    pub(crate) point_size: usize,
    pub(crate) count: u64,
    pub(crate) depth: u32,
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn le_f64(bytes: &[u8], at: usize) -> f64 {
    f64::from_bits(le_u64(bytes, at))
}

/// One decoded record, borrowing its attribute bytes from the file buffer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct Record<'a> {
    pub(crate) cell: u64,
    pub(crate) tick: u64,
    pub(crate) point: Point,
    pub(crate) data: &'a [u8],
}

/// Serializes records behind a header.
pub(crate) struct Writer {
    buf: Vec<u8>,
    point_size: usize,
    written: u64,
    count: u64,
}

impl Writer {
    pub(crate) fn new(kind: FileKind, point_size: usize, count: u64, depth: u32) -> Self {
        let record = RECORD_PREFIX + point_size;
        let capacity = usize::try_from(count)
            .ok()
            .and_then(|n| n.checked_mul(record))
            .unwrap_or(0);
        let mut buf = Vec::with_capacity(HEADER_LEN + capacity);
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        buf.push(kind as u8);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&u32::try_from(point_size).unwrap_or(u32::MAX).to_le_bytes());
        buf.extend_from_slice(&count.to_le_bytes());
        buf.extend_from_slice(&depth.to_le_bytes());
        Self {
            buf,
            point_size,
            written: 0,
            count,
        }
    }

    pub(crate) fn push(&mut self, cell: u64, tick: u64, point: &Point, data: &[u8]) {
        debug_assert_eq!(data.len(), self.point_size, "attribute size mismatch");
        self.buf.extend_from_slice(&cell.to_le_bytes());
        self.buf.extend_from_slice(&tick.to_le_bytes());
        self.buf.extend_from_slice(&point.x.to_le_bytes());
        self.buf.extend_from_slice(&point.y.to_le_bytes());
        self.buf.extend_from_slice(&point.z.to_le_bytes());
        self.buf.extend_from_slice(data);
        self.written += 1;
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        debug_assert_eq!(self.written, self.count, "record count mismatch");
        self.buf
    }
}

/// A validated file buffer.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Decoded<'a> {
    pub(crate) header: Header,
    body: &'a [u8],
}

impl<'a> Decoded<'a> {
    /// Validate `bytes` as a file of `kind` whose records carry `point_size`
    /// attribute bytes. `path` is only used for error reporting.
    pub(crate) fn parse(path: &str, bytes: &'a [u8], kind: FileKind, point_size: usize) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::format(path, "file shorter than header"));
        }
        if &bytes[0..4] != MAGIC {
            return Err(Error::format(path, "bad magic"));
        }
        if bytes[4] != VERSION {
            return Err(Error::format(
                path,
                format!("unsupported version {} (expected {VERSION})", bytes[4]),
            ));
        }
        let found = FileKind::from_u8(bytes[5])
            .ok_or_else(|| Error::format(path, format!("unknown file kind {}", bytes[5])))?;
        if found != kind {
            return Err(Error::format(
                path,
                format!("expected a {kind:?} file, found {found:?}"),
            ));
        }
        let stored_size = le_u32(bytes, 8) as usize;
        if stored_size != point_size {
            return Err(Error::format(
                path,
                format!("point size {stored_size} does not match schema size {point_size}"),
            ));
        }
        let count = le_u64(bytes, 12);
        let depth = le_u32(bytes, 20);
        let body = &bytes[HEADER_LEN..];
        let expected = usize::try_from(count)
            .ok()
            .and_then(|n| n.checked_mul(RECORD_PREFIX + point_size));
        if expected != Some(body.len()) {
            return Err(Error::format(
                path,
                format!("{} body bytes for {count} records", body.len()),
            ));
        }
        Ok(Self {
            header: Header {
                kind,
                point_size,
                count,
                depth,
            },
            body,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.body.len() / (RECORD_PREFIX + self.header.point_size)
    }

    /// Byte offset of record `i` within the whole file.
    pub(crate) fn offset(&self, i: usize) -> usize {
        HEADER_LEN + i * (RECORD_PREFIX + self.header.point_size)
    }

    pub(crate) fn record(&self, i: usize) -> Record<'a> {
        record_at(self.body, i * (RECORD_PREFIX + self.header.point_size), self.header.point_size)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = Record<'a>> + '_ {
        (0..self.len()).map(|i| self.record(i))
    }
}

/// Decode the record starting at `at` in `bytes`.
pub(crate) fn record_at(bytes: &[u8], at: usize, point_size: usize) -> Record<'_> {
    Record {
        cell: le_u64(bytes, at),
        tick: le_u64(bytes, at + 8),
        point: Point::new(
            le_f64(bytes, at + 16),
            le_f64(bytes, at + 24),
            le_f64(bytes, at + 32),
        ),
        data: &bytes[at + RECORD_PREFIX..at + RECORD_PREFIX + point_size],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut w = Writer::new(FileKind::Chunk, 2, 2, 9);
        w.push(3, 1, &Point::new(1.0, 2.0, 3.0), &[7, 8]);
        w.push(0, 4, &Point::new(-1.0, 0.5, 0.0), &[9, 10]);
        w.finish()
    }

    #[test]
    fn header_and_records() {
        let bytes = sample();
        assert_eq!(bytes.len(), HEADER_LEN + 2 * (RECORD_PREFIX + 2));
        let file = Decoded::parse("c", &bytes, FileKind::Chunk, 2).unwrap();
        assert_eq!(file.header.count, 2);
        assert_eq!(file.header.depth, 9);
        let records: Vec<_> = file.records().collect();
        assert_eq!(records[0].cell, 3);
        assert_eq!(records[0].point, Point::new(1.0, 2.0, 3.0));
        assert_eq!(records[1].tick, 4);
        assert_eq!(records[1].data, &[9, 10]);
        assert_eq!(record_at(&bytes, file.offset(1), 2), records[1]);
    }

    #[test]
    fn rejects_corrupt_files() {
        let bytes = sample();
        let err = |b: &[u8], kind, size| Decoded::parse("p", b, kind, size).unwrap_err();
        assert!(matches!(err(&bytes[..10], FileKind::Chunk, 2), Error::Format { .. }));
        assert!(matches!(err(&bytes, FileKind::Base, 2), Error::Format { .. }));
        assert!(matches!(err(&bytes, FileKind::Chunk, 3), Error::Format { .. }));
        assert!(matches!(
            err(&bytes[..bytes.len() - 1], FileKind::Chunk, 2),
            Error::Format { .. }
        ));
        let mut bad = bytes.clone();
        bad[0] = b'X';
        match err(&bad, FileKind::Chunk, 2) {
            Error::Format { path, reason } => {
                assert_eq!(path, "p");
                assert!(reason.contains("magic"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
