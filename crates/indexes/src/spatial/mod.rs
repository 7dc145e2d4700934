//! Spatial index: positions encoded to 64-bit codes, one `[code, pk]` key
//! per record.
//!
//! The code variant is selected by [`SpatialKind`]: geographic positions
//! go through the spherical cell codec, cartesian ones through Morton
//! interleaving. Codes are stored as 8-byte big-endian byte strings so key
//! order equals numeric code order, and queries come back as a list of
//! `(begin, end)` key ranges for the planner to union and filter.

pub mod cell;
pub mod geohash;
pub mod morton;

use taxis_core::record::evaluate_entries;
use taxis_core::{
    ByteRange, Index, IndexError, IndexMaintainer, Record, RecordAccess, SpatialKind,
    Subspace, Transaction, Tuple, TupleElement,
};

use self::cell::CellId;

/// Default encoding levels per kind.
fn default_level(kind: SpatialKind) -> u8 {
    match kind {
        SpatialKind::Geo => 16,
        SpatialKind::Geo3d => morton::DEFAULT_LEVEL_3D,
        SpatialKind::Cartesian2d => morton::DEFAULT_LEVEL_2D,
        SpatialKind::Cartesian3d => morton::DEFAULT_LEVEL_3D,
    }
}

fn coordinate(entry: &Tuple, position: usize, index: &Index) -> Result<f64, IndexError> {
    match entry.get(position) {
        Some(TupleElement::Double(value)) => Ok(*value),
        Some(TupleElement::Float(value)) => Ok(*value as f64),
        Some(TupleElement::Int(value)) => Ok(*value as f64),
        other => Err(IndexError::invalid_argument(format!(
            "index {}: coordinate {position} is {other:?}, expected a number",
            index.name
        ))),
    }
}

pub struct SpatialMaintainer {
    index: Index,
    subspace: Subspace,
    kind: SpatialKind,
    level: u8,
}

impl SpatialMaintainer {
    pub fn new(index: Index, subspace: Subspace) -> Self {
        let kind = index.options.spatial_kind.unwrap_or_default();
        let level = index
            .options
            .spatial_level
            .unwrap_or_else(|| default_level(kind));

        Self {
            index,
            subspace,
            kind,
            level,
        }
    }

    pub fn kind(&self) -> SpatialKind {
        self.kind
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    fn dimensions(&self) -> usize {
        match self.kind {
            SpatialKind::Geo | SpatialKind::Cartesian2d => 2,
            SpatialKind::Geo3d | SpatialKind::Cartesian3d => 3,
        }
    }

    /// Encode one evaluated entry into a spatial code.
    fn encode_entry(&self, entry: &Tuple) -> Result<u64, IndexError> {
        if entry.len() < self.dimensions() {
            return Err(IndexError::invalid_argument(format!(
                "index {}: entry {entry} has fewer than {} coordinates",
                self.index.name,
                self.dimensions()
            )));
        }

        let a = coordinate(entry, 0, &self.index)?;
        let b = coordinate(entry, 1, &self.index)?;

        match self.kind {
            SpatialKind::Geo => Ok(CellId::from_lat_lon(a, b, self.level)?.id()),
            SpatialKind::Cartesian2d => morton::encode_2d(a, b, self.level),
            SpatialKind::Cartesian3d => {
                let c = coordinate(entry, 2, &self.index)?;
                morton::encode_3d(a, b, c, self.level)
            }
            SpatialKind::Geo3d => {
                let c = coordinate(entry, 2, &self.index)?;
                morton::encode_3d((a + 90.0) / 180.0, (b + 180.0) / 360.0, c, self.level)
            }
        }
    }

    fn code_element(code: u64) -> TupleElement {
        TupleElement::Bytes(code.to_be_bytes().to_vec())
    }

    fn entry_key(&self, code: u64, pk: &Tuple) -> Vec<u8> {
        self.subspace
            .pack(&Tuple::single(Self::code_element(code)).concat(pk))
    }

    fn keys_for<R: Record>(
        &self,
        access: &dyn RecordAccess<R>,
        record: &R,
    ) -> Result<Vec<Vec<u8>>, IndexError> {
        let pk = record.primary_key();
        let entries = evaluate_entries(access, record, &self.index.root_expression)?;

        entries
            .iter()
            .map(|entry| Ok(self.entry_key(self.encode_entry(entry)?, &pk)))
            .collect()
    }

    /// Byte range of index keys whose codes fall in `[min, max]`.
    fn code_range(&self, min: u64, max: u64) -> ByteRange {
        let begin = self.subspace.pack(&Tuple::single(Self::code_element(min)));

        let end = match max.checked_add(1) {
            Some(next) => self.subspace.pack(&Tuple::single(Self::code_element(next))),
            None => self.subspace.range().1,
        };

        (begin, end)
    }

    /// Key ranges covering a radius query around a geographic point.
    ///
    /// The covering is fixed at the codec's `max_cells = 8`; it may
    /// over-cover, so planners must distance-filter the hits.
    pub fn radius_ranges(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
    ) -> Result<Vec<ByteRange>, IndexError> {
        if self.kind != SpatialKind::Geo {
            return Err(IndexError::invalid_argument(format!(
                "index {} does not store spherical cells",
                self.index.name
            )));
        }

        let cells = cell::cover_cap(lat, lon, radius_m, self.level)?;

        Ok(cells
            .iter()
            .map(|cell| {
                let (min, max) = cell.range();
                self.code_range(min, max)
            })
            .collect())
    }

    /// Key ranges covering a geographic bounding box.
    pub fn bbox_ranges(
        &self,
        lat_lo: f64,
        lon_lo: f64,
        lat_hi: f64,
        lon_hi: f64,
    ) -> Result<Vec<ByteRange>, IndexError> {
        if self.kind != SpatialKind::Geo {
            return Err(IndexError::invalid_argument(format!(
                "index {} does not store spherical cells",
                self.index.name
            )));
        }

        let cells = cell::cover_rect(lat_lo, lon_lo, lat_hi, lon_hi, self.level)?;

        Ok(cells
            .iter()
            .map(|cell| {
                let (min, max) = cell.range();
                self.code_range(min, max)
            })
            .collect())
    }

    /// Key ranges covering an axis-aligned cartesian box (2-D kinds only).
    pub fn box_ranges(
        &self,
        x0: f64,
        y0: f64,
        x1: f64,
        y1: f64,
    ) -> Result<Vec<ByteRange>, IndexError> {
        if self.kind != SpatialKind::Cartesian2d {
            return Err(IndexError::invalid_argument(format!(
                "index {} does not store 2-D morton codes",
                self.index.name
            )));
        }

        let ranges = morton::cover_box_2d(x0, y0, x1, y1, self.level, 32)?;

        Ok(ranges
            .into_iter()
            .map(|(min, max)| self.code_range(min, max))
            .collect())
    }

    /// Decode an index key back into `(code, pk)`.
    pub fn decode_key(&self, key: &[u8]) -> Result<(u64, Tuple), IndexError> {
        let tuple = self.subspace.unpack(key)?;

        match tuple.get(0) {
            Some(TupleElement::Bytes(raw)) if raw.len() == 8 => {
                let code = u64::from_be_bytes(raw.as_slice().try_into().map_err(|_| {
                    IndexError::internal("spatial code width changed".to_string())
                })?);
                Ok((code, tuple.suffix(1)))
            }
            other => Err(IndexError::internal(format!(
                "index {} holds malformed code element {other:?}",
                self.index.name
            ))),
        }
    }
}

impl<R: Record, T: Transaction> IndexMaintainer<R, T> for SpatialMaintainer {
    fn index(&self) -> &Index {
        &self.index
    }

    fn update_index(
        &self,
        old: Option<&R>,
        new: Option<&R>,
        access: &dyn RecordAccess<R>,
        txn: &mut T,
    ) -> Result<(), IndexError> {
        let old_keys = match old {
            Some(record) => self.keys_for(access, record)?,
            None => Vec::new(),
        };
        let new_keys = match new {
            Some(record) => self.keys_for(access, record)?,
            None => Vec::new(),
        };

        for key in &old_keys {
            if !new_keys.contains(key) {
                txn.clear(key);
            }
        }
        for key in &new_keys {
            if !old_keys.contains(key) {
                txn.set(key, &[]);
            }
        }

        Ok(())
    }
}
