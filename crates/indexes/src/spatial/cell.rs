//! Spherical cells: 64-bit hierarchical cell ids over a cube-face Hilbert
//! curve, in the style of S2.
//!
//! A position maps to one of six cube faces, the face coordinates pass
//! through the quadratic area-equalizing transform, and the resulting
//! (i, j) leaf coordinates are ordered along a Hilbert curve. The id packs
//! `face (3 bits) ++ curve position (2 bits per level) ++ trailing 1`;
//! ancestors of a cell own contiguous id ranges, so a covering cell turns
//! into one key range per cell.
//!
//! Coverings target `max_cells = 8` over levels `level-2 ..= level` and
//! keep coarsening beyond that floor only when the cap would otherwise be
//! broken. Coverage is complete but may over-cover; planners filter.

use std::collections::BTreeSet;

use taxis_core::IndexError;

pub const MAX_LEVEL: u8 = 30;

/// Cells per covering, matching the fixed coverer configuration.
pub const MAX_COVERING_CELLS: usize = 8;

/// Bit position of the 3-bit face field.
const FACE_SHIFT: u32 = 61;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

// Hilbert curve lookup tables. `IJ_TO_POS[orientation][2*i_bit + j_bit]`
// yields the child position along the curve; an orientation accumulates
// swap (1) and invert (2) bits as the walk descends.
const POS_TO_ORIENTATION: [u8; 4] = [1, 0, 0, 3];
const IJ_TO_POS: [[u64; 4]; 4] = [
    [0, 1, 3, 2],
    [0, 3, 1, 2],
    [2, 3, 1, 0],
    [2, 1, 3, 0],
];
const POS_TO_IJ: [[u64; 4]; 4] = [
    [0, 1, 3, 2],
    [0, 2, 3, 1],
    [3, 2, 0, 1],
    [3, 1, 0, 2],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(u64);

fn check_position(lat: f64, lon: f64) -> Result<(), IndexError> {
    if !(-90.0..=90.0).contains(&lat) || !lat.is_finite() {
        return Err(IndexError::invalid_argument(format!(
            "latitude {lat} is outside [-90, 90]"
        )));
    }
    if !(-180.0..=180.0).contains(&lon) || !lon.is_finite() {
        return Err(IndexError::invalid_argument(format!(
            "longitude {lon} is outside [-180, 180]"
        )));
    }
    Ok(())
}

fn check_level(level: u8) -> Result<(), IndexError> {
    if level > MAX_LEVEL {
        return Err(IndexError::invalid_argument(format!(
            "cell level {level} exceeds {MAX_LEVEL}"
        )));
    }
    Ok(())
}

/// (face, u, v) cube-face coordinates of a unit vector.
fn xyz_to_face_uv(x: f64, y: f64, z: f64) -> (u8, f64, f64) {
    let abs = [x.abs(), y.abs(), z.abs()];

    let axis = if abs[0] >= abs[1] && abs[0] >= abs[2] {
        0
    } else if abs[1] >= abs[2] {
        1
    } else {
        2
    };

    match axis {
        0 if x >= 0.0 => (0, y / x, z / x),
        0 => (3, z / x, y / x),
        1 if y >= 0.0 => (1, -x / y, z / y),
        1 => (4, z / y, -x / y),
        _ if z >= 0.0 => (2, -x / z, -y / z),
        _ => (5, -y / z, -x / z),
    }
}

/// The quadratic projection: evens out cell areas across a face.
fn uv_to_st(u: f64) -> f64 {
    if u >= 0.0 {
        0.5 * (1.0 + 3.0 * u).sqrt()
    } else {
        1.0 - 0.5 * (1.0 - 3.0 * u).sqrt()
    }
}

fn st_to_ij(s: f64) -> u64 {
    let cells = (1u64 << MAX_LEVEL) as f64;
    ((s * cells) as i64).clamp(0, (1i64 << MAX_LEVEL) - 1) as u64
}

fn lat_lon_to_face_ij(lat: f64, lon: f64) -> (u8, u64, u64) {
    let (lat, lon) = (lat.to_radians(), lon.to_radians());
    let x = lat.cos() * lon.cos();
    let y = lat.cos() * lon.sin();
    let z = lat.sin();

    let (face, u, v) = xyz_to_face_uv(x, y, z);
    (face, st_to_ij(uv_to_st(u)), st_to_ij(uv_to_st(v)))
}

fn face_ij_to_pos(face: u8, i: u64, j: u64) -> u64 {
    let mut orientation = (face & 1) as usize;
    let mut pos = 0u64;

    for bit in (0..MAX_LEVEL).rev() {
        let ij = (((i >> bit) & 1) << 1) | ((j >> bit) & 1);
        let child = IJ_TO_POS[orientation][ij as usize];
        pos = (pos << 2) | child;
        orientation ^= POS_TO_ORIENTATION[child as usize] as usize;
    }

    pos
}

fn pos_to_face_ij(face: u8, pos: u64) -> (u64, u64) {
    let mut orientation = (face & 1) as usize;
    let mut i = 0u64;
    let mut j = 0u64;

    for bit in (0..MAX_LEVEL).rev() {
        let child = (pos >> (2 * bit)) & 3;
        let ij = POS_TO_IJ[orientation][child as usize];
        i = (i << 1) | (ij >> 1);
        j = (j << 1) | (ij & 1);
        orientation ^= POS_TO_ORIENTATION[child as usize] as usize;
    }

    (i, j)
}

impl CellId {
    /// The cell containing a geographic position at `level`.
    pub fn from_lat_lon(lat: f64, lon: f64, level: u8) -> Result<Self, IndexError> {
        check_position(lat, lon)?;
        check_level(level)?;

        let (face, i, j) = lat_lon_to_face_ij(lat, lon);
        let pos = face_ij_to_pos(face, i, j);

        let leaf = ((face as u64) << FACE_SHIFT) | (pos << 1) | 1;
        Ok(Self(leaf).parent(level))
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    /// The lowest set bit encodes the level.
    fn lsb(&self) -> u64 {
        self.0 & self.0.wrapping_neg()
    }

    pub fn level(&self) -> u8 {
        MAX_LEVEL - (self.0.trailing_zeros() / 2) as u8
    }

    pub fn face(&self) -> u8 {
        (self.0 >> FACE_SHIFT) as u8
    }

    /// The ancestor at `level` (or the cell itself at its own level).
    pub fn parent(&self, level: u8) -> CellId {
        let lsb = 1u64 << (2 * (MAX_LEVEL - level) as u32);
        CellId((self.0 & lsb.wrapping_neg()) | lsb)
    }

    /// Inclusive id range of every descendant leaf.
    pub fn range(&self) -> (u64, u64) {
        let lsb = self.lsb();
        (self.0 - (lsb - 1), self.0 + (lsb - 1))
    }

    pub fn contains(&self, other: CellId) -> bool {
        let (min, max) = self.range();
        other.0 >= min && other.0 <= max
    }

    /// Same-face edge and corner neighbors at this cell's level.
    ///
    /// Neighbors across a cube edge are not produced; the sampling-based
    /// coverers compensate by over-sampling.
    pub fn face_neighbors(&self) -> Vec<CellId> {
        let level = self.level();
        let face = self.face();
        let pos = (self.0 & ((1u64 << FACE_SHIFT) - 1)) >> 1;
        let (i, j) = pos_to_face_ij(face, pos);

        let step = 1u64 << (MAX_LEVEL - level) as u32;
        let max = (1u64 << MAX_LEVEL) - 1;

        // snap to the cell's corner before stepping
        let i = i & !(step - 1);
        let j = j & !(step - 1);

        let mut out = Vec::with_capacity(8);
        for di in [-1i64, 0, 1] {
            for dj in [-1i64, 0, 1] {
                if di == 0 && dj == 0 {
                    continue;
                }

                let ni = i as i64 + di * step as i64;
                let nj = j as i64 + dj * step as i64;
                if ni < 0 || nj < 0 || ni as u64 > max || nj as u64 > max {
                    continue;
                }

                let pos = face_ij_to_pos(face, ni as u64, nj as u64);
                let leaf = ((face as u64) << FACE_SHIFT) | (pos << 1) | 1;
                out.push(CellId(leaf).parent(level));
            }
        }

        out
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}@{}", self.0, self.level())
    }
}

/// Cover a spherical cap with at most [`MAX_COVERING_CELLS`] cells.
///
/// The target levels are `level-2 ..= level`; the coverer samples the
/// cap's bounding rectangle at `level` and coarsens until the cap fits.
pub fn cover_cap(
    lat: f64,
    lon: f64,
    radius_m: f64,
    level: u8,
) -> Result<Vec<CellId>, IndexError> {
    check_position(lat, lon)?;
    check_level(level)?;

    if !(radius_m.is_finite() && radius_m >= 0.0) {
        return Err(IndexError::invalid_argument(format!(
            "radius {radius_m} must be a non-negative number of meters"
        )));
    }

    let dlat = (radius_m / EARTH_RADIUS_M).to_degrees();
    let cos_lat = lat.to_radians().cos().max(1e-6);
    let dlon = (dlat / cos_lat).min(180.0);

    cover_rect(
        (lat - dlat).max(-90.0),
        lon - dlon,
        (lat + dlat).min(90.0),
        lon + dlon,
        level,
    )
}

/// Cover a latitude/longitude rectangle with at most
/// [`MAX_COVERING_CELLS`] cells.
pub fn cover_rect(
    lat_lo: f64,
    lon_lo: f64,
    lat_hi: f64,
    lon_hi: f64,
    level: u8,
) -> Result<Vec<CellId>, IndexError> {
    check_level(level)?;

    if lat_hi < lat_lo || lon_hi < lon_lo {
        return Err(IndexError::invalid_argument(
            "rectangle corners are not ordered".to_string(),
        ));
    }

    // pick a sampling level whose grid stays small for this rectangle
    let mut sample_level = level;
    loop {
        let cell_deg = 90.0 / (1u64 << sample_level) as f64;
        let lat_samples = ((lat_hi - lat_lo) / cell_deg) as usize + 2;
        let lon_samples = ((lon_hi - lon_lo) / cell_deg) as usize + 2;

        if (lat_samples <= 32 && lon_samples <= 32) || sample_level == 0 {
            break;
        }
        sample_level -= 1;
    }

    let cell_deg = 90.0 / (1u64 << sample_level) as f64;
    let step = cell_deg / 2.0;

    let mut cells: BTreeSet<CellId> = BTreeSet::new();
    let mut la = lat_lo;
    loop {
        let mut lo = lon_lo;
        loop {
            let lon = wrap_lon(lo);
            let id = CellId::from_lat_lon(la.clamp(-90.0, 90.0), lon, sample_level)?;
            cells.insert(id);
            if lo >= lon_hi {
                break;
            }
            lo += step;
        }
        if la >= lat_hi {
            break;
        }
        la += step;
    }

    // a neighbor fringe compensates for samples that straddle cell walls
    let sampled: Vec<CellId> = cells.iter().copied().collect();
    for cell in sampled {
        for neighbor in cell.face_neighbors() {
            cells.insert(neighbor);
        }
    }

    // coarsen toward the floor level until the covering fits the cap
    let floor = level.saturating_sub(2);
    let mut current = sample_level;
    while cells.len() > MAX_COVERING_CELLS && current > 0 {
        if current <= floor {
            // past the documented floor; keep going only because the cap
            // is a hard limit
            tracing::debug!(level = current, cells = cells.len(), "covering past floor");
        }
        current -= 1;
        cells = cells.iter().map(|c| c.parent(current)).collect();
    }

    Ok(cells.into_iter().collect())
}

fn wrap_lon(lon: f64) -> f64 {
    if lon > 180.0 {
        lon - 360.0
    } else if lon < -180.0 {
        lon + 360.0
    } else {
        lon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_roundtrip_through_hilbert() {
        let (face, i, j) = lat_lon_to_face_ij(48.8584, 2.2945);
        let pos = face_ij_to_pos(face, i, j);
        let (ri, rj) = pos_to_face_ij(face, pos);
        assert_eq!((i, j), (ri, rj));
    }

    #[test]
    fn test_parent_contains_child() {
        let leaf = CellId::from_lat_lon(40.7, -74.0, MAX_LEVEL).unwrap();
        for level in [0u8, 5, 10, 20, 29] {
            let parent = leaf.parent(level);
            assert_eq!(parent.level(), level);
            assert!(parent.contains(leaf));
        }
    }

    #[test]
    fn test_nearby_points_share_coarse_cells() {
        let a = CellId::from_lat_lon(40.7000, -74.0000, 10).unwrap();
        let b = CellId::from_lat_lon(40.7001, -74.0001, 10).unwrap();
        assert_eq!(a.parent(8), b.parent(8));
    }

    #[test]
    fn test_distant_points_get_distinct_cells() {
        let a = CellId::from_lat_lon(40.7, -74.0, 10).unwrap();
        let b = CellId::from_lat_lon(-33.9, 151.2, 10).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.face(), b.face());
    }

    #[test]
    fn test_invalid_positions_rejected() {
        assert!(CellId::from_lat_lon(91.0, 0.0, 10).is_err());
        assert!(CellId::from_lat_lon(0.0, 200.0, 10).is_err());
        assert!(CellId::from_lat_lon(0.0, 0.0, 31).is_err());
    }

    #[test]
    fn test_cap_covering_is_bounded_and_contains_center() {
        let cells = cover_cap(52.52, 13.405, 500.0, 16).unwrap();
        assert!(!cells.is_empty());
        assert!(cells.len() <= MAX_COVERING_CELLS);

        let center = CellId::from_lat_lon(52.52, 13.405, MAX_LEVEL).unwrap();
        assert!(cells.iter().any(|c| c.contains(center)));
    }

    #[test]
    fn test_cap_covering_contains_offset_point() {
        // ~300 m northeast of center, inside a 500 m radius
        let cells = cover_cap(52.52, 13.405, 500.0, 16).unwrap();
        let off = CellId::from_lat_lon(52.5219, 13.4081, MAX_LEVEL).unwrap();
        assert!(cells.iter().any(|c| c.contains(off)));
    }

    #[test]
    fn test_rect_covering_ranges_are_disjoint() {
        let cells = cover_rect(40.0, -74.5, 41.0, -73.5, 12).unwrap();
        let mut ranges: Vec<_> = cells.iter().map(|c| c.range()).collect();
        ranges.sort_unstable();

        for window in ranges.windows(2) {
            assert!(window[0].1 < window[1].0);
        }
    }
}
