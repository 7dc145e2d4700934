//! Geohash: base-32 interleaved latitude/longitude prefixes.
//!
//! Precision runs 1..=12 characters; each character adds five interleaved
//! bits, longitude first. Precision 6 is about ±0.6 m of error, 7 about
//! ±76 mm, 8 about ±19 mm and 12 about ±19 µm. Bounding-box coverings are
//! produced by grid sampling plus neighbors: coverage is complete but may
//! include cells outside the box, which query planners are expected to
//! filter.

use std::collections::BTreeSet;

use taxis_core::IndexError;

const ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

pub const MAX_PRECISION: usize = 12;

fn decode_char(c: u8) -> Option<u32> {
    ALPHABET.iter().position(|a| *a == c).map(|p| p as u32)
}

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

fn check_precision(precision: usize) -> Result<(), IndexError> {
    if precision == 0 || precision > MAX_PRECISION {
        return Err(IndexError::invalid_argument(format!(
            "geohash precision {precision} is outside 1..={MAX_PRECISION}"
        )));
    }
    Ok(())
}

pub fn encode(lat: f64, lon: f64, precision: usize) -> Result<String, IndexError> {
    check_position(lat, lon)?;
    check_precision(precision)?;

    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lon_range = (-180.0f64, 180.0f64);

    let mut hash = String::with_capacity(precision);
    let mut bits = 0u32;
    let mut bit_count = 0;
    let mut even_bit = true;

    while hash.len() < precision {
        if even_bit {
            let mid = (lon_range.0 + lon_range.1) / 2.0;
            if lon >= mid {
                bits = (bits << 1) | 1;
                lon_range.0 = mid;
            } else {
                bits <<= 1;
                lon_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if lat >= mid {
                bits = (bits << 1) | 1;
                lat_range.0 = mid;
            } else {
                bits <<= 1;
                lat_range.1 = mid;
            }
        }

        even_bit = !even_bit;
        bit_count += 1;

        if bit_count == 5 {
            hash.push(ALPHABET[bits as usize] as char);
            bits = 0;
            bit_count = 0;
        }
    }

    Ok(hash)
}

/// The bounding box of a geohash cell: `(lat, lon, lat_err, lon_err)`
/// where the returned position is the cell center.
pub fn decode(hash: &str) -> Result<(f64, f64, f64, f64), IndexError> {
    if hash.is_empty() || hash.len() > MAX_PRECISION {
        return Err(IndexError::invalid_argument(format!(
            "geohash {hash:?} has unsupported length"
        )));
    }

    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lon_range = (-180.0f64, 180.0f64);
    let mut even_bit = true;

    for c in hash.bytes() {
        let value = decode_char(c).ok_or_else(|| {
            IndexError::invalid_argument(format!("invalid geohash character {:?}", c as char))
        })?;

        for shift in (0..5).rev() {
            let bit = (value >> shift) & 1;
            if even_bit {
                let mid = (lon_range.0 + lon_range.1) / 2.0;
                if bit == 1 {
                    lon_range.0 = mid;
                } else {
                    lon_range.1 = mid;
                }
            } else {
                let mid = (lat_range.0 + lat_range.1) / 2.0;
                if bit == 1 {
                    lat_range.0 = mid;
                } else {
                    lat_range.1 = mid;
                }
            }
            even_bit = !even_bit;
        }
    }

    let lat = (lat_range.0 + lat_range.1) / 2.0;
    let lon = (lon_range.0 + lon_range.1) / 2.0;
    let lat_err = (lat_range.1 - lat_range.0) / 2.0;
    let lon_err = (lon_range.1 - lon_range.0) / 2.0;

    Ok((lat, lon, lat_err, lon_err))
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

/// The up-to-eight neighboring cells of a geohash, skipping positions past
/// the poles.
pub fn neighbors(hash: &str) -> Result<Vec<String>, IndexError> {
    let (lat, lon, lat_err, lon_err) = decode(hash)?;
    let precision = hash.len();

    let mut out = Vec::with_capacity(8);
    for dlat in [-1.0f64, 0.0, 1.0] {
        for dlon in [-1.0f64, 0.0, 1.0] {
            if dlat == 0.0 && dlon == 0.0 {
                continue;
            }

            let nlat = lat + dlat * 2.0 * lat_err;
            let nlon = wrap_lon(lon + dlon * 2.0 * lon_err);
            if !(-90.0..=90.0).contains(&nlat) {
                continue;
            }

            let neighbor = encode(nlat, nlon, precision)?;
            if neighbor != hash {
                out.push(neighbor);
            }
        }
    }

    out.sort();
    out.dedup();
    Ok(out)
}

/// Covering of a latitude/longitude box with cells of one precision.
///
/// Grid sampling at half-cell steps plus a ring of neighbors: every cell
/// intersecting the box appears, plus possibly a fringe outside it. The
/// effective precision drops for boxes that would need more than
/// `max_cells` samples per axis.
pub fn cover_bbox(
    min_lat: f64,
    min_lon: f64,
    max_lat: f64,
    max_lon: f64,
    precision: usize,
    max_cells: usize,
) -> Result<Vec<String>, IndexError> {
    check_position(min_lat, min_lon)?;
    check_position(max_lat, max_lon)?;
    check_precision(precision)?;

    if max_lat < min_lat || max_lon < min_lon {
        return Err(IndexError::invalid_argument(
            "bounding box corners are not ordered".to_string(),
        ));
    }

    let mut precision = precision;
    let (mut lat_err, mut lon_err) = cell_errors(precision);

    // drop precision until the sample grid stays reasonable
    while precision > 1
        && (((max_lat - min_lat) / lat_err) as usize > max_cells
            || ((max_lon - min_lon) / lon_err) as usize > max_cells)
    {
        precision -= 1;
        let errors = cell_errors(precision);
        lat_err = errors.0;
        lon_err = errors.1;
    }

    let mut cells = BTreeSet::new();

    let mut lat = min_lat;
    loop {
        let mut lon = min_lon;
        loop {
            cells.insert(encode(lat.min(90.0), wrap_lon(lon), precision)?);
            if lon >= max_lon {
                break;
            }
            lon += lon_err;
        }
        if lat >= max_lat {
            break;
        }
        lat += lat_err;
    }

    // a ring of neighbors catches cells whose interior the grid missed
    let sampled: Vec<String> = cells.iter().cloned().collect();
    for hash in sampled {
        for neighbor in neighbors(&hash)? {
            cells.insert(neighbor);
        }
    }

    Ok(cells.into_iter().collect())
}

fn cell_errors(precision: usize) -> (f64, f64) {
    let bits = precision * 5;
    let lon_bits = bits.div_ceil(2);
    let lat_bits = bits / 2;
    (
        180.0 / (1u64 << lat_bits) as f64,
        360.0 / (1u64 << lon_bits) as f64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_geohash() {
        // the canonical example point
        let hash = encode(57.64911, 10.40744, 11).unwrap();
        assert_eq!(hash, "u4pruydqqvj");
    }

    #[test]
    fn test_roundtrip_within_error() {
        for precision in [1, 4, 6, 8, 12] {
            let hash = encode(48.8584, 2.2945, precision).unwrap();
            let (lat, lon, lat_err, lon_err) = decode(&hash).unwrap();
            assert!((lat - 48.8584).abs() <= lat_err);
            assert!((lon - 2.2945).abs() <= lon_err);
        }
    }

    #[test]
    fn test_prefix_nesting() {
        let fine = encode(40.0, -73.9, 9).unwrap();
        let coarse = encode(40.0, -73.9, 4).unwrap();
        assert!(fine.starts_with(&coarse));
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(encode(91.0, 0.0, 6).is_err());
        assert!(encode(0.0, 181.0, 6).is_err());
        assert!(encode(0.0, 0.0, 0).is_err());
        assert!(encode(0.0, 0.0, 13).is_err());
        assert!(decode("ab!").is_err());
    }

    #[test]
    fn test_neighbors_share_precision() {
        let hashes = neighbors("u4pruy").unwrap();
        assert!(!hashes.is_empty());
        assert!(hashes.len() <= 8);
        assert!(hashes.iter().all(|h| h.len() == 6));
        assert!(hashes.iter().all(|h| h != "u4pruy"));
    }

    #[test]
    fn test_cover_bbox_includes_interior_points() {
        let cells = cover_bbox(40.0, -74.1, 40.9, -73.0, 5, 64).unwrap();
        assert!(!cells.is_empty());

        let inside = encode(40.5, -73.5, cells[0].len()).unwrap();
        assert!(cells.contains(&inside));
    }
}
