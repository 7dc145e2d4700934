//! Morton (Z-order) codes for 2-D and 3-D cartesian coordinates.
//!
//! Coordinates are normalized to `[0, 1]` before encoding; `level` is the
//! number of bits per axis (0..=30 in 2-D, 0..=20 in 3-D). The interleaved
//! code is left-shifted into the high bits of the u64 so that codes of
//! different levels sort into coarser prefixes.

use itertools::Itertools;
use taxis_core::IndexError;

pub const MAX_LEVEL_2D: u8 = 30;
pub const MAX_LEVEL_3D: u8 = 20;

/// Default encoding levels for spatial indexes.
pub const DEFAULT_LEVEL_2D: u8 = 18;
pub const DEFAULT_LEVEL_3D: u8 = 16;

/// Spread the low 32 bits of `xx` so a bit of the other axis fits between
/// every pair.
fn spread2(mut xx: u64) -> u64 {
    xx = (xx | xx << 16) & 0x0000FFFF0000FFFF;
    xx = (xx | xx << 8) & 0x00FF00FF00FF00FF;
    xx = (xx | xx << 4) & 0x0F0F0F0F0F0F0F0F;
    xx = (xx | xx << 2) & 0x3333333333333333;
    xx = (xx | xx << 1) & 0x5555555555555555;
    xx
}

fn compact2(mut xx: u64) -> u64 {
    xx &= 0x5555555555555555;
    xx = (xx | xx >> 1) & 0x3333333333333333;
    xx = (xx | xx >> 2) & 0x0F0F0F0F0F0F0F0F;
    xx = (xx | xx >> 4) & 0x00FF00FF00FF00FF;
    xx = (xx | xx >> 8) & 0x0000FFFF0000FFFF;
    xx = (xx | xx >> 16) & 0x00000000FFFFFFFF;
    xx
}

/// Spread the low 21 bits of `xx` with two-bit gaps.
fn spread3(mut xx: u64) -> u64 {
    xx = (xx | xx << 32) & 0x001F00000000FFFF;
    xx = (xx | xx << 16) & 0x001F0000FF0000FF;
    xx = (xx | xx << 8) & 0x100F00F00F00F00F;
    xx = (xx | xx << 4) & 0x10C30C30C30C30C3;
    xx = (xx | xx << 2) & 0x1249249249249249;
    xx
}

fn compact3(mut xx: u64) -> u64 {
    xx &= 0x1249249249249249;
    xx = (xx | xx >> 2) & 0x10C30C30C30C30C3;
    xx = (xx | xx >> 4) & 0x100F00F00F00F00F;
    xx = (xx | xx >> 8) & 0x001F0000FF0000FF;
    xx = (xx | xx >> 16) & 0x001F00000000FFFF;
    xx = (xx | xx >> 32) & 0x00000000001FFFFF;
    xx
}

fn check_unit(name: &str, value: f64) -> Result<(), IndexError> {
    if !(0.0..=1.0).contains(&value) || !value.is_finite() {
        return Err(IndexError::invalid_argument(format!(
            "{name} = {value} is outside the normalized range [0, 1]"
        )));
    }
    Ok(())
}

fn quantize(value: f64, level: u8) -> u64 {
    let cells = 1u64 << level;
    ((value * cells as f64) as u64).min(cells - 1)
}

fn dequantize(cell: u64, level: u8) -> f64 {
    let cells = 1u64 << level;
    (cell as f64 + 0.5) / cells as f64
}

pub fn encode_2d(x: f64, y: f64, level: u8) -> Result<u64, IndexError> {
    if level > MAX_LEVEL_2D {
        return Err(IndexError::invalid_argument(format!(
            "2-D morton level {level} exceeds {MAX_LEVEL_2D}"
        )));
    }
    check_unit("x", x)?;
    check_unit("y", y)?;

    if level == 0 {
        return Ok(0);
    }

    let xx = spread2(quantize(x, level));
    let yy = spread2(quantize(y, level));
    let code = xx | (yy << 1);

    Ok(code << (64 - 2 * level as u32))
}

/// Decode to the center of the level-`level` cell.
pub fn decode_2d(code: u64, level: u8) -> Result<(f64, f64), IndexError> {
    if level > MAX_LEVEL_2D {
        return Err(IndexError::invalid_argument(format!(
            "2-D morton level {level} exceeds {MAX_LEVEL_2D}"
        )));
    }

    if level == 0 {
        return Ok((0.5, 0.5));
    }

    let code = code >> (64 - 2 * level as u32);
    let x = compact2(code);
    let y = compact2(code >> 1);

    Ok((dequantize(x, level), dequantize(y, level)))
}

pub fn encode_3d(x: f64, y: f64, z: f64, level: u8) -> Result<u64, IndexError> {
    if level > MAX_LEVEL_3D {
        return Err(IndexError::invalid_argument(format!(
            "3-D morton level {level} exceeds {MAX_LEVEL_3D}"
        )));
    }
    check_unit("x", x)?;
    check_unit("y", y)?;
    check_unit("z", z)?;

    if level == 0 {
        return Ok(0);
    }

    let xx = spread3(quantize(x, level));
    let yy = spread3(quantize(y, level));
    let zz = spread3(quantize(z, level));
    let code = xx | (yy << 1) | (zz << 2);

    Ok(code << (64 - 3 * level as u32))
}

pub fn decode_3d(code: u64, level: u8) -> Result<(f64, f64, f64), IndexError> {
    if level > MAX_LEVEL_3D {
        return Err(IndexError::invalid_argument(format!(
            "3-D morton level {level} exceeds {MAX_LEVEL_3D}"
        )));
    }

    if level == 0 {
        return Ok((0.5, 0.5, 0.5));
    }

    let code = code >> (64 - 3 * level as u32);
    let x = compact3(code);
    let y = compact3(code >> 1);
    let z = compact3(code >> 2);

    Ok((dequantize(x, level), dequantize(y, level), dequantize(z, level)))
}

/// Inclusive code range of the level-`level` cell at quantized coordinates
/// `(i, j)`, expressed in full-precision code space.
pub fn cell_range_2d(i: u64, j: u64, level: u8) -> (u64, u64) {
    if level == 0 {
        return (0, u64::MAX);
    }

    let code = (spread2(i) | (spread2(j) << 1)) << (64 - 2 * level as u32);
    let extent = (1u64 << (64 - 2 * level as u32)) - 1;
    (code, code | extent)
}

/// Covering of an axis-aligned box with level-`level` cells, returned as
/// inclusive code ranges with adjacent ranges merged.
///
/// The effective level is lowered until the box spans at most `max_cells`
/// cells per axis, so the result stays small for large boxes; coverage is
/// complete either way.
pub fn cover_box_2d(
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
    level: u8,
    max_cells: usize,
) -> Result<Vec<(u64, u64)>, IndexError> {
    check_unit("x0", x0)?;
    check_unit("y0", y0)?;
    check_unit("x1", x1)?;
    check_unit("y1", y1)?;

    if x1 < x0 || y1 < y0 {
        return Err(IndexError::invalid_argument(
            "box corners are not ordered".to_string(),
        ));
    }

    // lower the level until the per-axis cell count fits
    let mut level = level.min(MAX_LEVEL_2D);
    loop {
        let i0 = quantize(x0, level);
        let i1 = quantize(x1, level);
        let j0 = quantize(y0, level);
        let j1 = quantize(y1, level);

        if ((i1 - i0 + 1) as usize) <= max_cells && ((j1 - j0 + 1) as usize) <= max_cells {
            let mut ranges = Vec::new();
            for i in i0..=i1 {
                for j in j0..=j1 {
                    ranges.push(cell_range_2d(i, j, level));
                }
            }

            ranges.sort_unstable();

            // merge touching ranges so the planner unions fewer reads
            let merged = ranges
                .into_iter()
                .coalesce(|a, b| {
                    if b.0 <= a.1.saturating_add(1) {
                        Ok((a.0, a.1.max(b.1)))
                    } else {
                        Err((a, b))
                    }
                })
                .collect();

            return Ok(merged);
        }

        if level == 0 {
            return Ok(vec![(0, u64::MAX)]);
        }
        level -= 1;
    }
}
