//! Builds the position-angle field `alpha(x,y)`, extracts image rotation (`CROTA`) from a
//! world-coordinate descriptor, and applies lookup-table pixel distortion.

use ndarray::Array2;
use uom::si::angle::radian;
use uom::si::f64::Angle;

use crate::error::Error;
use crate::units::normalize_full_turn;
use crate::wcs::Wcs;

/// Builds the solar position-angle field for an image of the given pixel shape.
///
/// For a pixel at grid indices `(i,j)` with image centre at `(cx,cy) = (W/2,H/2)`, the field
/// value is `rotate90(fliplr(atan2(y,x) + pi))` with `x = j - cx`, `y = i - cy`, composed exactly
/// as `solpolpy`'s `radial_north` builds it. Algebraically, `rotate90(fliplr(X)) == transpose(X)`
/// for any 2-D `X` (numpy's `rot90` is `transpose . fliplr`, and `fliplr` is its own inverse), so
/// the field this function returns at `(i,j)` is the base `atan2` grid's value at `(j,i)`. That
/// transpose only preserves the input shape when the image is square, which every known
/// consumer of this engine is; a non-square request is rejected rather than silently returning a
/// reshaped field.
pub fn alpha_field(shape: (usize, usize)) -> Result<Array2<Angle>, Error> {
    let (h, w) = shape;
    if h != w {
        return Err(Error::invalid_data(format!(
            "alpha field requires a square image, got {h}x{w}"
        )));
    }
    let n = h;
    let cx = w as f64 / 2.0;
    let cy = h as f64 / 2.0;
    let field = Array2::from_shape_fn((n, n), |(i, j)| {
        // alpha(i,j) = rotate90(fliplr(atan2(y,x) + pi)) with x = j-cx, y = i-cy; since
        // rotate90 . fliplr == transpose, alpha(i,j) equals the base grid evaluated at (j,i).
        let y = j as f64 - cy;
        let x = i as f64 - cx;
        let radians = y.atan2(x) + std::f64::consts::PI;
        normalize_full_turn(Angle::new::<radian>(radians))
    });
    Ok(field)
}

/// Extracts the image rotation angle (`CROTA`) from a world-coordinate descriptor.
pub fn crota(wcs: &Wcs) -> Angle {
    wcs.crota()
}

/// Applies a world-coordinate descriptor's pixel-shift distortion lookup table to a per-pixel
/// angle field. A no-op if the descriptor carries no distortion table.
pub fn apply_distortion(wcs: &Wcs, angles: &Array2<Angle>) -> Array2<Angle> {
    wcs.apply_distortion(angles)
}
