//! The IMAX corrector: the apparent change in polarizer orientation induced by off-axis
//! foreshortening in a wide-field imager. Builds the per-pixel 3x3 foreshortening matrix implied
//! by the three ideal MZP polarizer angles, inverts it pixel-by-pixel, and applies it to recover
//! the solar-frame MZP stack a flat (on-axis) polarimeter would have measured.

use nalgebra::{Matrix3, Vector3};
use ndarray::Array2;
use uom::si::angle::radian;
use uom::si::f64::Angle;

use crate::bundle::{Bundle, Cube};
use crate::error::Error;
use crate::geometry;
use crate::transforms::{self, MZP_ANGLES_DEG, MZP_KEYS};
use crate::wcs::Wcs;

/// Applies the IMAX foreshortening correction to an `mzpsolar` or `mzpinstru` bundle. Returns a
/// new bundle with `POLARREF` set to `"Solar"` on `M`, `Z`, and `P`; `alpha` is preserved
/// unchanged if the input carried one. `is_instrument_frame` selects whether `CROTA` and each
/// channel's `POLAROFF` contribute to the ideal polarizer angles (per the `cumulative_offset`
/// term in the module-level design).
pub fn apply(bundle: &Bundle, is_instrument_frame: bool) -> Result<Bundle, Error> {
    let m = bundle.require("M")?;
    let z = bundle.require("Z")?;
    let p = bundle.require("P")?;
    let shape = m.data.dim();
    if z.data.dim() != shape || p.data.dim() != shape {
        return Err(Error::invalid_data("IMAX input channels must share a shape"));
    }

    let wcs = &m.wcs;
    let crota = if is_instrument_frame {
        geometry::crota(wcs).get::<radian>()
    } else {
        0.0
    };
    let offsets = [
        channel_offset(m, is_instrument_frame, crota),
        channel_offset(z, is_instrument_frame, crota),
        channel_offset(p, is_instrument_frame, crota),
    ];

    let base_angles = MZP_ANGLES_DEG.map(|deg| deg.to_radians());
    let ideal_angles: [f64; 3] = [
        base_angles[0] + offsets[0],
        base_angles[1] + offsets[1],
        base_angles[2] + offsets[2],
    ];

    let (lon, lat) = field_of_view_grid(shape, wcs);
    let foreshortened: [Array2<f64>; 3] = ideal_angles.map(|theta| {
        let phi = ndarray::Zip::from(&lon)
            .and(&lat)
            .map_collect(|&l, &b| (theta.tan() * l.cos()).atan2(b.cos()));
        apply_distortion(wcs, phi)
    });

    let values = [&m.data, &z.data, &p.data];
    let mut outputs = [
        Array2::<f64>::zeros(shape),
        Array2::<f64>::zeros(shape),
        Array2::<f64>::zeros(shape),
    ];

    for idx in ndarray::indices(shape) {
        let phi_at = [foreshortened[0][idx], foreshortened[1][idx], foreshortened[2][idx]];
        let mut matrix = Matrix3::<f64>::zeros();
        for i in 0..3 {
            for j in 0..3 {
                matrix[(i, j)] = transforms::kernel(phi_at[i], ideal_angles[j], 0.0);
            }
        }
        let inverse = transforms::invert3(&matrix)
            .ok_or_else(|| Error::invalid_data("singular IMAX matrix"))?;
        let measured = Vector3::new(values[0][idx], values[1][idx], values[2][idx]);
        let corrected = inverse * measured;
        for (channel, value) in outputs.iter_mut().zip(corrected.iter()) {
            channel[idx] = *value;
        }
    }

    let mask = bundle.combined_mask();
    let mut out = Bundle::new();
    for (key, template, data) in [(MZP_KEYS[0], m, &outputs[0]), (MZP_KEYS[1], z, &outputs[1]), (MZP_KEYS[2], p, &outputs[2])] {
        let mut metadata = template.metadata.clone();
        metadata.insert("POLAR".to_owned(), (*key).into());
        metadata.insert("POLARREF".to_owned(), "Solar".into());
        out.insert(
            key,
            Cube {
                data: data.clone(),
                mask: mask.clone(),
                metadata,
                wcs: template.wcs.clone(),
            },
        );
    }
    if let Some(alpha) = bundle.alpha() {
        out.insert(crate::bundle::ALPHA_KEY, alpha.clone());
    }
    Ok(out)
}

/// A channel's contribution to `cumulative_offset`: `POLAROFF + CROTA` in the instrument frame,
/// zero otherwise.
fn channel_offset(cube: &Cube, is_instrument_frame: bool, crota: f64) -> f64 {
    if !is_instrument_frame {
        return 0.0;
    }
    let polaroff = cube
        .metadata
        .get("POLAROFF")
        .and_then(|v| v.as_angle())
        .map(|a| a.get::<radian>())
        .unwrap_or(0.0);
    polaroff + crota
}

/// Builds the per-pixel longitude/latitude field-of-view grid, centred on the reference pixel
/// and spanning `cdelt * shape` along each axis, rather than a fixed angular half-width, so the
/// correction scales correctly with whatever plate scale and detector size the caller's `Wcs`
/// describes.
fn field_of_view_grid(shape: (usize, usize), wcs: &Wcs) -> (Array2<f64>, Array2<f64>) {
    let (cdelt1, cdelt2) = wcs.pixel_scale();
    let cdelt1 = cdelt1.get::<radian>();
    let cdelt2 = cdelt2.get::<radian>();
    let lon = Array2::from_shape_fn(shape, |(_, j)| (j as f64 + 1.0 - wcs.crpix1) * cdelt1);
    let lat = Array2::from_shape_fn(shape, |(i, _)| (i as f64 + 1.0 - wcs.crpix2) * cdelt2);
    (lon, lat)
}

/// Applies the world-coordinate descriptor's distortion lookup table to a foreshortened
/// polarizer-angle field, converting to/from `uom::Angle` only for the duration of the call (the
/// rest of this module works in plain radians).
fn apply_distortion(wcs: &Wcs, phi_radians: Array2<f64>) -> Array2<f64> {
    if wcs.distortion.is_none() {
        return phi_radians;
    }
    let angles = phi_radians.mapv(Angle::new::<radian>);
    let shifted = geometry::apply_distortion(wcs, &angles);
    shifted.mapv(|a| a.get::<radian>())
}
