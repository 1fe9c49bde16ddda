//! A minimal world-coordinate descriptor. This is a stand-in for the caller's real astrometric
//! solution; the engine never parses FITS headers itself, it only reads these already-resolved
//! fields (see [`crate::System`] for the closed taxonomy that consumes them).

use uom::si::angle::radian;
use uom::si::f64::Angle;
use uom::ConstZero;

/// A per-pixel shift distortion lookup table, applied to a foreshortened polarizer-angle field
/// before the IMAX correction assembles its per-pixel matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionLut {
    /// The per-pixel angular shift to apply, same shape as the image.
    pub shift: ndarray::Array2<Angle>,
}

impl DistortionLut {
    /// Constructs a distortion lookup table from a pre-computed per-pixel shift field.
    pub fn new(shift: ndarray::Array2<Angle>) -> Self {
        Self { shift }
    }
}

/// A minimal world-coordinate descriptor: reference pixel, pixel scale, rotation, and an
/// optional pixel-shift distortion lookup table. The engine never parses FITS; it only reads
/// these already-resolved fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Wcs {
    /// The reference pixel column (1-indexed, FITS convention).
    pub crpix1: f64,
    /// The reference pixel row (1-indexed, FITS convention).
    pub crpix2: f64,
    /// The pixel scale along the first axis.
    pub cdelt1: Angle,
    /// The pixel scale along the second axis.
    pub cdelt2: Angle,
    /// The image rotation angle (instrument roll relative to solar north).
    pub crota2: Angle,
    /// An optional pixel-shift distortion lookup table.
    pub distortion: Option<DistortionLut>,
}

impl Default for Wcs {
    fn default() -> Self {
        Self {
            crpix1: 0.0,
            crpix2: 0.0,
            cdelt1: Angle::ZERO,
            cdelt2: Angle::ZERO,
            crota2: Angle::ZERO,
            distortion: None,
        }
    }
}

impl Wcs {
    /// Constructs a `Wcs` with the given reference pixel, pixel scale, and rotation, and no
    /// distortion lookup table.
    pub fn new(crpix1: f64, crpix2: f64, cdelt1: Angle, cdelt2: Angle, crota2: Angle) -> Self {
        Self {
            crpix1,
            crpix2,
            cdelt1,
            cdelt2,
            crota2,
            distortion: None,
        }
    }

    /// Attaches a distortion lookup table, returning the updated descriptor.
    pub fn with_distortion(mut self, distortion: DistortionLut) -> Self {
        self.distortion = Some(distortion);
        self
    }

    /// Returns the image rotation angle (`CROTA`) embedded in this descriptor.
    pub fn crota(&self) -> Angle {
        self.crota2
    }

    /// Returns `(lon_per_pixel, lat_per_pixel)`, the angular extent of a single pixel along each
    /// axis, as used by the IMAX field-of-view grid.
    pub fn pixel_scale(&self) -> (Angle, Angle) {
        (self.cdelt1, self.cdelt2)
    }

    /// Applies the distortion lookup table's per-pixel shift to `angles`, returning a new array.
    /// If no distortion table is present, returns `angles` unchanged.
    pub fn apply_distortion(&self, angles: &ndarray::Array2<Angle>) -> ndarray::Array2<Angle> {
        match &self.distortion {
            Some(lut) => {
                assert_eq!(
                    lut.shift.dim(),
                    angles.dim(),
                    "distortion lookup table shape must match the image shape"
                );
                ndarray::Zip::from(angles)
                    .and(&lut.shift)
                    .map_collect(|&a, &shift| a + shift)
            }
            None => angles.clone(),
        }
    }
}
