//! The image bundle: an ordered mapping from a channel key to a `Cube`, plus collection-level
//! metadata. A `Cube` carries a 2-D array, an optional validity mask, per-channel metadata, and
//! a world-coordinate descriptor.

use indexmap::IndexMap;
use ndarray::Array2;
use uom::si::f64::Angle;

use crate::error::Error;
use crate::wcs::Wcs;

/// The channel key reserved for the position-angle field. It never counts toward a system's
/// required-key set and is excluded from mask combination.
pub const ALPHA_KEY: &str = "alpha";

/// A metadata value attached to a channel or to a bundle. Closed over the handful of value
/// shapes the transform catalogue and its callers actually need.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// A free-form string, used for `POLAR` output tags and `POLARREF`/`OBSRVTRY`.
    Text(String),
    /// An angle quantity, used for `POLAR` input tags and `POLAROFF`.
    Angle(Angle),
    /// A plain float, used for numeric metadata with no angular unit.
    Float(f64),
    /// A boolean flag.
    Bool(bool),
}

impl MetadataValue {
    /// Returns the value as a string slice if it is a `Text` variant.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the value as an angle if it is an `Angle` variant.
    pub fn as_angle(&self) -> Option<Angle> {
        match self {
            MetadataValue::Angle(a) => Some(*a),
            _ => None,
        }
    }

    /// Returns the value as a float if it is a `Float` variant.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<Angle> for MetadataValue {
    fn from(value: Angle) -> Self {
        MetadataValue::Angle(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

/// A mapping of string metadata keys to metadata values.
pub type Metadata = IndexMap<String, MetadataValue>;

/// A single image channel: a 2-D floating-point array, an optional validity mask (`true` means
/// invalid), per-channel metadata, and a world-coordinate descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Cube {
    /// The channel's sample data.
    pub data: Array2<f64>,
    /// The channel's validity mask, `true` marking an invalid pixel. `None` means every pixel is
    /// valid.
    pub mask: Option<Array2<bool>>,
    /// Per-channel metadata, e.g. `POLAR`, `POLARREF`, `POLAROFF`.
    pub metadata: Metadata,
    /// The world-coordinate descriptor associated with this channel.
    pub wcs: Wcs,
}

impl Cube {
    /// Constructs a cube with no mask and empty metadata.
    pub fn new(data: Array2<f64>, wcs: Wcs) -> Self {
        Self {
            data,
            mask: None,
            metadata: Metadata::new(),
            wcs,
        }
    }

    /// Returns the cube's pixel shape `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        let dim = self.data.dim();
        (dim.0, dim.1)
    }

    /// Sets a metadata entry, returning the updated cube.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the validity mask, returning the updated cube.
    pub fn with_mask(mut self, mask: Array2<bool>) -> Self {
        self.mask = Some(mask);
        self
    }
}

/// An ordered mapping from a channel key to a [`Cube`], plus collection-level metadata.
/// Insertion order is preserved; this matters for the ordering guarantees every edge's output
/// must satisfy (see `transforms`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    channels: IndexMap<String, Cube>,
    /// Collection-level metadata, e.g. `OBSRVTRY`.
    pub metadata: Metadata,
}

impl Bundle {
    /// Constructs an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a channel, preserving the key's original position if it already
    /// existed, otherwise appending it.
    pub fn insert(&mut self, key: impl Into<String>, cube: Cube) {
        self.channels.insert(key.into(), cube);
    }

    /// Inserts a channel and returns `self`, for fluent construction.
    pub fn with_channel(mut self, key: impl Into<String>, cube: Cube) -> Self {
        self.insert(key, cube);
        self
    }

    /// Looks up a channel by key.
    pub fn get(&self, key: &str) -> Option<&Cube> {
        self.channels.get(key)
    }

    /// Looks up a channel by key, returning an `Error::InvalidData` if it is absent.
    pub fn require(&self, key: &str) -> Result<&Cube, Error> {
        self.get(key)
            .ok_or_else(|| Error::invalid_data(format!("missing required channel {key:?}")))
    }

    /// Returns an iterator over `(key, cube)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cube)> {
        self.channels.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the channel keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(|k| k.as_str())
    }

    /// Returns the channel keys excluding [`ALPHA_KEY`], in insertion order.
    pub fn data_keys(&self) -> impl Iterator<Item = &str> {
        self.keys().filter(|k| *k != ALPHA_KEY)
    }

    /// Returns the number of channels, including `alpha` if present.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns `true` if the bundle has no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Returns the `alpha` channel, if present.
    pub fn alpha(&self) -> Option<&Cube> {
        self.get(ALPHA_KEY)
    }

    /// Returns `true` if the `alpha` channel is present.
    pub fn has_alpha(&self) -> bool {
        self.alpha().is_some()
    }

    /// Returns the pixel shape shared by every channel in the bundle, or `None` if the bundle is
    /// empty. Does not itself verify that every channel shares this shape; use
    /// [`Bundle::validate_shapes`] for that.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.channels.values().next().map(Cube::shape)
    }

    /// Verifies that every channel (including `alpha`) shares the same pixel shape.
    pub fn validate_shapes(&self) -> Result<(), Error> {
        let Some(expected) = self.shape() else {
            return Ok(());
        };
        for (key, cube) in self.iter() {
            if cube.shape() != expected {
                return Err(Error::invalid_data(format!(
                    "channel {key:?} has shape {:?}, expected {:?}",
                    cube.shape(),
                    expected
                )));
            }
        }
        Ok(())
    }

    /// Combines the validity masks of every non-`alpha` channel with a logical OR, channel by
    /// channel. Returns `None` if any contributing channel lacks a mask (invariant 5: an
    /// unmasked input makes the combined mask `None`, not "all valid").
    pub fn combined_mask(&self) -> Option<Array2<bool>> {
        let mut combined: Option<Array2<bool>> = None;
        for (key, cube) in self.iter() {
            if key == ALPHA_KEY {
                continue;
            }
            let mask = cube.mask.as_ref()?;
            combined = Some(match combined {
                Some(existing) => existing | mask,
                None => mask.clone(),
            });
        }
        combined
    }
}
