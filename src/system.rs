//! The closed enumeration of polarization representations, and the classifier that determines
//! which one a given bundle is an instance of.

use std::collections::BTreeSet;

use crate::bundle::Bundle;
use crate::error::Error;
use crate::units::parse_angle;

/// A polarization representation. See the module-level documentation for the channel keys each
/// variant requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum System {
    /// Three images at polarizer angles -60, 0, +60 degrees, referenced to the solar-north
    /// frame. Required keys: `M`, `Z`, `P`.
    MzpSolar,
    /// The same three angles, referenced to the instrument frame (rotated by `CROTA`, with
    /// optional per-channel `POLAROFF`). Required keys: `M`, `Z`, `P`.
    MzpInstru,
    /// Total and excess-polarized brightness. Keys: `B`, `pB`.
    Bpb,
    /// Tangential and radial brightness. Keys: `Bt`, `Br`.
    Btbr,
    /// Linear-polarization Stokes parameters. Keys: `I`, `Q`, `U`.
    Stokes,
    /// The `(B, pB, pB')` triple. Keys: `B`, `pB`, `pBp`.
    Bp3,
    /// Total brightness, polarization angle, degree of polarization. Keys: `B`, `theta`, `p`.
    Bthp,
    /// Four images at 0, 45, 90, 135 degrees.
    FourPol,
    /// N images at arbitrary polarizer angles.
    NPol,
}

impl System {
    /// Returns the canonical lowercase name used on the `resolve` boundary.
    pub fn name(&self) -> &'static str {
        match self {
            System::MzpSolar => "mzpsolar",
            System::MzpInstru => "mzpinstru",
            System::Bpb => "bpb",
            System::Btbr => "btbr",
            System::Stokes => "stokes",
            System::Bp3 => "bp3",
            System::Bthp => "bthp",
            System::FourPol => "fourpol",
            System::NPol => "npol",
        }
    }

    /// Parses a case-insensitive target-system name.
    pub fn parse(name: &str) -> Result<Self, Error> {
        match name.to_ascii_lowercase().as_str() {
            "mzpsolar" => Ok(System::MzpSolar),
            "mzpinstru" => Ok(System::MzpInstru),
            "bpb" => Ok(System::Bpb),
            "btbr" => Ok(System::Btbr),
            "stokes" => Ok(System::Stokes),
            "bp3" => Ok(System::Bp3),
            "bthp" => Ok(System::Bthp),
            "fourpol" => Ok(System::FourPol),
            "npol" => Ok(System::NPol),
            other => Err(Error::invalid_args(format!(
                "unknown target system {other:?}"
            ))),
        }
    }

    /// Returns the fixed set of required channel keys for every system except `npol`, whose key
    /// set is caller-defined.
    pub fn required_keys(&self) -> Option<&'static [&'static str]> {
        match self {
            System::MzpSolar | System::MzpInstru => Some(&["M", "Z", "P"]),
            System::Bpb => Some(&["B", "pB"]),
            System::Btbr => Some(&["Bt", "Br"]),
            System::Stokes => Some(&["I", "Q", "U"]),
            System::Bp3 => Some(&["B", "pB", "pBp"]),
            System::Bthp => Some(&["B", "theta", "p"]),
            System::FourPol => Some(&["0.0 deg", "45.0 deg", "90.0 deg", "135.0 deg"]),
            System::NPol => None,
        }
    }

    /// All systems, in a stable iteration order used by the classifier and the graph builder.
    pub fn all() -> [System; 9] {
        [
            System::MzpSolar,
            System::MzpInstru,
            System::Bpb,
            System::Btbr,
            System::Stokes,
            System::Bp3,
            System::Bthp,
            System::FourPol,
            System::NPol,
        ]
    }
}

/// Classifies a bundle into the polarization system it is an instance of.
///
/// Collects the bundle's non-`alpha` keys and compares them against each system's required key
/// set. `mzpsolar` and `mzpinstru` both claim `{M, Z, P}`; the tie is broken by inspecting
/// `POLARREF` on the `Z` channel. If no fixed system matches, every key is tried as an angle
/// quantity; if all parse, the bundle is `npol`. `fourpol` is checked ahead of `npol` because its
/// keys are also angle-valued.
pub fn classify(bundle: &Bundle) -> Result<System, Error> {
    let keys: BTreeSet<&str> = bundle.data_keys().collect();
    if keys.is_empty() {
        return Err(Error::invalid_data("no channels"));
    }

    for system in System::all() {
        let Some(required) = system.required_keys() else {
            continue;
        };
        let required_set: BTreeSet<&str> = required.iter().copied().collect();
        if required_set != keys {
            continue;
        }
        if system == System::MzpSolar || system == System::MzpInstru {
            let is_instrument = bundle
                .require("Z")?
                .metadata
                .get("POLARREF")
                .and_then(|v| v.as_text())
                .map(|v| v == "Instrument")
                .unwrap_or(false);
            return Ok(if is_instrument {
                System::MzpInstru
            } else {
                System::MzpSolar
            });
        }
        return Ok(system);
    }

    if keys.iter().all(|key| parse_angle(key).is_ok()) {
        return Ok(System::NPol);
    }

    Err(Error::invalid_data(format!(
        "no polarization system matches channel keys {keys:?}"
    )))
}
