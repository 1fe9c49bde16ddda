//! A thin layer over `uom` angle quantities: parsing the canonical `"60.0 deg"` string form,
//! normalizing angle ranges, and converting between degrees and radians on API boundaries.

use uom::si::angle::{degree, radian};
use uom::si::f64::Angle;
use uom::ConstZero;

use crate::error::Error;

/// Parses an angle from its canonical string form, e.g. `"60.0 deg"`, `"-18 degrees"`,
/// `"1.5707963267948966 rad"`. Leading/trailing whitespace is ignored; the unit spelling is
/// matched case-insensitively against `deg`/`degree`/`degrees`/`°` and `rad`/`radian`/`radians`.
pub fn parse_angle(s: &str) -> Result<Angle, Error> {
    let s = s.trim();
    let (value_str, unit_str) = split_value_and_unit(s)
        .ok_or_else(|| Error::invalid_data(format!("cannot parse angle from {s:?}")))?;
    let value: f64 = value_str
        .trim()
        .parse()
        .map_err(|_| Error::invalid_data(format!("cannot parse angle magnitude from {s:?}")))?;
    match unit_str.trim().to_ascii_lowercase().as_str() {
        "deg" | "degree" | "degrees" | "°" => Ok(Angle::new::<degree>(value)),
        "rad" | "radian" | "radians" => Ok(Angle::new::<radian>(value)),
        other => Err(Error::invalid_data(format!(
            "unrecognized angle unit {other:?} in {s:?}"
        ))),
    }
}

fn split_value_and_unit(s: &str) -> Option<(&str, &str)> {
    let split_at = s.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))?;
    Some((&s[..split_at], &s[split_at..]))
}

/// Prints an angle in its canonical `POLAR`-metadata form: degrees, one decimal place, the
/// literal unit suffix `" deg"`.
pub fn format_angle_degrees(angle: Angle) -> String {
    format!("{:.1} deg", angle.get::<degree>())
}

/// Normalizes an angle into the half-open range `[0, 2*pi)` radians.
pub fn normalize_full_turn(angle: Angle) -> Angle {
    let two_pi = Angle::new::<radian>(std::f64::consts::TAU);
    let mut a = angle % two_pi;
    if a < Angle::ZERO {
        a += two_pi;
    }
    a
}
