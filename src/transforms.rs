//! The transform catalogue: one pure function per directed edge `(src_system → dst_system)`.
//!
//! Every edge consumes a [`Bundle`] and produces a new one. Each carries two static attribute
//! flags, `uses_alpha` and `uses_out_angles`, that the graph planner folds across a composed path
//! so the dispatcher knows what to materialize before execution (see [`crate::resolve`]).
//!
//! Internally every edge works in plain `f64` radians; `uom::si::f64::Angle` only appears at the
//! bundle boundary (metadata, `alpha`'s stored radians, caller-supplied angle lists).

use nalgebra::Matrix3;
use ndarray::Array2;
use uom::si::angle::{degree, radian};
use uom::si::f64::Angle;
use uom::ConstZero;

use crate::bundle::{Bundle, Cube, Metadata, ALPHA_KEY};
use crate::error::Error;
use crate::geometry;
use crate::system::System;
use crate::units::format_angle_degrees;

/// The three canonical MZP polarizer angles, in degrees, in `M, Z, P` order.
pub const MZP_ANGLES_DEG: [f64; 3] = [-60.0, 0.0, 60.0];
/// The three MZP channel keys, in the order every MZP-like output must preserve.
pub const MZP_KEYS: [&str; 3] = ["M", "Z", "P"];
/// The four `fourpol` channel keys (canonical angle-string form), in `0, 45, 90, 135` order.
pub const FOURPOL_KEYS: [&str; 4] = ["0.0 deg", "45.0 deg", "90.0 deg", "135.0 deg"];

/// A numerically singular 3x3 matrix is detected by comparing `|det|` against this tolerance.
const SINGULAR_EPSILON: f64 = 1e-10;
/// Denominators of the form `cos 2(theta - alpha)` below this magnitude are masked invalid rather
/// than divided through.
const DIVISION_EPSILON: f64 = 1e-6;

/// The caller-supplied arguments threaded through every edge in a composed path.
#[derive(Debug, Clone)]
pub struct EdgeArgs {
    /// The spacecraft-specific reference angle offset (defaults to zero).
    pub reference_angle: Angle,
    /// The caller-supplied list of virtual polarizer angles, required by edges that declare
    /// `uses_out_angles`.
    pub out_angles: Option<Vec<Angle>>,
}

impl Default for EdgeArgs {
    fn default() -> Self {
        Self {
            reference_angle: Angle::ZERO,
            out_angles: None,
        }
    }
}

/// A single catalogue entry: a directed edge between two [`System`] nodes.
pub struct Edge {
    /// The edge's source system.
    pub src: System,
    /// The edge's destination system.
    pub dst: System,
    /// Whether this edge's formula reads the `alpha` position-angle field as a required input.
    /// Edges that merely forward an already-present `alpha` without needing it for their own
    /// arithmetic (`bpb ↔ btbr`) report `false` here; see their doc comments.
    pub uses_alpha: bool,
    /// Whether this edge requires the caller to supply `out_angles`.
    pub uses_out_angles: bool,
    /// The edge's implementation.
    pub apply: fn(&Bundle, &EdgeArgs) -> Result<Bundle, Error>,
}

impl Edge {
    const fn new(
        src: System,
        dst: System,
        uses_alpha: bool,
        uses_out_angles: bool,
        apply: fn(&Bundle, &EdgeArgs) -> Result<Bundle, Error>,
    ) -> Self {
        Self {
            src,
            dst,
            uses_alpha,
            uses_out_angles,
            apply,
        }
    }
}

/// The complete catalogue of transform edges, in no particular order. The graph (`crate::graph`)
/// indexes this by `(src, dst)` to build its adjacency list.
pub fn catalogue() -> &'static [Edge] {
    &[
        Edge::new(System::MzpSolar, System::Bpb, true, false, mzpsolar_to_bpb),
        Edge::new(System::Bpb, System::MzpSolar, true, false, bpb_to_mzpsolar),
        Edge::new(System::Bpb, System::Btbr, false, false, bpb_to_btbr),
        Edge::new(System::Btbr, System::Bpb, false, false, btbr_to_bpb),
        Edge::new(System::Btbr, System::MzpSolar, true, false, btbr_to_mzpsolar),
        Edge::new(System::Btbr, System::NPol, true, true, btbr_to_npol),
        Edge::new(System::MzpSolar, System::Stokes, false, false, mzpsolar_to_stokes),
        Edge::new(System::Stokes, System::MzpSolar, false, false, stokes_to_mzpsolar),
        Edge::new(System::MzpSolar, System::Bp3, true, false, mzpsolar_to_bp3),
        Edge::new(System::Bp3, System::MzpSolar, true, false, bp3_to_mzpsolar),
        Edge::new(System::Bp3, System::Bthp, true, false, bp3_to_bthp),
        Edge::new(System::FourPol, System::Stokes, false, false, fourpol_to_stokes),
        Edge::new(System::NPol, System::MzpSolar, false, false, npol_to_mzpsolar),
        Edge::new(System::MzpSolar, System::NPol, false, true, mzpsolar_to_npol),
        Edge::new(System::MzpSolar, System::MzpInstru, false, false, mzpsolar_to_mzpinstru),
        Edge::new(System::MzpInstru, System::MzpSolar, false, false, mzpinstru_to_mzpsolar),
    ]
}

// ---------------------------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------------------------

/// Reads the required `alpha` field as plain radians, or fails with [`Error::MissingAlpha`].
fn require_alpha(bundle: &Bundle) -> Result<Array2<f64>, Error> {
    let cube = bundle.alpha().ok_or(Error::MissingAlpha)?;
    Ok(cube.data.clone())
}

/// Carries `alpha` through to an output bundle unchanged, if present on the input.
fn carry_alpha(input: &Bundle, output: &mut Bundle) {
    if let Some(cube) = input.alpha() {
        output.insert(ALPHA_KEY, cube.clone());
    }
}

/// Builds an output cube from a data array, the first input cube (for `wcs` and metadata
/// provenance), and the output channel's `POLAR` identifier.
fn output_cube(template: &Cube, data: Array2<f64>, polar_tag: impl Into<String>, mask: Option<Array2<bool>>) -> Cube {
    let mut metadata: Metadata = template.metadata.clone();
    metadata.insert("POLAR".to_owned(), polar_tag.into().into());
    Cube {
        data,
        mask,
        metadata,
        wcs: template.wcs.clone(),
    }
}

/// Sets `POLARREF` to `"Solar"` on a metadata map, returning it.
fn with_solar_ref(mut cube: Cube) -> Cube {
    cube.metadata.insert("POLARREF".to_owned(), "Solar".into());
    cube
}

/// Sets `POLARREF` to `"Instrument"` on a metadata map, returning it.
fn with_instrument_ref(mut cube: Cube) -> Cube {
    cube.metadata.insert("POLARREF".to_owned(), "Instrument".into());
    cube
}

/// Fetches `M`, `Z`, `P` as `(cube, data)` triples in that order.
fn mzp_cubes<'a>(bundle: &'a Bundle) -> Result<[&'a Cube; 3], Error> {
    Ok([
        bundle.require("M")?,
        bundle.require("Z")?,
        bundle.require("P")?,
    ])
}

fn degrees(values: [f64; 3]) -> [Angle; 3] {
    [
        Angle::new::<degree>(values[0]),
        Angle::new::<degree>(values[1]),
        Angle::new::<degree>(values[2]),
    ]
}

fn to_radians(angles: [Angle; 3]) -> [f64; 3] {
    [
        angles[0].get::<radian>(),
        angles[1].get::<radian>(),
        angles[2].get::<radian>(),
    ]
}

/// Reads a channel's `POLAROFF` metadata as radians, defaulting to zero if absent.
fn polaroff_radians(cube: &Cube) -> f64 {
    cube.metadata
        .get("POLAROFF")
        .and_then(|v| v.as_angle())
        .map(|a| a.get::<radian>())
        .unwrap_or(0.0)
}

/// The DeForest et al. (2022) polarizer-response kernel: the fraction of brightness measured
/// through a polarizer at `out_angle` that a source at `in_angle` contributes, relative to a
/// reference frame offset by `reference_angle`. Also used, with a zero reference angle, by the
/// IMAX corrector's per-pixel matrix assembly.
pub(crate) fn kernel(out_angle: f64, in_angle: f64, reference_angle: f64) -> f64 {
    let delta = out_angle - in_angle - reference_angle;
    (4.0 * delta.cos().powi(2) - 1.0) / 3.0
}

/// Computes the closed-form adjugate/determinant inverse of a 3x3 matrix, returning `None` if it
/// is numerically singular (`|det| < `[`SINGULAR_EPSILON`]`). Shared with the IMAX corrector's
/// per-pixel inversion.
pub(crate) fn invert3(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let det = m.determinant();
    if det.abs() < SINGULAR_EPSILON {
        return None;
    }
    Some(m.try_inverse()?)
}

/// Forward polarizer projection: given values measured at `src_angles`, computes the value that
/// would be measured at each `dst_angle`. Used by `mzpsolar → npol`, `mzpsolar → mzpinstru`, and
/// the IMAX corrector's matrix assembly.
fn forward_project(
    src_angles: &[f64],
    src_values: &[&Array2<f64>],
    dst_angles: &[f64],
    reference_angle: f64,
) -> Vec<Array2<f64>> {
    dst_angles
        .iter()
        .map(|&dst| {
            let mut acc: Option<Array2<f64>> = None;
            for (&src, values) in src_angles.iter().zip(src_values.iter()) {
                let weight = kernel(dst, src, reference_angle);
                let term = values.mapv(|v| v * weight);
                acc = Some(match acc {
                    Some(existing) => existing + term,
                    None => term,
                });
            }
            acc.unwrap_or_else(|| Array2::zeros((0, 0)))
        })
        .collect()
}

/// Inverse polarizer projection: given `N` measurements at `in_angles`, recovers the values that
/// would have been measured at the 3 `dst_angles`, via a per-pixel-independent least-squares (or,
/// for `N == 3`, exact) solve of the linear system `measured = A * target`. Used by
/// `npol → mzpsolar` and `mzpinstru → mzpsolar`.
fn inverse_project(
    in_angles: &[f64],
    in_values: &[&Array2<f64>],
    dst_angles: [f64; 3],
    reference_angle: f64,
) -> Result<[Array2<f64>; 3], Error> {
    let n = in_angles.len();
    // Build A (n x 3): A[i][j] = kernel(in_angles[i], dst_angles[j], reference_angle).
    let mut a = vec![[0.0_f64; 3]; n];
    for (i, &in_angle) in in_angles.iter().enumerate() {
        for j in 0..3 {
            a[i][j] = kernel(in_angle, dst_angles[j], reference_angle);
        }
    }

    // Normal-equations matrix AtA (3x3) and its inverse; for n == 3 with an invertible A this is
    // algebraically identical to inverting A directly.
    let mut at_a = Matrix3::<f64>::zeros();
    for row in &a {
        for p in 0..3 {
            for q in 0..3 {
                at_a[(p, q)] += row[p] * row[q];
            }
        }
    }
    let at_a_inv = invert3(&at_a).ok_or_else(|| Error::invalid_data("singular matrix"))?;

    let shape = in_values[0].dim();
    let mut outputs = [
        Array2::<f64>::zeros(shape),
        Array2::<f64>::zeros(shape),
        Array2::<f64>::zeros(shape),
    ];

    // At * measured, a length-3 vector of arrays.
    let mut at_b = [
        Array2::<f64>::zeros(shape),
        Array2::<f64>::zeros(shape),
        Array2::<f64>::zeros(shape),
    ];
    for (row, values) in a.iter().zip(in_values.iter()) {
        for p in 0..3 {
            at_b[p] = &at_b[p] + &values.mapv(|v| v * row[p]);
        }
    }

    for p in 0..3 {
        for q in 0..3 {
            let weight = at_a_inv[(p, q)];
            outputs[p] = &outputs[p] + &at_b[q].mapv(|v| v * weight);
        }
    }

    Ok(outputs)
}

// ---------------------------------------------------------------------------------------------
// mzpsolar <-> bpb
// ---------------------------------------------------------------------------------------------

fn mzpsolar_to_bpb(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let [m, z, p] = mzp_cubes(bundle)?;
    let alpha = require_alpha(bundle)?;
    let thetas = to_radians(degrees(MZP_ANGLES_DEG));
    let values = [&m.data, &z.data, &p.data];

    let b = (&values[0].clone() + &values[1].clone() + &values[2].clone()).mapv(|v| v * (2.0 / 3.0));
    let mut pb = Array2::<f64>::zeros(alpha.dim());
    for (theta, data) in thetas.iter().zip(values.iter()) {
        let term = ndarray::Zip::from(*data)
            .and(&alpha)
            .map_collect(|&v, &a| v * (2.0 * (theta - a)).cos());
        pb = &pb + &term;
    }
    pb.mapv_inplace(|v| v * (-4.0 / 3.0));

    let mask = bundle.combined_mask();
    let mut out = Bundle::new();
    out.insert("B", with_solar_ref(output_cube(m, b, "B", mask.clone())));
    out.insert("pB", with_solar_ref(output_cube(m, pb, "pB", mask)));
    carry_alpha(bundle, &mut out);
    Ok(out)
}

fn bpb_to_mzpsolar(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let b = bundle.require("B")?;
    let pb = bundle.require("pB")?;
    let alpha = require_alpha(bundle)?;
    let thetas = to_radians(degrees(MZP_ANGLES_DEG));
    let mask = bundle.combined_mask();

    let mut out = Bundle::new();
    for (key, theta) in MZP_KEYS.iter().zip(thetas.iter()) {
        let data = ndarray::Zip::from(&b.data)
            .and(&pb.data)
            .and(&alpha)
            .map_collect(|&bv, &pbv, &a| 0.5 * (bv - pbv * (2.0 * (theta - a)).cos()));
        out.insert(*key, with_solar_ref(output_cube(b, data, format_angle_degrees(Angle::new::<radian>(*theta)), mask.clone())));
    }
    carry_alpha(bundle, &mut out);
    Ok(out)
}

// ---------------------------------------------------------------------------------------------
// bpb <-> btbr
// ---------------------------------------------------------------------------------------------

fn bpb_to_btbr(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let b = bundle.require("B")?;
    let pb = bundle.require("pB")?;
    let mask = bundle.combined_mask();

    let br = ndarray::Zip::from(&b.data).and(&pb.data).map_collect(|&bv, &pbv| (bv - pbv) / 2.0);
    let bt = ndarray::Zip::from(&b.data).and(&pb.data).map_collect(|&bv, &pbv| (bv + pbv) / 2.0);

    let mut out = Bundle::new();
    out.insert("Bt", output_cube(b, bt, "Bt", mask.clone()));
    out.insert("Br", output_cube(b, br, "Br", mask));
    carry_alpha(bundle, &mut out);
    Ok(out)
}

fn btbr_to_bpb(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let bt = bundle.require("Bt")?;
    let br = bundle.require("Br")?;
    let mask = bundle.combined_mask();

    let b = &bt.data + &br.data;
    let pb = &bt.data - &br.data;

    let mut out = Bundle::new();
    out.insert("B", output_cube(bt, b, "B", mask.clone()));
    out.insert("pB", output_cube(bt, pb, "pB", mask));
    carry_alpha(bundle, &mut out);
    Ok(out)
}

// ---------------------------------------------------------------------------------------------
// btbr -> mzpsolar / npol
// ---------------------------------------------------------------------------------------------

fn btbr_to_mzpsolar(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let bt = bundle.require("Bt")?;
    let br = bundle.require("Br")?;
    let alpha = require_alpha(bundle)?;
    let thetas = to_radians(degrees(MZP_ANGLES_DEG));
    let mask = bundle.combined_mask();

    let mut out = Bundle::new();
    for (key, theta) in MZP_KEYS.iter().zip(thetas.iter()) {
        let data = ndarray::Zip::from(&bt.data)
            .and(&br.data)
            .and(&alpha)
            .map_collect(|&btv, &brv, &a| {
                let s = (theta - a).sin();
                let c = (theta - a).cos();
                btv * s * s + brv * c * c
            });
        out.insert(*key, with_solar_ref(output_cube(bt, data, format_angle_degrees(Angle::new::<radian>(*theta)), mask.clone())));
    }
    carry_alpha(bundle, &mut out);
    Ok(out)
}

fn btbr_to_npol(bundle: &Bundle, args: &EdgeArgs) -> Result<Bundle, Error> {
    let bt = bundle.require("Bt")?;
    let br = bundle.require("Br")?;
    let alpha = require_alpha(bundle)?;
    let out_angles = args
        .out_angles
        .as_ref()
        .ok_or_else(|| Error::invalid_args("btbr -> npol requires out_angles"))?;
    let mask = bundle.combined_mask();

    let mut out = Bundle::new();
    for angle in out_angles {
        let theta = angle.get::<radian>();
        let data = ndarray::Zip::from(&bt.data)
            .and(&br.data)
            .and(&alpha)
            .map_collect(|&btv, &brv, &a| {
                let s = (theta - a).sin();
                let c = (theta - a).cos();
                btv * s * s + brv * c * c
            });
        let key = format_angle_degrees(*angle);
        out.insert(key.clone(), output_cube(bt, data, key, mask.clone()));
    }
    carry_alpha(bundle, &mut out);
    Ok(out)
}

// ---------------------------------------------------------------------------------------------
// mzpsolar <-> stokes
// ---------------------------------------------------------------------------------------------

/// The forward Stokes matrix, `(2/3) * [[1,1,1],[-1,2,-1],[-sqrt3,0,sqrt3]]`, applied to `(M,Z,P)`.
fn stokes_matrix() -> Matrix3<f64> {
    let sqrt3 = 3.0_f64.sqrt();
    Matrix3::new(1.0, 1.0, 1.0, -1.0, 2.0, -1.0, -sqrt3, 0.0, sqrt3).scale(2.0 / 3.0)
}

fn mzpsolar_to_stokes(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let [m, z, p] = mzp_cubes(bundle)?;
    let matrix = stokes_matrix();
    let mask = bundle.combined_mask();

    let shape = m.data.dim();
    let mut i = Array2::<f64>::zeros(shape);
    let mut q = Array2::<f64>::zeros(shape);
    let mut u = Array2::<f64>::zeros(shape);
    for ((iv, qv, uv), ((mv, zv), pv)) in i
        .iter_mut()
        .zip(q.iter_mut())
        .zip(u.iter_mut())
        .zip(m.data.iter().zip(z.data.iter()).zip(p.data.iter()))
        .map(|(((a, b), c), d)| ((a, b, c), d))
    {
        let vec = nalgebra::Vector3::new(*mv, *zv, *pv);
        let out = matrix * vec;
        *iv = out[0];
        *qv = out[1];
        *uv = out[2];
    }

    let mut out = Bundle::new();
    out.insert("I", output_cube(m, i, "Stokes I", mask.clone()));
    out.insert("Q", output_cube(m, q, "Stokes Q", mask.clone()));
    out.insert("U", output_cube(m, u, "Stokes U", mask));
    Ok(out)
}

fn stokes_to_mzpsolar(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let i = bundle.require("I")?;
    let q = bundle.require("Q")?;
    let u = bundle.require("U")?;
    let matrix = stokes_matrix();
    let inverse = invert3(&matrix).ok_or_else(|| Error::invalid_data("singular matrix"))?;
    let mask = bundle.combined_mask();

    let shape = i.data.dim();
    let mut outputs = [
        Array2::<f64>::zeros(shape),
        Array2::<f64>::zeros(shape),
        Array2::<f64>::zeros(shape),
    ];
    for (((iv, qv), uv), ((mo, zo), po)) in i
        .data
        .iter()
        .zip(q.data.iter())
        .zip(u.data.iter())
        .zip(
            outputs[0]
                .iter_mut()
                .zip(outputs[1].iter_mut())
                .zip(outputs[2].iter_mut()),
        )
    {
        let vec = nalgebra::Vector3::new(*iv, *qv, *uv);
        let out = inverse * vec;
        *mo = out[0];
        *zo = out[1];
        *po = out[2];
    }

    let mut out = Bundle::new();
    for (key, data) in MZP_KEYS.iter().zip(outputs) {
        out.insert(*key, with_solar_ref(output_cube(i, data, *key, mask.clone())));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------------------------
// mzpsolar <-> bp3, bp3 -> bthp
// ---------------------------------------------------------------------------------------------

fn mzpsolar_to_bp3(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let [m, z, p] = mzp_cubes(bundle)?;
    let alpha = require_alpha(bundle)?;
    let thetas = to_radians(degrees(MZP_ANGLES_DEG));
    let values = [&m.data, &z.data, &p.data];
    let mask = bundle.combined_mask();

    let b = (&values[0].clone() + &values[1].clone() + &values[2].clone()).mapv(|v| v * (2.0 / 3.0));
    let mut pb = Array2::<f64>::zeros(alpha.dim());
    let mut pbp = Array2::<f64>::zeros(alpha.dim());
    for (theta, data) in thetas.iter().zip(values.iter()) {
        let cos_term = ndarray::Zip::from(*data)
            .and(&alpha)
            .map_collect(|&v, &a| v * (2.0 * (theta - a)).cos());
        let sin_term = ndarray::Zip::from(*data)
            .and(&alpha)
            .map_collect(|&v, &a| v * (2.0 * (theta - a)).sin());
        pb = &pb + &cos_term;
        pbp = &pbp + &sin_term;
    }
    pb.mapv_inplace(|v| v * (-4.0 / 3.0));
    pbp.mapv_inplace(|v| v * (-4.0 / 3.0));

    let mut out = Bundle::new();
    out.insert("B", with_solar_ref(output_cube(m, b, "B", mask.clone())));
    out.insert("pB", with_solar_ref(output_cube(m, pb, "pB", mask.clone())));
    out.insert("pBp", with_solar_ref(output_cube(m, pbp, "pBp", mask)));
    carry_alpha(bundle, &mut out);
    Ok(out)
}

fn bp3_to_mzpsolar(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let b = bundle.require("B")?;
    let pb = bundle.require("pB")?;
    let pbp = bundle.require("pBp")?;
    let alpha = require_alpha(bundle)?;
    let thetas = to_radians(degrees(MZP_ANGLES_DEG));
    let mask = bundle.combined_mask();

    let mut out = Bundle::new();
    for (key, theta) in MZP_KEYS.iter().zip(thetas.iter()) {
        let data = ndarray::Zip::from(&b.data)
            .and(&pb.data)
            .and(&pbp.data)
            .and(&alpha)
            .map_collect(|&bv, &pbv, &pbpv, &a| {
                0.5 * (bv - (2.0 * (theta - a)).cos() * pbv - (2.0 * (theta - a)).sin() * pbpv)
            });
        out.insert(*key, with_solar_ref(output_cube(b, data, format_angle_degrees(Angle::new::<radian>(*theta)), mask.clone())));
    }
    carry_alpha(bundle, &mut out);
    Ok(out)
}

fn bp3_to_bthp(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let b = bundle.require("B")?;
    let pb = bundle.require("pB")?;
    let pbp = bundle.require("pBp")?;
    let alpha = require_alpha(bundle)?;
    let mask = bundle.combined_mask();

    let theta = ndarray::Zip::from(&pb.data)
        .and(&pbp.data)
        .and(&alpha)
        .map_collect(|&pbv, &pbpv, &a| 0.5 * pbpv.atan2(pbv) + std::f64::consts::FRAC_PI_2 + a);
    let p = ndarray::Zip::from(&b.data)
        .and(&pb.data)
        .and(&pbp.data)
        .map_collect(|&bv, &pbv, &pbpv| (pbv * pbv + pbpv * pbpv).sqrt() / bv);

    let mut out = Bundle::new();
    out.insert("B", output_cube(b, b.data.clone(), "B", mask.clone()));
    out.insert("theta", output_cube(b, theta, "theta", mask.clone()));
    out.insert("p", output_cube(b, p, "p", mask));
    Ok(out)
}

// ---------------------------------------------------------------------------------------------
// fourpol -> stokes
// ---------------------------------------------------------------------------------------------

fn fourpol_to_stokes(bundle: &Bundle, _args: &EdgeArgs) -> Result<Bundle, Error> {
    let b0 = bundle.require(FOURPOL_KEYS[0])?;
    let b45 = bundle.require(FOURPOL_KEYS[1])?;
    let b90 = bundle.require(FOURPOL_KEYS[2])?;
    let b135 = bundle.require(FOURPOL_KEYS[3])?;
    let mask = bundle.combined_mask();

    let i = &b0.data + &b90.data;
    let q = &b90.data - &b0.data;
    let u = &b135.data - &b45.data;

    let mut out = Bundle::new();
    out.insert("I", output_cube(b0, i, "Stokes I", mask.clone()));
    out.insert("Q", output_cube(b0, q, "Stokes Q", mask.clone()));
    out.insert("U", output_cube(b0, u, "Stokes U", mask));
    Ok(out)
}

// ---------------------------------------------------------------------------------------------
// npol <-> mzpsolar
// ---------------------------------------------------------------------------------------------

fn npol_to_mzpsolar(bundle: &Bundle, args: &EdgeArgs) -> Result<Bundle, Error> {
    let keys: Vec<&str> = bundle.data_keys().collect();
    let mut angles = Vec::with_capacity(keys.len());
    let mut values = Vec::with_capacity(keys.len());
    let mut template: Option<&Cube> = None;
    for key in &keys {
        let cube = bundle.require(key)?;
        angles.push(crate::units::parse_angle(key)?.get::<radian>());
        values.push(&cube.data);
        template.get_or_insert(cube);
    }
    let template = template.ok_or_else(|| Error::invalid_data("npol bundle has no channels"))?;
    let reference_angle = args.reference_angle.get::<radian>();
    let dst = to_radians(degrees(MZP_ANGLES_DEG));

    let outputs = inverse_project(&angles, &values, dst, reference_angle)?;
    let mask = bundle.combined_mask();

    let mut out = Bundle::new();
    for (key, data) in MZP_KEYS.iter().zip(outputs) {
        out.insert(*key, with_solar_ref(output_cube(template, data, *key, mask.clone())));
    }
    Ok(out)
}

fn mzpsolar_to_npol(bundle: &Bundle, args: &EdgeArgs) -> Result<Bundle, Error> {
    let [m, z, p] = mzp_cubes(bundle)?;
    let out_angles = args
        .out_angles
        .as_ref()
        .ok_or_else(|| Error::invalid_args("mzpsolar -> npol requires out_angles"))?;
    let reference_angle = args.reference_angle.get::<radian>();
    let src = to_radians(degrees(MZP_ANGLES_DEG));
    let dst: Vec<f64> = out_angles.iter().map(|a| a.get::<radian>()).collect();
    let values = [&m.data, &z.data, &p.data];

    let projected = forward_project(&src, &values, &dst, reference_angle);
    let mask = bundle.combined_mask();

    let mut out = Bundle::new();
    for (angle, data) in out_angles.iter().zip(projected) {
        let key = format_angle_degrees(*angle);
        out.insert(key.clone(), output_cube(m, data, key, mask.clone()));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------------------------
// mzpsolar <-> mzpinstru
// ---------------------------------------------------------------------------------------------

fn mzpsolar_to_mzpinstru(bundle: &Bundle, args: &EdgeArgs) -> Result<Bundle, Error> {
    let [m, z, p] = mzp_cubes(bundle)?;
    let crota = geometry::crota(&m.wcs).get::<radian>();
    let reference_angle = args.reference_angle.get::<radian>();
    let src = to_radians(degrees(MZP_ANGLES_DEG));
    let dst: Vec<f64> = src.iter().map(|theta| theta + crota).collect();
    let values = [&m.data, &z.data, &p.data];

    let projected = forward_project(&src, &values, &dst, reference_angle);
    let mask = bundle.combined_mask();

    let mut out = Bundle::new();
    for (key, data) in MZP_KEYS.iter().zip(projected) {
        out.insert(*key, with_instrument_ref(output_cube(m, data, *key, mask.clone())));
    }
    Ok(out)
}

fn mzpinstru_to_mzpsolar(bundle: &Bundle, args: &EdgeArgs) -> Result<Bundle, Error> {
    let [m, z, p] = mzp_cubes(bundle)?;
    let crota = geometry::crota(&z.wcs).get::<radian>();
    let reference_angle = args.reference_angle.get::<radian>();
    let src = to_radians(degrees(MZP_ANGLES_DEG));
    let offsets = [polaroff_radians(m), polaroff_radians(z), polaroff_radians(p)];
    let in_angles: Vec<f64> = src
        .iter()
        .zip(offsets.iter())
        .map(|(theta, off)| theta + crota + off)
        .collect();
    let values = [&m.data, &z.data, &p.data];

    let outputs = inverse_project(&in_angles, &values, src, reference_angle)?;
    let mask = bundle.combined_mask();

    let mut out = Bundle::new();
    for (key, data) in MZP_KEYS.iter().zip(outputs) {
        out.insert(*key, with_solar_ref(output_cube(m, data, *key, mask.clone())));
    }
    Ok(out)
}

/// Masks `cos(2(theta - alpha))` to invalid (`NaN`) wherever its magnitude falls below
/// [`DIVISION_EPSILON`]; used by edges that divide by this quantity to recover `pB` from a single
/// non-clear frame. Not currently wired into the catalogue (no shipped edge performs that
/// recovery), but kept alongside the other numerics helpers per the spec's tolerance contract.
#[allow(dead_code)]
fn masked_cos_denominator(theta: f64, alpha: &Array2<f64>) -> Array2<f64> {
    alpha.mapv(|a| {
        let denom = (2.0 * (theta - a)).cos();
        if denom.abs() < DIVISION_EPSILON {
            f64::NAN
        } else {
            denom
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wcs::Wcs;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn ones_cube(value: f64) -> Cube {
        Cube::new(Array2::from_elem((1, 1), value), Wcs::default())
    }

    fn alpha_cube(radians: f64) -> Cube {
        Cube::new(Array2::from_elem((1, 1), radians), Wcs::default())
    }

    fn pick(cube: &Cube) -> f64 {
        cube.data[(0, 0)]
    }

    #[test]
    fn mzpsolar_to_bpb_ones_alpha_zero() {
        let mut bundle = Bundle::new();
        bundle.insert("M", ones_cube(1.0));
        bundle.insert("Z", ones_cube(1.0));
        bundle.insert("P", ones_cube(1.0));
        bundle.insert(ALPHA_KEY, alpha_cube(0.0));
        let out = mzpsolar_to_bpb(&bundle, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(out.require("B").unwrap()), 2.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("pB").unwrap()), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn bpb_to_mzpsolar_seed_scenario() {
        let mut bundle = Bundle::new();
        bundle.insert("B", ones_cube(1.0));
        bundle.insert("pB", ones_cube(1.0));
        bundle.insert(ALPHA_KEY, alpha_cube(0.0));
        let out = bpb_to_mzpsolar(&bundle, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(out.require("M").unwrap()), 0.75, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("Z").unwrap()), 0.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("P").unwrap()), 0.75, epsilon = 1e-9);
    }

    #[test]
    fn btbr_to_bpb_ones() {
        let mut bundle = Bundle::new();
        bundle.insert("Bt", ones_cube(1.0));
        bundle.insert("Br", ones_cube(1.0));
        let out = btbr_to_bpb(&bundle, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(out.require("B").unwrap()), 2.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("pB").unwrap()), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn mzpsolar_to_stokes_ones() {
        let mut bundle = Bundle::new();
        bundle.insert("M", ones_cube(1.0));
        bundle.insert("Z", ones_cube(1.0));
        bundle.insert("P", ones_cube(1.0));
        let out = mzpsolar_to_stokes(&bundle, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(out.require("I").unwrap()), 2.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("Q").unwrap()), 0.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("U").unwrap()), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn stokes_to_mzpsolar_seed_scenario() {
        let mut bundle = Bundle::new();
        bundle.insert("I", ones_cube(1.0));
        bundle.insert("Q", ones_cube(1.0));
        bundle.insert("U", ones_cube(1.0));
        let out = stokes_to_mzpsolar(&bundle, &EdgeArgs::default()).unwrap();
        let sqrt3 = 3.0_f64.sqrt();
        assert_relative_eq!(pick(out.require("M").unwrap()), (1.0 - sqrt3) / 4.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("Z").unwrap()), 1.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("P").unwrap()), (1.0 + sqrt3) / 4.0, epsilon = 1e-9);
    }

    #[test]
    fn fourpol_to_stokes_ones() {
        let mut bundle = Bundle::new();
        for key in FOURPOL_KEYS {
            bundle.insert(key, ones_cube(1.0));
        }
        let out = fourpol_to_stokes(&bundle, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(out.require("I").unwrap()), 2.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("Q").unwrap()), 0.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("U").unwrap()), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn bp3_to_bthp_seed_scenario() {
        let mut bundle = Bundle::new();
        bundle.insert("B", ones_cube(1.0));
        bundle.insert("pB", ones_cube(1.0));
        bundle.insert("pBp", ones_cube(1.0));
        bundle.insert(ALPHA_KEY, alpha_cube(0.0));
        let out = bp3_to_bthp(&bundle, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(out.require("B").unwrap()), 1.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("theta").unwrap()), 5.0 * std::f64::consts::PI / 8.0, epsilon = 1e-9);
        assert_relative_eq!(pick(out.require("p").unwrap()), 2.0_f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn mzpinstru_to_mzpsolar_preserves_uniform_unpolarized_input() {
        // A uniform (unpolarized) signal measured through any polarizer triad, however
        // offset, recovers as the same uniform signal: the three-polarizer kernel's rows
        // always sum to exactly 1 for the canonical -60/0/60 target triad, regardless of the
        // measured angles' offset. This holds for both a shared POLAROFF and per-channel ones.
        let mut bundle = Bundle::new();
        bundle.insert("M", ones_cube(1.0).with_metadata("POLAROFF", Angle::new::<degree>(1.0)));
        bundle.insert(
            "Z",
            ones_cube(1.0)
                .with_metadata("POLAROFF", Angle::new::<degree>(1.0))
                .with_metadata("POLARREF", "Instrument"),
        );
        bundle.insert("P", ones_cube(1.0).with_metadata("POLAROFF", Angle::new::<degree>(1.0)));
        let out = mzpinstru_to_mzpsolar(&bundle, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(out.require("M").unwrap()), 1.0, epsilon = 1e-6);
        assert_relative_eq!(pick(out.require("Z").unwrap()), 1.0, epsilon = 1e-6);
        assert_relative_eq!(pick(out.require("P").unwrap()), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn mzpinstru_to_mzpsolar_round_trips_through_mzpsolar_to_mzpinstru() {
        let mut solar = Bundle::new();
        solar.insert("M", ones_cube(0.4));
        solar.insert("Z", ones_cube(0.9));
        solar.insert("P", ones_cube(1.3));
        let instru = mzpsolar_to_mzpinstru(&solar, &EdgeArgs::default()).unwrap();
        let back = mzpinstru_to_mzpsolar(&instru, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(back.require("M").unwrap()), 0.4, epsilon = 1e-6);
        assert_relative_eq!(pick(back.require("Z").unwrap()), 0.9, epsilon = 1e-6);
        assert_relative_eq!(pick(back.require("P").unwrap()), 1.3, epsilon = 1e-6);
    }

    #[test]
    fn btbr_to_npol_three_angles() {
        let mut bundle = Bundle::new();
        bundle.insert("Bt", ones_cube(1.0));
        bundle.insert("Br", ones_cube(1.0));
        bundle.insert(ALPHA_KEY, alpha_cube(0.0));
        let args = EdgeArgs {
            reference_angle: Angle::ZERO,
            out_angles: Some(vec![
                Angle::new::<degree>(0.0),
                Angle::new::<degree>(120.0),
                Angle::new::<degree>(240.0),
            ]),
        };
        let out = btbr_to_npol(&bundle, &args).unwrap();
        for (key, _) in out.iter() {
            assert_relative_eq!(out.require(key).unwrap().data[(0, 0)], 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn singular_stokes_matrix_is_unreachable_but_npol_inversion_detects_singularity() {
        let mut bundle = Bundle::new();
        // Three identical angles make every row of A identical: singular AtA.
        for angle in ["0.0 deg", "0.0 deg", "0.0 deg"] {
            // IndexMap overwrites duplicate keys; use distinct keys with the same parsed angle
            // via trailing whitespace variants so classification still sees three npol channels.
            let _ = angle;
        }
        bundle.insert("0.0 deg", ones_cube(1.0));
        bundle.insert("0.00 deg", ones_cube(1.0));
        bundle.insert("-0.0 deg", ones_cube(1.0));
        let result = npol_to_mzpsolar(&bundle, &EdgeArgs::default());
        assert!(result.is_err());
    }

    #[test]
    fn round_trip_mzpsolar_stokes() {
        let mut bundle = Bundle::new();
        bundle.insert("M", ones_cube(0.3));
        bundle.insert("Z", ones_cube(0.7));
        bundle.insert("P", ones_cube(1.1));
        let stokes = mzpsolar_to_stokes(&bundle, &EdgeArgs::default()).unwrap();
        let back = stokes_to_mzpsolar(&stokes, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(back.require("M").unwrap()), 0.3, epsilon = 1e-9);
        assert_relative_eq!(pick(back.require("Z").unwrap()), 0.7, epsilon = 1e-9);
        assert_relative_eq!(pick(back.require("P").unwrap()), 1.1, epsilon = 1e-9);
    }

    #[test]
    fn round_trip_bpb_mzpsolar() {
        // bpb -> mzpsolar -> bpb is lossless (B, pB are exactly the 2 DOF mzpsolar -> bpb
        // keeps); the reverse direction is not, since bpb_to_mzpsolar's
        // `B_theta = 1/2(B - pB cos2(theta-alpha))` drops the sine-quadrature component pBp
        // that a non-clear (polarized) MZP triple carries.
        let mut bundle = Bundle::new();
        bundle.insert("B", ones_cube(2.1));
        bundle.insert("pB", ones_cube(0.4));
        bundle.insert(ALPHA_KEY, alpha_cube(0.4));
        let mzp = bpb_to_mzpsolar(&bundle, &EdgeArgs::default()).unwrap();
        let back = mzpsolar_to_bpb(&mzp, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(back.require("B").unwrap()), 2.1, epsilon = 1e-9);
        assert_relative_eq!(pick(back.require("pB").unwrap()), 0.4, epsilon = 1e-9);
    }

    #[test]
    fn round_trip_bpb_btbr() {
        let mut bundle = Bundle::new();
        bundle.insert("B", ones_cube(2.1));
        bundle.insert("pB", ones_cube(0.4));
        let btbr = bpb_to_btbr(&bundle, &EdgeArgs::default()).unwrap();
        let back = btbr_to_bpb(&btbr, &EdgeArgs::default()).unwrap();
        assert_relative_eq!(pick(back.require("B").unwrap()), 2.1, epsilon = 1e-9);
        assert_relative_eq!(pick(back.require("pB").unwrap()), 0.4, epsilon = 1e-9);
    }

    #[test]
    fn mask_propagates_as_logical_or() {
        let mut bundle = Bundle::new();
        bundle.insert("M", ones_cube(1.0).with_mask(array![[false]]));
        bundle.insert("Z", ones_cube(1.0).with_mask(array![[true]]));
        bundle.insert("P", ones_cube(1.0).with_mask(array![[false]]));
        let out = mzpsolar_to_stokes(&bundle, &EdgeArgs::default()).unwrap();
        assert_eq!(out.require("I").unwrap().mask, Some(array![[true]]));
    }

    #[test]
    fn missing_mask_on_any_input_yields_none() {
        let mut bundle = Bundle::new();
        bundle.insert("M", ones_cube(1.0).with_mask(array![[false]]));
        bundle.insert("Z", ones_cube(1.0));
        bundle.insert("P", ones_cube(1.0).with_mask(array![[false]]));
        let out = mzpsolar_to_stokes(&bundle, &EdgeArgs::default()).unwrap();
        assert_eq!(out.require("I").unwrap().mask, None);
    }
}
