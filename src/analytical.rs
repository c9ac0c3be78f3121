//! Dispersion relations of the half-loaded rectangular waveguide.
//!
//! With `k0 = 2π/λ0`, `ky = π/w`, `α = k0² ε_d − ky² − kz²`,
//! `kx_d = √α` and `kx_v = √(α − k0²(ε_d − ε_v))`, a mode satisfies one of
//!
//! ```text
//! LSM (TM_x):  kx_d/ε_d · tan(kx_d d) + kx_v/ε_v · tan(kx_v (h − d)) = 0
//! LSE (TE_x):  kx_d · cot(kx_d d)     + kx_v · cot(kx_v (h − d))     = 0
//! ```
//!
//! Tangents are evaluated in a form that stays finite when `kx_v` is a large
//! imaginary number, as it is for electrically large guides.

use std::f64::consts::PI;

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        CostFunction, Error, Executor, State, KV,
    },
    solver::brent::BrentRoot,
};
use log::{debug, trace};
use num_complex::Complex64;

use crate::{
    datatypes::{Materials, WaveguideGeometry},
    error::ModeError,
};

pub const MAX_BRENT_ITER: u64 = 200;
pub const BRENT_TOLERANCE: f64 = 1e-13;
/// Largest residual of a refined root, relative to the values at its bracket
pub const ROOT_ACCEPTANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeFamily {
    /// Longitudinal-section magnetic, TM with respect to the interface normal
    Lsm,
    /// Longitudinal-section electric, TE with respect to the interface normal
    Lse,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyticalMode {
    pub family: ModeFamily,
    pub kz: f64,
}

struct TransverseWavenumbers {
    kx_d: Complex64,
    kx_v: Complex64,
}

fn transverse_wavenumbers(
    kz: Complex64,
    geometry: &WaveguideGeometry,
    wavelength: f64,
    materials: &Materials,
) -> TransverseWavenumbers {
    let k0 = 2.0 * PI / wavelength;
    let ky = PI / geometry.width;

    let alpha = Complex64::new(k0 * k0 * materials.eps_dielectric - ky * ky, 0.0) - kz * kz;
    let beta = alpha - k0 * k0 * (materials.eps_dielectric - materials.eps_vacuum);

    TransverseWavenumbers {
        kx_d: alpha.sqrt(),
        kx_v: beta.sqrt(),
    }
}

/// `sin z` and `cos z`, both divided by `cosh(Im z)`
///
/// The common factor cancels in every ratio and sign test below, and the
/// scaled values stay bounded where `cosh` itself overflows.
fn damped_sin_cos(z: Complex64) -> (Complex64, Complex64) {
    let damping = z.im.tanh();
    let (sin, cos) = z.re.sin_cos();
    (
        Complex64::new(sin, cos * damping),
        Complex64::new(cos, -sin * damping),
    )
}

/// `tan z`, saturating to `±j` instead of `inf/inf` for large `|Im z|`
fn stable_tan(z: Complex64) -> Complex64 {
    let (sin, cos) = damped_sin_cos(z);
    sin / cos
}

fn stable_cot(z: Complex64) -> Complex64 {
    let (sin, cos) = damped_sin_cos(z);
    cos / sin
}

/// `sin(k l) / k` on the same scale as [`damped_sin_cos`], `l` at `k = 0`
fn damped_sinc(k: Complex64, length: f64) -> Complex64 {
    if k.norm() == 0.0 {
        Complex64::new(length, 0.0)
    } else {
        damped_sin_cos(k * length).0 / k
    }
}

/// Left-hand side of the LSM (TM_x) dispersion relation at `kz`
pub fn tm_condition(
    kz: Complex64,
    geometry: &WaveguideGeometry,
    wavelength: f64,
    materials: &Materials,
) -> Complex64 {
    let TransverseWavenumbers { kx_d, kx_v } =
        transverse_wavenumbers(kz, geometry, wavelength, materials);
    let vacuum_height = geometry.height - geometry.depth;

    kx_d / materials.eps_dielectric * stable_tan(kx_d * geometry.depth)
        + kx_v / materials.eps_vacuum * stable_tan(kx_v * vacuum_height)
}

/// Left-hand side of the LSE (TE_x) dispersion relation at `kz`
pub fn te_condition(
    kz: Complex64,
    geometry: &WaveguideGeometry,
    wavelength: f64,
    materials: &Materials,
) -> Complex64 {
    let TransverseWavenumbers { kx_d, kx_v } =
        transverse_wavenumbers(kz, geometry, wavelength, materials);
    let vacuum_height = geometry.height - geometry.depth;

    kx_d * stable_cot(kx_d * geometry.depth) + kx_v * stable_cot(kx_v * vacuum_height)
}

fn magnitude(value: Complex64) -> f64 {
    if value.is_finite() {
        value.norm()
    } else {
        f64::INFINITY
    }
}

/// How far `kz` is from satisfying either dispersion relation
pub fn discrepancy(
    kz: Complex64,
    geometry: &WaveguideGeometry,
    wavelength: f64,
    materials: &Materials,
) -> f64 {
    let tm = magnitude(tm_condition(kz, geometry, wavelength, materials));
    let te = magnitude(te_condition(kz, geometry, wavelength, materials));
    tm.min(te)
}

/// Checks a candidate propagation constant against the analytical modes
///
/// # Arguments
/// * `kz` - The candidate propagation constant
/// * `geometry` - The waveguide cross-section
/// * `wavelength` - The free-space wavelength
/// * `materials` - Permittivities of the dielectric and vacuum regions
/// * `threshold` - The largest accepted discrepancy
///
/// # Returns
/// True if `kz` satisfies the LSM or the LSE relation within `threshold`
pub fn verify_mode(
    kz: Complex64,
    geometry: &WaveguideGeometry,
    wavelength: f64,
    materials: &Materials,
    threshold: f64,
) -> bool {
    let d = discrepancy(kz, geometry, wavelength, materials);
    trace!("kz = {kz}: dispersion discrepancy {d:e}");
    d < threshold
}

/// Eigenvalue to use as a shift-and-invert target when searching near `kz`
pub fn suggested_target(kz: f64) -> f64 {
    -(kz * kz)
}

/// One dispersion relation for real `kz`, as a function of
/// `s = √(kz_max² − kz²)`
///
/// The relation is multiplied through by the denominators of its tangents
/// (LSM) or cotangents (LSE), which removes every pole. What remains is real
/// and continuous in `s`, so each sign change brackets a mode.
#[derive(Clone, Copy)]
struct DispersionProblem<'a> {
    family: ModeFamily,
    geometry: &'a WaveguideGeometry,
    materials: &'a Materials,
    /// `α − s²`; zero when the dielectric is the denser region
    alpha_offset: f64,
    /// `k0² (ε_d − ε_v)`
    contrast: f64,
}

impl<'a> DispersionProblem<'a> {
    fn evaluate(&self, s: f64) -> f64 {
        let alpha = Complex64::new(self.alpha_offset + s * s, 0.0);
        let kx_d = alpha.sqrt();
        let kx_v = (alpha - self.contrast).sqrt();
        let depth = self.geometry.depth;
        let vacuum_height = self.geometry.height - depth;

        let (sin_d, cos_d) = damped_sin_cos(kx_d * depth);
        let (sin_v, cos_v) = damped_sin_cos(kx_v * vacuum_height);

        let value = match self.family {
            // LSM · cos(kx_d d) · cos(kx_v (h − d))
            ModeFamily::Lsm => {
                kx_d * sin_d * cos_v / self.materials.eps_dielectric
                    + kx_v * sin_v * cos_d / self.materials.eps_vacuum
            }
            // LSE · sin(kx_d d)/kx_d · sin(kx_v (h − d))/kx_v
            ModeFamily::Lse => {
                cos_d * damped_sinc(kx_v, vacuum_height) + cos_v * damped_sinc(kx_d, depth)
            }
        };
        value.re
    }
}

impl<'a> CostFunction for DispersionProblem<'a> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, s: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.evaluate(*s))
    }
}

/// Logs Brent iterations at trace level
struct BrentObserver;

impl<I> Observe<I> for BrentObserver
where
    I: State<Float = f64>,
{
    fn observe_iter(&mut self, state: &I, _kv: &KV) -> Result<(), Error> {
        trace!(
            "brent iteration {}: |f| = {:e}",
            state.get_iter(),
            state.get_cost()
        );
        Ok(())
    }
}

/// Refines a bracketed root of the relation with Brent's method
fn refine_root(problem: DispersionProblem, lower: f64, upper: f64) -> Result<f64, ModeError> {
    let solver = BrentRoot::new(lower, upper, BRENT_TOLERANCE);

    let res = Executor::new(problem, solver)
        .configure(|state| state.max_iters(MAX_BRENT_ITER))
        .add_observer(BrentObserver, ObserverMode::Always)
        .run()
        .map_err(|err| ModeError::Solver(format!("Brent root search error: {err}")))?;

    match res.state().best_param {
        Some(s) => Ok(s),
        None => Err(ModeError::Solver(
            "Brent root search could not produce a best parameter".to_owned(),
        )),
    }
}

/// Finds the real propagation constants of one mode family
///
/// Scans `s = √(kz_max² − kz²)` uniformly over `(0, kz_max)`, with
/// `kz_max = √(k0² ε_max − ky²)`, and refines each sign change of the
/// pole-free relation. Sampling in `s` rather than `kz` keeps the modes that
/// crowd just below `kz_max` in electrically large guides apart.
///
/// # Arguments
/// * `geometry` - The waveguide cross-section
/// * `wavelength` - The free-space wavelength
/// * `materials` - Permittivities of the dielectric and vacuum regions
/// * `family` - Which dispersion relation to solve
/// * `samples` - Number of scan intervals
///
/// # Returns
/// The roots in descending order, fundamental mode first
pub fn find_modes(
    geometry: &WaveguideGeometry,
    wavelength: f64,
    materials: &Materials,
    family: ModeFamily,
    samples: usize,
) -> Result<Vec<AnalyticalMode>, ModeError> {
    if !(materials.eps_dielectric > 0.0 && materials.eps_vacuum > 0.0) {
        return Err(ModeError::Input(
            "Permittivities must be positive".to_owned(),
        ));
    }
    if !(wavelength > 0.0 && geometry.width > 0.0) {
        return Err(ModeError::Input(
            "Wavelength and width must be positive".to_owned(),
        ));
    }

    let k0 = 2.0 * PI / wavelength;
    let ky = PI / geometry.width;
    let guided_sq = k0 * k0 * materials.eps_dielectric - ky * ky;
    let cutoff_sq = k0 * k0 * materials.eps_dielectric.max(materials.eps_vacuum) - ky * ky;
    if cutoff_sq <= 0.0 || samples < 2 {
        debug!("no propagating {family:?} modes below cutoff");
        return Ok(Vec::new());
    }
    let kz_max = cutoff_sq.sqrt();

    let problem = DispersionProblem {
        family,
        geometry,
        materials,
        alpha_offset: guided_sq - cutoff_sq,
        contrast: k0 * k0 * (materials.eps_dielectric - materials.eps_vacuum),
    };

    // Endpoints are excluded: s = 0 is kz = kz_max and s = kz_max is kz = 0
    let step = kz_max / samples as f64;
    let grid: Vec<f64> = (1..samples).map(|i| i as f64 * step).collect();

    let mut modes: Vec<AnalyticalMode> = Vec::new();
    for pair in grid.windows(2) {
        let (lower, upper) = (pair[0], pair[1]);
        let (f_lower, f_upper) = (problem.evaluate(lower), problem.evaluate(upper));

        if !f_lower.is_finite() || !f_upper.is_finite() || f_lower * f_upper > 0.0 {
            continue;
        }

        let s = refine_root(problem, lower, upper)?;
        let residual = problem.evaluate(s).abs();
        if residual > ROOT_ACCEPTANCE * f_lower.abs().max(f_upper.abs()) {
            trace!("discarding jump of the {family:?} relation near s = {s}");
            continue;
        }

        let kz = ((kz_max - s) * (kz_max + s)).sqrt();
        debug!("{family:?} root at kz = {kz}");
        modes.push(AnalyticalMode { family, kz });
    }

    // A root on a grid point is bracketed twice
    modes.sort_by(|a, b| b.kz.total_cmp(&a.kz));
    modes.dedup_by(|a, b| (a.kz - b.kz).abs() <= 1e-12 * kz_max);

    Ok(modes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tutorial_geometry() -> WaveguideGeometry {
        WaveguideGeometry {
            width: 1.0,
            height: 0.45,
            depth: 0.225,
        }
    }

    fn tutorial_wavelength() -> f64 {
        0.45 / 0.2
    }

    #[test]
    fn uniform_guide_fundamental_passes_verification() {
        let geometry = tutorial_geometry();
        let wavelength = tutorial_wavelength();
        let materials = Materials {
            eps_dielectric: 2.45,
            eps_vacuum: 2.45,
        };

        let k0 = 2.0 * PI / wavelength;
        let kz = (k0 * k0 * 2.45 - (PI / geometry.width).powi(2)).sqrt();

        assert!(verify_mode(
            Complex64::new(kz, 0.0),
            &geometry,
            wavelength,
            &materials,
            1e-6
        ));
    }

    #[test]
    fn off_root_value_fails_verification() {
        let geometry = tutorial_geometry();
        let wavelength = tutorial_wavelength();
        let materials = Materials {
            eps_dielectric: 2.45,
            eps_vacuum: 2.45,
        };

        let k0 = 2.0 * PI / wavelength;
        let kz = 0.9 * (k0 * k0 * 2.45 - (PI / geometry.width).powi(2)).sqrt();

        assert!(!verify_mode(
            Complex64::new(kz, 0.0),
            &geometry,
            wavelength,
            &materials,
            1e-6
        ));
    }

    #[test]
    fn exact_zero_transverse_wavenumber_is_not_nan() {
        let geometry = tutorial_geometry();
        let materials = Materials {
            eps_dielectric: 1.0,
            eps_vacuum: 1.0,
        };
        // k0 chosen so that alpha vanishes exactly at kz = 1
        let wavelength = 2.0 * PI / (1.0 + PI * PI).sqrt();

        let d = discrepancy(Complex64::new(1.0, 0.0), &geometry, wavelength, &materials);
        assert!(!d.is_nan());
    }

    #[test]
    fn uniform_guide_roots_match_closed_form() {
        let geometry = tutorial_geometry();
        let wavelength = 0.2;
        let eps = 2.45;
        let materials = Materials {
            eps_dielectric: eps,
            eps_vacuum: eps,
        };

        let modes = find_modes(&geometry, wavelength, &materials, ModeFamily::Lse, 4000).unwrap();
        assert!(!modes.is_empty());

        // LSE roots of a uniform guide sit at kx = m π / h, m >= 1
        let k0 = 2.0 * PI / wavelength;
        let ky = PI / geometry.width;
        let kx = PI / geometry.height;
        let expected = (k0 * k0 * eps - ky * ky - kx * kx).sqrt();
        assert_relative_eq!(modes[0].kz, expected, max_relative = 1e-8);
    }

    #[test]
    fn half_loaded_fundamental_is_found_and_verified() {
        let geometry = tutorial_geometry();
        let wavelength = tutorial_wavelength();
        let materials = Materials {
            eps_dielectric: 2.45,
            eps_vacuum: 1.0,
        };

        let modes = find_modes(&geometry, wavelength, &materials, ModeFamily::Lsm, 2000).unwrap();
        assert!(!modes.is_empty());

        let k0 = 2.0 * PI / wavelength;
        let fundamental = modes[0];
        assert!(fundamental.kz > 0.0);
        assert!(fundamental.kz < k0 * 2.45f64.sqrt());
        assert!(verify_mode(
            Complex64::new(fundamental.kz, 0.0),
            &geometry,
            wavelength,
            &materials,
            1e-4
        ));
        for pair in modes.windows(2) {
            assert!(pair[0].kz > pair[1].kz);
        }
    }

    fn millimetre_wave_setup() -> (WaveguideGeometry, f64, Materials) {
        (
            tutorial_geometry(),
            0.003,
            Materials {
                eps_dielectric: 2.45,
                eps_vacuum: 1.0,
            },
        )
    }

    #[test]
    fn electrically_large_guide_relations_stay_finite() {
        let (geometry, wavelength, materials) = millimetre_wave_setup();
        let k0 = 2.0 * PI / wavelength;
        let ky = PI / geometry.width;
        // kx_d = 1, so the vacuum region decays over hundreds of skin depths
        let kz = Complex64::new((k0 * k0 * 2.45 - ky * ky - 1.0).sqrt(), 0.0);
        let q = (k0 * k0 * 1.45 - 1.0).sqrt();

        let tm = tm_condition(kz, &geometry, wavelength, &materials);
        let te = te_condition(kz, &geometry, wavelength, &materials);
        assert!(tm.is_finite());
        assert!(te.is_finite());
        assert!(discrepancy(kz, &geometry, wavelength, &materials).is_finite());

        // tan(j q l) -> j once q l is large
        let expected_tm = (geometry.depth).tan() / 2.45 - q;
        let expected_te = 1.0 / (geometry.depth).tan() + q;
        assert_relative_eq!(tm.re, expected_tm, max_relative = 1e-6);
        assert_relative_eq!(te.re, expected_te, max_relative = 1e-6);
        assert!(tm.im.abs() < 1e-6 * q);
    }

    #[test]
    fn electrically_large_fundamental_is_found_near_cutoff() {
        let (geometry, wavelength, materials) = millimetre_wave_setup();
        let k0 = 2.0 * PI / wavelength;
        let kz_max = (k0 * k0 * 2.45 - (PI / geometry.width).powi(2)).sqrt();

        let modes = find_modes(&geometry, wavelength, &materials, ModeFamily::Lsm, 2000).unwrap();
        assert!(!modes.is_empty());

        let fundamental = modes[0].kz;
        assert!(fundamental < kz_max);
        assert!(fundamental > 0.999 * kz_max);

        // Slab-guided: kx_d sits just below the first tangent pole
        let kx_d = ((kz_max - fundamental) * (kz_max + fundamental)).sqrt();
        let first_pole = PI / (2.0 * geometry.depth);
        assert!(kx_d < first_pole);
        assert!(kx_d > 0.99 * first_pole);
    }

    #[test]
    fn guide_below_cutoff_has_no_modes() {
        let geometry = tutorial_geometry();
        let materials = Materials {
            eps_dielectric: 1.0,
            eps_vacuum: 1.0,
        };
        // k0 < π / w
        let modes = find_modes(&geometry, 10.0, &materials, ModeFamily::Lsm, 100).unwrap();
        assert!(modes.is_empty());
    }

    #[test]
    fn suggested_target_is_negative_square() {
        assert_eq!(suggested_target(3.0), -9.0);
    }
}
