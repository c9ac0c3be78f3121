use std::cmp::Ordering;

use log::debug;
use num_complex::Complex64;

use crate::datatypes::{Candidate, SelectedMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NonFinite,
    ResidualTooLarge,
    /// Attenuating or spurious complex mode
    Evanescent,
    /// `kz` vanishes; the transverse field cannot be rescaled
    Degenerate,
}

/// Maps a raw eigenvalue `-kz^2` to the propagation constant `kz`
///
/// The principal square root always has a non-negative real part. When the
/// real part is exactly zero the sign is fixed so that `imag(kz) <= 0`, the
/// decaying solution for an `e^{-j kz z}` dependence.
pub fn propagation_constant(eigenvalue: Complex64) -> Complex64 {
    let kz = (-eigenvalue).sqrt();
    if kz.re == 0.0 && kz.im > 0.0 {
        -kz
    } else {
        kz
    }
}

/// Decides whether a single candidate is a propagating mode
///
/// # Arguments
/// * `candidate` - The candidate eigenpair
/// * `tolerance` - Bound for the residual error, `|imag(kz)|` and `|kz|`
///
/// # Returns
/// The propagation constant of an accepted candidate, or the reason it was
/// rejected
pub fn classify(candidate: &Candidate, tolerance: f64) -> Result<Complex64, Rejection> {
    if !candidate.eigenvalue.is_finite() || !candidate.residual_error.is_finite() {
        return Err(Rejection::NonFinite);
    }
    if candidate.residual_error >= tolerance {
        return Err(Rejection::ResidualTooLarge);
    }

    let kz = propagation_constant(candidate.eigenvalue);

    if kz.im.abs() > tolerance {
        return Err(Rejection::Evanescent);
    }
    if kz.norm() < tolerance {
        return Err(Rejection::Degenerate);
    }

    Ok(kz)
}

/// Filters candidates down to propagating modes, ordered by `real(kz)`
///
/// Ties in `real(kz)` are broken by solver index so the result never depends
/// on the order in which the solver returned its eigenpairs. An empty result
/// means no propagating mode was found near the solver target.
pub fn select_modes(candidates: &[Candidate], tolerance: f64) -> Vec<SelectedMode> {
    let mut modes: Vec<SelectedMode> = candidates
        .iter()
        .filter_map(|candidate| match classify(candidate, tolerance) {
            Ok(kz) => Some(SelectedMode {
                index: candidate.index,
                kz,
                residual_error: candidate.residual_error,
            }),
            Err(reason) => {
                debug!(
                    "rejected eigenpair {} (eigenvalue {}, error {:e}): {:?}",
                    candidate.index, candidate.eigenvalue, candidate.residual_error, reason
                );
                None
            }
        })
        .collect();

    modes.sort_by(|a, b| match a.kz.re.total_cmp(&b.kz.re) {
        Ordering::Equal => a.index.cmp(&b.index),
        ord => ord,
    });

    modes
}
