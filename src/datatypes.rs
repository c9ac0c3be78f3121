use nalgebra::DVector;
use num_complex::Complex64;

use crate::solver::SolverConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
}

/// Cross-section of the waveguide. The dielectric fills `0 <= y <= depth`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveguideGeometry {
    pub width: f64,
    pub height: f64,
    pub depth: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Materials {
    pub eps_dielectric: f64,
    pub eps_vacuum: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshResolution {
    pub nx: usize,
    pub ny: usize,
}

/// Raw eigenpair reported by the solver. `eigenvalue` holds `-kz^2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub eigenvalue: Complex64,
    pub residual_error: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectedMode {
    pub index: usize,
    pub kz: Complex64,
    pub residual_error: f64,
}

/// Mixed-space field of one eigenvector: edge dofs first, nodal dofs after.
#[derive(Debug, Clone, PartialEq)]
pub struct ModalField {
    pub transverse: DVector<Complex64>,
    pub axial: DVector<Complex64>,
}

#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub geometry: WaveguideGeometry,
    pub materials: Materials,
    pub wavelength: f64,
    pub resolution: MeshResolution,
    pub solver: SolverConfig,
    pub threshold: f64,
}

impl ModelMetadata {
    /// Free-space wavenumber `2π/λ0`
    pub fn k0(&self) -> f64 {
        2.0 * std::f64::consts::PI / self.wavelength
    }
}
