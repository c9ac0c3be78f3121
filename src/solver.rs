use std::str::FromStr;

use json::JsonValue;
use log::{debug, info, warn};
use num_complex::Complex64;

use crate::{datatypes::Candidate, error::ModeError};

pub const DEFAULT_TOLERANCE: f64 = 1e-9;
pub const DEFAULT_NEV: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemType {
    /// Generalized Hermitian
    Ghep,
    /// Generalized non-Hermitian
    Gnhep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    KrylovSchur,
    Arnoldi,
    Lanczos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectralTransform {
    Shift,
    ShiftInvert,
}

/// Which part of the spectrum the target refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    TargetReal,
    TargetImaginary,
    TargetMagnitude,
}

impl FromStr for ProblemType {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ghep" => Ok(ProblemType::Ghep),
            "gnhep" => Ok(ProblemType::Gnhep),
            other => Err(ModeError::Input(format!("Unknown problem_type '{other}'"))),
        }
    }
}

impl FromStr for Method {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "krylov-schur" | "krylovschur" => Ok(Method::KrylovSchur),
            "arnoldi" => Ok(Method::Arnoldi),
            "lanczos" => Ok(Method::Lanczos),
            other => Err(ModeError::Input(format!("Unknown solver method '{other}'"))),
        }
    }
}

impl FromStr for SpectralTransform {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shift" => Ok(SpectralTransform::Shift),
            "sinvert" | "shift-invert" => Ok(SpectralTransform::ShiftInvert),
            other => Err(ModeError::Input(format!(
                "Unknown spectral_transform '{other}'"
            ))),
        }
    }
}

impl FromStr for Which {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "target_real" => Ok(Which::TargetReal),
            "target_imaginary" => Ok(Which::TargetImaginary),
            "target_magnitude" => Ok(Which::TargetMagnitude),
            other => Err(ModeError::Input(format!("Unknown which '{other}'"))),
        }
    }
}

/// Eigensolver settings. Built once from the input file and handed to the
/// solve as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    pub problem_type: ProblemType,
    pub method: Method,
    pub spectral_transform: SpectralTransform,
    pub which: Which,
    pub target: Complex64,
    pub tolerance: f64,
    pub nev: usize,
}

impl SolverConfig {
    /// Default configuration for a free-space wavenumber `k0`. The target
    /// assumes `kz` near `0.5 k0`.
    pub fn for_wavenumber(k0: f64) -> SolverConfig {
        SolverConfig {
            problem_type: ProblemType::Gnhep,
            method: Method::KrylovSchur,
            spectral_transform: SpectralTransform::ShiftInvert,
            which: Which::TargetReal,
            target: Complex64::new(-(0.5 * k0).powi(2), 0.0),
            tolerance: DEFAULT_TOLERANCE,
            nev: DEFAULT_NEV,
        }
    }

    /// Parses the optional `solver` section of the input file
    ///
    /// # Arguments
    /// * `section` - The `solver` json object, `JsonValue::Null` when absent
    /// * `k0` - Free-space wavenumber used for the default target
    pub fn from_json(section: &JsonValue, k0: f64) -> Result<SolverConfig, ModeError> {
        let mut config = SolverConfig::for_wavenumber(k0);

        if section.is_null() {
            return Ok(config);
        }
        if !section.is_object() {
            return Err(ModeError::Input(
                "Input json solver field must be an object".to_owned(),
            ));
        }

        if section.has_key("problem_type") {
            config.problem_type = string_field(section, "problem_type")?.parse()?;
        }
        if section.has_key("method") {
            config.method = string_field(section, "method")?.parse()?;
        }
        if section.has_key("spectral_transform") {
            config.spectral_transform = string_field(section, "spectral_transform")?.parse()?;
        }
        if section.has_key("which") {
            config.which = string_field(section, "which")?.parse()?;
        }
        if section.has_key("target") {
            config.target = parse_complex(&section["target"], "solver.target")?;
        }
        if section.has_key("tolerance") {
            config.tolerance = section["tolerance"].as_f64().ok_or_else(|| {
                ModeError::Input("Bad value for tolerance in solver section".to_owned())
            })?;
        }
        if section.has_key("nev") {
            config.nev = section["nev"].as_usize().ok_or_else(|| {
                ModeError::Input("Bad value for nev in solver section".to_owned())
            })?;
        }

        if !(config.tolerance > 0.0) {
            return Err(ModeError::Input(
                "Solver tolerance must be positive".to_owned(),
            ));
        }
        if config.nev == 0 {
            return Err(ModeError::Input(
                "Solver nev must be at least 1".to_owned(),
            ));
        }

        Ok(config)
    }

    pub fn describe(&self) {
        info!(
            "solver: {:?} problem, {:?} method, {:?} transform",
            self.problem_type, self.method, self.spectral_transform
        );
        info!(
            "solver: target {} ({:?}), nev = {}, tolerance = {:e}",
            self.target, self.which, self.nev, self.tolerance
        );
    }
}

fn string_field<'a>(section: &'a JsonValue, key: &str) -> Result<&'a str, ModeError> {
    section[key]
        .as_str()
        .ok_or_else(|| ModeError::Input(format!("Bad value for {key} in solver section")))
}

/// Parses a complex number encoded as `[re, im]` or as a bare real number
pub fn parse_complex(value: &JsonValue, what: &str) -> Result<Complex64, ModeError> {
    if let Some(re) = value.as_f64() {
        return Ok(Complex64::new(re, 0.0));
    }
    if value.is_array() && value.len() == 2 {
        if let (Some(re), Some(im)) = (value[0].as_f64(), value[1].as_f64()) {
            return Ok(Complex64::new(re, im));
        }
    }
    Err(ModeError::Input(format!(
        "Expected a number or [re, im] pair for {what}"
    )))
}

/// Read-only view of a finished generalized eigensolve
pub trait EigenSolver {
    fn num_converged(&self) -> usize;

    fn eigenvalue(&self, index: usize) -> Result<Complex64, ModeError>;

    /// Copies eigenvector `index` into `buffer`, which must be `vector_len()` long
    fn eigenvector(&self, index: usize, buffer: &mut [Complex64]) -> Result<(), ModeError>;

    fn relative_error(&self, index: usize) -> Result<f64, ModeError>;

    fn vector_len(&self) -> usize;

    /// Number of leading dofs that belong to the transverse field
    fn transverse_dofs(&self) -> usize;
}

struct RecordedPair {
    eigenvalue: Complex64,
    error: f64,
    vector: Vec<Complex64>,
}

/// Eigenpairs dumped by an external solve
pub struct RecordedSolver {
    pairs: Vec<RecordedPair>,
    vector_len: usize,
    transverse_dofs: usize,
}

impl RecordedSolver {
    /// Loads the eigenpairs produced by an external solve that ran with `config`
    ///
    /// # Arguments
    /// * `eigenpairs_file` - Path to the json dump of the solve
    /// * `config` - The configuration the solve ran with
    pub fn solve(eigenpairs_file: &str, config: &SolverConfig) -> Result<RecordedSolver, ModeError> {
        config.describe();

        let contents = std::fs::read_to_string(eigenpairs_file).map_err(|err| {
            ModeError::Input(format!(
                "Unable to open eigenpairs file {eigenpairs_file}: {err}"
            ))
        })?;
        let dump = json::parse(&contents)
            .map_err(|err| ModeError::Input(format!("Error in eigenpairs json: {err}")))?;

        let solver = RecordedSolver::from_json(&dump)?;

        info!(
            "loaded {} converged eigenpairs of length {}",
            solver.num_converged(),
            solver.vector_len()
        );
        if solver.num_converged() < config.nev {
            warn!(
                "solver converged {} eigenpairs, {} were requested",
                solver.num_converged(),
                config.nev
            );
        }

        Ok(solver)
    }

    pub fn from_json(dump: &JsonValue) -> Result<RecordedSolver, ModeError> {
        if !dump.has_key("eigenpairs") || !dump["eigenpairs"].is_array() {
            return Err(ModeError::Solver(
                "Eigenpairs json missing eigenpairs array".to_owned(),
            ));
        }

        let mut pairs: Vec<RecordedPair> = Vec::with_capacity(dump["eigenpairs"].len());
        for (i, pair) in dump["eigenpairs"].members().enumerate() {
            let eigenvalue = parse_complex(&pair["eigenvalue"], &format!("eigenvalue {i}"))
                .map_err(|err| ModeError::Solver(err.to_string()))?;
            let error = pair["error"]
                .as_f64()
                .ok_or_else(|| ModeError::Solver(format!("Eigenpair {i} is missing error")))?;

            if !pair["vector"].is_array() {
                return Err(ModeError::Solver(format!(
                    "Eigenpair {i} is missing vector"
                )));
            }
            let vector = pair["vector"]
                .members()
                .enumerate()
                .map(|(j, v)| {
                    parse_complex(v, &format!("vector {i} entry {j}"))
                        .map_err(|err| ModeError::Solver(err.to_string()))
                })
                .collect::<Result<Vec<Complex64>, ModeError>>()?;

            pairs.push(RecordedPair {
                eigenvalue,
                error,
                vector,
            });
        }

        let vector_len = pairs.first().map(|p| p.vector.len()).unwrap_or(0);
        if let Some((i, _)) = pairs
            .iter()
            .enumerate()
            .find(|(_, p)| p.vector.len() != vector_len)
        {
            return Err(ModeError::Solver(format!(
                "Eigenvector {i} has a different length than eigenvector 0"
            )));
        }

        let transverse_dofs = match dump["transverse_dofs"].as_usize() {
            Some(n) => n,
            None => {
                return Err(ModeError::Solver(
                    "Eigenpairs json missing transverse_dofs".to_owned(),
                ))
            }
        };
        if !pairs.is_empty() && transverse_dofs > vector_len {
            return Err(ModeError::Solver(format!(
                "transverse_dofs ({transverse_dofs}) exceeds vector length ({vector_len})"
            )));
        }

        debug!("parsed {} eigenpairs from dump", pairs.len());

        Ok(RecordedSolver {
            pairs,
            vector_len,
            transverse_dofs,
        })
    }

    fn pair(&self, index: usize) -> Result<&RecordedPair, ModeError> {
        self.pairs.get(index).ok_or_else(|| {
            ModeError::Solver(format!(
                "Eigenpair index {index} out of range ({} converged)",
                self.pairs.len()
            ))
        })
    }
}

impl EigenSolver for RecordedSolver {
    fn num_converged(&self) -> usize {
        self.pairs.len()
    }

    fn eigenvalue(&self, index: usize) -> Result<Complex64, ModeError> {
        Ok(self.pair(index)?.eigenvalue)
    }

    fn eigenvector(&self, index: usize, buffer: &mut [Complex64]) -> Result<(), ModeError> {
        let pair = self.pair(index)?;
        if buffer.len() != pair.vector.len() {
            return Err(ModeError::Solver(format!(
                "Eigenvector buffer has length {}, expected {}",
                buffer.len(),
                pair.vector.len()
            )));
        }
        buffer.copy_from_slice(&pair.vector);
        Ok(())
    }

    fn relative_error(&self, index: usize) -> Result<f64, ModeError> {
        Ok(self.pair(index)?.error)
    }

    fn vector_len(&self) -> usize {
        self.vector_len
    }

    fn transverse_dofs(&self) -> usize {
        self.transverse_dofs
    }
}

/// Queries every converged eigenpair of the solver
///
/// # Returns
/// One candidate per converged index, in solver order
pub fn collect_candidates<S: EigenSolver>(solver: &S) -> Result<Vec<Candidate>, ModeError> {
    (0..solver.num_converged())
        .map(|index| {
            Ok(Candidate {
                index,
                eigenvalue: solver.eigenvalue(index)?,
                residual_error: solver.relative_error(index)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump() -> JsonValue {
        json::parse(
            r#"{
                "transverse_dofs": 2,
                "eigenpairs": [
                    { "eigenvalue": [-9.0, 0.0], "error": 1e-12,
                      "vector": [[1.0, 0.0], [0.0, 1.0], [0.5, 0.0]] },
                    { "eigenvalue": -4.0, "error": 1e-3,
                      "vector": [[0.0, 0.0], [2.0, 0.0], [0.0, -1.0]] }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn recorded_solver_exposes_dumped_pairs() {
        let solver = RecordedSolver::from_json(&dump()).unwrap();

        assert_eq!(solver.num_converged(), 2);
        assert_eq!(solver.vector_len(), 3);
        assert_eq!(solver.transverse_dofs(), 2);
        assert_eq!(solver.eigenvalue(1).unwrap(), Complex64::new(-4.0, 0.0));
        assert_eq!(solver.relative_error(0).unwrap(), 1e-12);

        let mut buffer = vec![Complex64::default(); 3];
        solver.eigenvector(0, &mut buffer).unwrap();
        assert_eq!(buffer[1], Complex64::new(0.0, 1.0));
    }

    #[test]
    fn recorded_solver_rejects_bad_access() {
        let solver = RecordedSolver::from_json(&dump()).unwrap();

        assert!(matches!(solver.eigenvalue(2), Err(ModeError::Solver(_))));
        let mut short = vec![Complex64::default(); 2];
        assert!(matches!(
            solver.eigenvector(0, &mut short),
            Err(ModeError::Solver(_))
        ));
    }

    #[test]
    fn recorded_solver_rejects_ragged_vectors() {
        let dump = json::parse(
            r#"{ "transverse_dofs": 1, "eigenpairs": [
                { "eigenvalue": [-1.0, 0.0], "error": 0.0, "vector": [[1.0, 0.0]] },
                { "eigenvalue": [-2.0, 0.0], "error": 0.0, "vector": [[1.0, 0.0], [0.0, 0.0]] }
            ] }"#,
        )
        .unwrap();
        assert!(RecordedSolver::from_json(&dump).is_err());
    }

    #[test]
    fn recorded_solver_rejects_oversized_split() {
        let dump = json::parse(
            r#"{ "transverse_dofs": 4, "eigenpairs": [
                { "eigenvalue": [-1.0, 0.0], "error": 0.0, "vector": [[1.0, 0.0]] }
            ] }"#,
        )
        .unwrap();
        assert!(RecordedSolver::from_json(&dump).is_err());
    }

    #[test]
    fn collect_candidates_keeps_solver_order() {
        let solver = RecordedSolver::from_json(&dump()).unwrap();
        let candidates = collect_candidates(&solver).unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].index, 0);
        assert_eq!(candidates[1].index, 1);
        assert_eq!(candidates[1].residual_error, 1e-3);
    }

    #[test]
    fn solver_config_defaults_follow_wavenumber() {
        let config = SolverConfig::from_json(&JsonValue::Null, 2.0).unwrap();

        assert_eq!(config.problem_type, ProblemType::Gnhep);
        assert_eq!(config.method, Method::KrylovSchur);
        assert_eq!(config.spectral_transform, SpectralTransform::ShiftInvert);
        assert_eq!(config.which, Which::TargetReal);
        assert_eq!(config.target, Complex64::new(-1.0, 0.0));
        assert_eq!(config.tolerance, DEFAULT_TOLERANCE);
        assert_eq!(config.nev, DEFAULT_NEV);
    }

    #[test]
    fn solver_config_reads_overrides() {
        let section = json::parse(
            r#"{ "problem_type": "GHEP", "method": "arnoldi", "spectral_transform": "shift",
                 "which": "target_magnitude", "target": [-3.0, 0.5], "tolerance": 1e-6, "nev": 4 }"#,
        )
        .unwrap();
        let config = SolverConfig::from_json(&section, 1.0).unwrap();

        assert_eq!(config.problem_type, ProblemType::Ghep);
        assert_eq!(config.method, Method::Arnoldi);
        assert_eq!(config.spectral_transform, SpectralTransform::Shift);
        assert_eq!(config.which, Which::TargetMagnitude);
        assert_eq!(config.target, Complex64::new(-3.0, 0.5));
        assert_eq!(config.tolerance, 1e-6);
        assert_eq!(config.nev, 4);
    }

    #[test]
    fn solver_config_rejects_unknown_method_and_bad_tolerance() {
        let section = json::parse(r#"{ "method": "jacobi-davidson" }"#).unwrap();
        assert!(SolverConfig::from_json(&section, 1.0).is_err());

        let section = json::parse(r#"{ "tolerance": 0.0 }"#).unwrap();
        assert!(SolverConfig::from_json(&section, 1.0).is_err());
    }
}
