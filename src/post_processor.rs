use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use indicatif::ProgressBar;
use log::info;
use nalgebra::DVector;
use num_complex::Complex64;

use crate::{
    datatypes::{ModalField, SelectedMode, Vertex},
    error::ModeError,
    solver::EigenSolver,
};

fn create_output(path: &Path) -> Result<BufWriter<File>, ModeError> {
    match File::create(path) {
        Ok(f) => Ok(BufWriter::new(f)),
        Err(err) => Err(ModeError::PostProcessor(format!(
            "Failed to create {}: {err}",
            path.display()
        ))),
    }
}

fn write_error(path: &Path) -> impl Fn(std::io::Error) -> ModeError + '_ {
    move |err| {
        ModeError::PostProcessor(format!("Failed to write {}: {err}", path.display()))
    }
}

/// Splits a mixed-space eigenvector into its transverse and axial dofs
///
/// # Arguments
/// * `buffer` - The full eigenvector
/// * `transverse_dofs` - Number of leading dofs in the transverse space
pub fn split_eigenvector(
    buffer: &[Complex64],
    transverse_dofs: usize,
) -> Result<ModalField, ModeError> {
    if transverse_dofs > buffer.len() {
        return Err(ModeError::PostProcessor(format!(
            "Cannot split {} dofs after {transverse_dofs} transverse dofs",
            buffer.len()
        )));
    }
    let (transverse, axial) = buffer.split_at(transverse_dofs);

    Ok(ModalField {
        transverse: DVector::from_column_slice(transverse),
        axial: DVector::from_column_slice(axial),
    })
}

/// Recovers the physical fields from an eigenvector
///
/// The eigenproblem is posed for `e_t = kz E_t` and `e_z = -j E_z`, so the
/// transverse part is divided by `kz` and the axial part multiplied by `j`.
///
/// # Arguments
/// * `field` - The split eigenvector
/// * `kz` - The propagation constant of the mode
///
/// # Returns
/// The scaled `(E_t, E_z)` field
pub fn scale_fields(field: &ModalField, kz: Complex64) -> Result<ModalField, ModeError> {
    if kz.norm() == 0.0 || !kz.is_finite() {
        return Err(ModeError::PostProcessor(format!(
            "Cannot rescale the transverse field by kz = {kz}"
        )));
    }

    Ok(ModalField {
        transverse: field.transverse.map(|e| e / kz),
        axial: field.axial.map(|e| e * Complex64::i()),
    })
}

/// Writes one component of a field as `dof,component,re,im`
pub fn field_csv_output(
    values: &DVector<Complex64>,
    component: &str,
    path: &Path,
) -> Result<(), ModeError> {
    let mut file = create_output(path)?;
    let on_error = write_error(path);

    writeln!(file, "dof,component,re,im").map_err(&on_error)?;
    for (dof, value) in values.iter().enumerate() {
        writeln!(file, "{dof},{component},{},{}", value.re, value.im).map_err(&on_error)?;
    }
    file.flush().map_err(&on_error)?;

    Ok(())
}

/// Writes the summary of the verified modes
///
/// # Arguments
/// * `modes` - The selected and verified modes, in output order
/// * `k0` - Free-space wavenumber
/// * `path` - The output csv path
pub fn modes_csv_output(modes: &[SelectedMode], k0: f64, path: &Path) -> Result<(), ModeError> {
    let mut file = create_output(path)?;
    let on_error = write_error(path);

    writeln!(
        file,
        "index,eigenvalue_re,eigenvalue_im,kz_re,kz_im,kz_over_k0,error"
    )
    .map_err(&on_error)?;
    for mode in modes {
        let eigenvalue = -(mode.kz * mode.kz);
        writeln!(
            file,
            "{},{},{},{},{},{},{:e}",
            mode.index,
            eigenvalue.re,
            eigenvalue.im,
            mode.kz.re,
            mode.kz.im,
            mode.kz.re / k0,
            mode.residual_error
        )
        .map_err(&on_error)?;
    }
    file.flush().map_err(&on_error)?;

    info!("wrote {} modes to {}", modes.len(), path.display());
    Ok(())
}

/// Writes the cell-wise permittivity as `cell,x,y,eps` at cell centroids
pub fn permittivity_csv_output(
    vertices: &[Vertex],
    cells: &[[usize; 4]],
    permittivity: &[f64],
    path: &Path,
) -> Result<(), ModeError> {
    let mut file = create_output(path)?;
    let on_error = write_error(path);

    writeln!(file, "cell,x,y,eps").map_err(&on_error)?;
    for (i, (cell, eps)) in std::iter::zip(cells, permittivity).enumerate() {
        let x = cell.iter().map(|&v| vertices[v].x).sum::<f64>() / 4.0;
        let y = cell.iter().map(|&v| vertices[v].y).sum::<f64>() / 4.0;
        writeln!(file, "{i},{x},{y},{eps}").map_err(&on_error)?;
    }
    file.flush().map_err(&on_error)?;

    info!("wrote permittivity of {} cells to {}", cells.len(), path.display());
    Ok(())
}

/// Reads, rescales and writes the fields of every verified mode
///
/// # Arguments
/// * `solver` - The finished eigensolve; only read from
/// * `modes` - The verified modes
/// * `output_dir` - Directory for the `Et_{i}.csv` and `Ez_{i}.csv` files
pub fn export_modes<S: EigenSolver>(
    solver: &S,
    modes: &[SelectedMode],
    output_dir: &Path,
) -> Result<(), ModeError> {
    let mut buffer = vec![Complex64::default(); solver.vector_len()];

    let bar = ProgressBar::new(modes.len() as u64);
    for mode in modes {
        solver.eigenvector(mode.index, &mut buffer)?;

        let field = split_eigenvector(&buffer, solver.transverse_dofs())?;
        let scaled = scale_fields(&field, mode.kz)?;

        field_csv_output(
            &scaled.transverse,
            "Et",
            &output_dir.join(format!("Et_{}.csv", mode.index)),
        )?;
        field_csv_output(
            &scaled.axial,
            "Ez",
            &output_dir.join(format!("Ez_{}.csv", mode.index)),
        )?;

        bar.inc(1);
    }
    bar.finish_and_clear();

    info!(
        "exported fields of {} modes to {}",
        modes.len(),
        output_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::RecordedSolver;

    fn field() -> ModalField {
        split_eigenvector(
            &[
                Complex64::new(2.0, 0.0),
                Complex64::new(0.0, 4.0),
                Complex64::new(1.0, -1.0),
            ],
            2,
        )
        .unwrap()
    }

    #[test]
    fn split_keeps_transverse_dofs_first() {
        let field = field();
        assert_eq!(field.transverse.len(), 2);
        assert_eq!(field.axial.len(), 1);
        assert_eq!(field.axial[0], Complex64::new(1.0, -1.0));
    }

    #[test]
    fn split_rejects_oversized_transverse_space() {
        assert!(split_eigenvector(&[Complex64::default()], 2).is_err());
    }

    #[test]
    fn scaling_undoes_eigenproblem_substitution() {
        let scaled = scale_fields(&field(), Complex64::new(2.0, 0.0)).unwrap();

        assert_eq!(scaled.transverse[0], Complex64::new(1.0, 0.0));
        assert_eq!(scaled.transverse[1], Complex64::new(0.0, 2.0));
        // (1 - j) * j = 1 + j
        assert_eq!(scaled.axial[0], Complex64::new(1.0, 1.0));
    }

    #[test]
    fn scaling_by_zero_kz_is_an_error() {
        assert!(matches!(
            scale_fields(&field(), Complex64::new(0.0, 0.0)),
            Err(ModeError::PostProcessor(_))
        ));
    }

    #[test]
    fn modes_csv_lists_every_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modes.csv");
        let modes = [
            SelectedMode {
                index: 3,
                kz: Complex64::new(1.0, 0.0),
                residual_error: 1e-12,
            },
            SelectedMode {
                index: 0,
                kz: Complex64::new(2.0, 0.0),
                residual_error: 0.0,
            },
        ];
        modes_csv_output(&modes, 2.0, &path).unwrap();

        let table = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("3,-1,"));
        assert!(lines[2].starts_with("0,-4,"));
    }

    #[test]
    fn export_writes_scaled_fields() {
        let dir = tempfile::tempdir().unwrap();
        let dump = json::parse(
            r#"{ "transverse_dofs": 1, "eigenpairs": [
                { "eigenvalue": [-4.0, 0.0], "error": 0.0, "vector": [[2.0, 0.0], [1.0, 0.0]] }
            ] }"#,
        )
        .unwrap();
        let solver = RecordedSolver::from_json(&dump).unwrap();
        let modes = [SelectedMode {
            index: 0,
            kz: Complex64::new(2.0, 0.0),
            residual_error: 0.0,
        }];

        export_modes(&solver, &modes, dir.path()).unwrap();

        let et = std::fs::read_to_string(dir.path().join("Et_0.csv")).unwrap();
        let ez = std::fs::read_to_string(dir.path().join("Ez_0.csv")).unwrap();
        assert_eq!(et.lines().nth(1), Some("0,Et,1,0"));
        assert_eq!(ez.lines().nth(1), Some("0,Ez,0,1"));
    }
}
