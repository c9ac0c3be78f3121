use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};

use crate::{
    analytical::ModeFamily,
    datatypes::{ModelMetadata, SelectedMode},
    error::ModeError,
    solver::{EigenSolver, RecordedSolver},
};

mod analytical;
mod datatypes;
mod error;
mod mesher;
mod post_processor;
mod selector;
mod solver;

/// Scan intervals used when searching the analytical dispersion relations
const ANALYTIC_SAMPLES: usize = 2000;

#[derive(Parser, Debug)]
#[command(
    name = "wgmodes",
    about = "Mode analysis of a half-loaded rectangular waveguide"
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the permittivity table and the gmsh script for the guide
    Geometry {
        /// Path to the JSON input file
        input: PathBuf,
        #[arg(short, long, default_value = "mesh")]
        output_dir: PathBuf,
        /// Also run gmsh on the generated script
        #[arg(long)]
        gmsh: bool,
    },
    /// Select, verify and export the modes of a finished eigensolve
    Analyze {
        /// Path to the JSON input file
        input: PathBuf,
        /// Path to the JSON dump of the eigenpairs
        eigenpairs: PathBuf,
        #[arg(short, long, default_value = "sols")]
        output_dir: PathBuf,
    },
    /// List the analytical modes and matching spectral targets
    Analytic {
        /// Path to the JSON input file
        input: PathBuf,
    },
}

fn path_str(path: &Path) -> Result<&str, ModeError> {
    path.to_str().ok_or_else(|| {
        ModeError::Input(format!("Path {} is not valid UTF-8", path.display()))
    })
}

fn load_metadata(input: &Path) -> Result<ModelMetadata, ModeError> {
    let input_json = mesher::load_input_file(path_str(input)?)?;
    mesher::parse_input_metadata(&input_json)
}

/// Selects the propagating modes and checks each against the dispersion
/// relation
///
/// # Arguments
/// * `solver` - The finished eigensolve
/// * `model_metadata` - The model metadata
///
/// # Returns
/// The verified modes ordered by `real(kz)`. Fails on the first mode the
/// analytical model does not confirm.
fn verified_modes<S: EigenSolver>(
    solver: &S,
    model_metadata: &ModelMetadata,
) -> Result<Vec<SelectedMode>, ModeError> {
    let candidates = solver::collect_candidates(solver)?;
    let modes = selector::select_modes(&candidates, model_metadata.solver.tolerance);
    info!(
        "{} of {} eigenpairs are propagating modes",
        modes.len(),
        candidates.len()
    );

    let k0 = model_metadata.k0();
    for mode in &modes {
        if !analytical::verify_mode(
            mode.kz,
            &model_metadata.geometry,
            model_metadata.wavelength,
            &model_metadata.materials,
            model_metadata.threshold,
        ) {
            return Err(ModeError::Verification(format!(
                "mode {} with kz = {} misses the dispersion relation by {:e} (threshold {:e})",
                mode.index,
                mode.kz,
                analytical::discrepancy(
                    mode.kz,
                    &model_metadata.geometry,
                    model_metadata.wavelength,
                    &model_metadata.materials,
                ),
                model_metadata.threshold
            )));
        }

        info!("mode {}: eigenvalue {}", mode.index, -(mode.kz * mode.kz));
        info!("mode {}: kz {}", mode.index, mode.kz);
        info!("mode {}: kz/k0 {}", mode.index, mode.kz / k0);
    }

    Ok(modes)
}

/// Largest analytical propagation constant over both mode families
fn analytical_fundamental(model_metadata: &ModelMetadata) -> Result<Option<f64>, ModeError> {
    let mut fundamental: Option<f64> = None;
    for family in [ModeFamily::Lsm, ModeFamily::Lse] {
        let modes = analytical::find_modes(
            &model_metadata.geometry,
            model_metadata.wavelength,
            &model_metadata.materials,
            family,
            ANALYTIC_SAMPLES,
        )?;
        if let Some(mode) = modes.first() {
            fundamental = Some(fundamental.map_or(mode.kz, |kz| kz.max(mode.kz)));
        }
    }
    Ok(fundamental)
}

fn analyze(input: &Path, eigenpairs: &Path, output_dir: &Path) -> Result<(), ModeError> {
    let model_metadata = load_metadata(input)?;
    let solver = RecordedSolver::solve(path_str(eigenpairs)?, &model_metadata.solver)?;

    let modes = verified_modes(&solver, &model_metadata)?;

    if modes.is_empty() {
        warn!("no propagating mode found near target {}", model_metadata.solver.target);
        if let Some(kz) = analytical_fundamental(&model_metadata)? {
            warn!(
                "the analytical fundamental mode has kz = {kz}; retry with target {}",
                analytical::suggested_target(kz)
            );
        }
        return Ok(());
    }

    std::fs::create_dir_all(output_dir).map_err(|err| {
        ModeError::PostProcessor(format!(
            "Unable to create output directory {}: {err}",
            output_dir.display()
        ))
    })?;

    post_processor::export_modes(&solver, &modes, output_dir)?;
    post_processor::modes_csv_output(&modes, model_metadata.k0(), &output_dir.join("modes.csv"))?;

    Ok(())
}

fn analytic(input: &Path) -> Result<(), ModeError> {
    let model_metadata = load_metadata(input)?;
    let k0 = model_metadata.k0();

    println!("family,kz,kz_over_k0,target");
    for family in [ModeFamily::Lsm, ModeFamily::Lse] {
        let modes = analytical::find_modes(
            &model_metadata.geometry,
            model_metadata.wavelength,
            &model_metadata.materials,
            family,
            ANALYTIC_SAMPLES,
        )?;
        info!("found {} {:?} modes", modes.len(), family);

        for mode in modes {
            println!(
                "{:?},{},{},{}",
                mode.family,
                mode.kz,
                mode.kz / k0,
                analytical::suggested_target(mode.kz)
            );
        }
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let result = match &cli.command {
        Command::Geometry {
            input,
            output_dir,
            gmsh,
        } => path_str(input).and_then(|input| mesher::run(input, output_dir, *gmsh).map(|_| ())),
        Command::Analyze {
            input,
            eigenpairs,
            output_dir,
        } => analyze(input, eigenpairs, output_dir),
        Command::Analytic { input } => analytic(input),
    };

    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }
}
