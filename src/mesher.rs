use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use json::JsonValue;
use log::{info, warn};

use crate::{
    datatypes::{Materials, MeshResolution, ModelMetadata, Vertex, WaveguideGeometry},
    error::ModeError,
    post_processor,
    solver::SolverConfig,
};

pub const DEFAULT_THRESHOLD: f64 = 1e-4;
/// Default ratio between the guide height and the free-space wavelength
pub const DEFAULT_HEIGHT_PER_WAVELENGTH: f64 = 0.2;

pub const PHYSICAL_DIELECTRIC: usize = 1;
pub const PHYSICAL_VACUUM: usize = 2;
pub const PHYSICAL_WALL: usize = 3;

/// Parses the input json into a JsonValue object
///
/// # Arguments
/// * `input_file` - The path to the input file
///
/// # Returns
/// A JsonValue object
pub fn load_input_file(input_file: &str) -> Result<JsonValue, ModeError> {
    let file_string = match std::fs::read_to_string(input_file) {
        Ok(f) => f,
        Err(_err) => {
            return Err(ModeError::Input(format!(
                "Unable to open input file {}",
                input_file
            )))
        }
    };

    let input_file_json = match json::parse(&file_string) {
        Ok(f) => f,
        Err(err) => return Err(ModeError::Input(format!("Error in input file json: {err}"))),
    };

    for section in ["geometry", "materials", "mesh"] {
        if !input_file_json.has_key(section) {
            return Err(ModeError::Input(format!(
                "Input json missing {section} field"
            )));
        }
    }

    Ok(input_file_json)
}

fn required_f64(input_json: &JsonValue, section: &str, key: &str) -> Result<f64, ModeError> {
    if !input_json[section].has_key(key) {
        return Err(ModeError::Input(format!(
            "Input json missing {key} field in {section} section"
        )));
    }
    input_json[section][key]
        .as_f64()
        .ok_or_else(|| ModeError::Input(format!("Bad value for {key} in {section} section")))
}

fn required_usize(input_json: &JsonValue, section: &str, key: &str) -> Result<usize, ModeError> {
    if !input_json[section].has_key(key) {
        return Err(ModeError::Input(format!(
            "Input json missing {key} field in {section} section"
        )));
    }
    input_json[section][key]
        .as_usize()
        .ok_or_else(|| ModeError::Input(format!("Bad value for {key} in {section} section")))
}

/// Parses Model Metadata from the input_json
///
/// # Arguments
/// * `input_json`: The input file as a JsonValue object
///
/// # Returns
/// A validated ModelMetadata instance
pub fn parse_input_metadata(input_json: &JsonValue) -> Result<ModelMetadata, ModeError> {
    let geometry = WaveguideGeometry {
        width: required_f64(input_json, "geometry", "width")?,
        height: required_f64(input_json, "geometry", "height")?,
        depth: required_f64(input_json, "geometry", "depth")?,
    };
    let materials = Materials {
        eps_dielectric: required_f64(input_json, "materials", "eps_dielectric")?,
        eps_vacuum: required_f64(input_json, "materials", "eps_vacuum")?,
    };
    let resolution = MeshResolution {
        nx: required_usize(input_json, "mesh", "nx")?,
        ny: required_usize(input_json, "mesh", "ny")?,
    };

    if !(geometry.width > 0.0 && geometry.height > 0.0) {
        return Err(ModeError::Input(
            "Waveguide width and height must be positive".to_owned(),
        ));
    }
    if !(geometry.depth > 0.0 && geometry.depth < geometry.height) {
        return Err(ModeError::Input(
            "Interface depth must lie strictly between 0 and the height".to_owned(),
        ));
    }
    if !(materials.eps_dielectric > 0.0 && materials.eps_vacuum > 0.0) {
        return Err(ModeError::Input(
            "Permittivities must be positive".to_owned(),
        ));
    }
    if resolution.nx == 0 || resolution.ny < 2 {
        return Err(ModeError::Input(
            "Mesh needs at least one column and two rows, one per region".to_owned(),
        ));
    }

    let wavelength = if input_json.has_key("wavelength") {
        input_json["wavelength"]
            .as_f64()
            .ok_or_else(|| ModeError::Input("Bad value for wavelength".to_owned()))?
    } else {
        geometry.height / DEFAULT_HEIGHT_PER_WAVELENGTH
    };
    if !(wavelength > 0.0) {
        return Err(ModeError::Input("Wavelength must be positive".to_owned()));
    }

    let k0 = 2.0 * std::f64::consts::PI / wavelength;
    let solver = SolverConfig::from_json(&input_json["solver"], k0)?;

    if input_json.has_key("verification") && !input_json["verification"].is_object() {
        return Err(ModeError::Input(
            "Input json verification field must be an object".to_owned(),
        ));
    }
    let threshold = if input_json["verification"].has_key("threshold") {
        input_json["verification"]["threshold"]
            .as_f64()
            .ok_or_else(|| ModeError::Input("Bad value for verification threshold".to_owned()))?
    } else {
        DEFAULT_THRESHOLD
    };
    if !(threshold > 0.0) {
        return Err(ModeError::Input(
            "Verification threshold must be positive".to_owned(),
        ));
    }

    Ok(ModelMetadata {
        geometry,
        materials,
        wavelength,
        resolution,
        solver,
        threshold,
    })
}

/// Builds a structured quadrilateral mesh of the cross-section
///
/// # Arguments
/// * `geometry` - The waveguide cross-section
/// * `resolution` - Number of cells along x and y
///
/// # Returns
/// The row-major vertices and the counter-clockwise cell connectivity
pub fn build_mesh(
    geometry: &WaveguideGeometry,
    resolution: &MeshResolution,
) -> (Vec<Vertex>, Vec<[usize; 4]>) {
    let MeshResolution { nx, ny } = *resolution;
    let dx = geometry.width / nx as f64;
    let dy = geometry.height / ny as f64;

    let vertices: Vec<Vertex> = (0..=ny)
        .flat_map(|j| {
            (0..=nx).map(move |i| Vertex {
                x: i as f64 * dx,
                y: j as f64 * dy,
            })
        })
        .collect();

    let row = nx + 1;
    let cells: Vec<[usize; 4]> = (0..ny)
        .flat_map(|j| {
            (0..nx).map(move |i| {
                let v0 = j * row + i;
                [v0, v0 + 1, v0 + row + 1, v0 + row]
            })
        })
        .collect();

    (vertices, cells)
}

/// Cell-wise constant permittivity. Cells whose centroid lies at or below the
/// interface are dielectric.
pub fn assign_permittivity(
    vertices: &[Vertex],
    cells: &[[usize; 4]],
    geometry: &WaveguideGeometry,
    materials: &Materials,
) -> Vec<f64> {
    cells
        .iter()
        .map(|cell| {
            let centroid_y = cell.iter().map(|&v| vertices[v].y).sum::<f64>() / 4.0;
            if centroid_y <= geometry.depth {
                materials.eps_dielectric
            } else {
                materials.eps_vacuum
            }
        })
        .collect()
}

/// Writes a gmsh .geo script for the two stacked regions of the guide
///
/// # Arguments
/// * `geometry` - The waveguide cross-section
/// * `resolution` - Number of cells along x and y
/// * `output_file` - The output .geo file
pub fn build_geo(
    geometry: &WaveguideGeometry,
    resolution: &MeshResolution,
    output_file: &Path,
) -> Result<(), ModeError> {
    if resolution.ny < 2 {
        return Err(ModeError::Mesher(format!(
            "Cannot split {} row(s) between the dielectric and vacuum regions",
            resolution.ny
        )));
    }

    let file = File::create(output_file).map_err(|err| {
        ModeError::Mesher(format!(
            "Failed to create {}: {err}",
            output_file.display()
        ))
    })?;
    let mut geo_file = BufWriter::new(file);

    let WaveguideGeometry {
        width: w,
        height: h,
        depth: d,
    } = *geometry;

    // Cells below the interface, proportional to the dielectric height
    let ny_d = ((resolution.ny as f64 * d / h).round() as usize).clamp(1, resolution.ny - 1);
    let ny_v = resolution.ny - ny_d;

    let script = format!(
        "// Half-loaded rectangular waveguide\n\
        w = {w};\n\
        h = {h};\n\
        d = {d};\n\
        \n\
        // Define points\n\
        Point(1) = {{ 0, 0, 0, 1.0 }};\n\
        Point(2) = {{ w, 0, 0, 1.0 }};\n\
        Point(3) = {{ w, d, 0, 1.0 }};\n\
        Point(4) = {{ 0, d, 0, 1.0 }};\n\
        Point(5) = {{ w, h, 0, 1.0 }};\n\
        Point(6) = {{ 0, h, 0, 1.0 }};\n\
        \n\
        // Connect points, line 3 is the interface\n\
        Line(1) = {{ 1, 2 }};\n\
        Line(2) = {{ 2, 3 }};\n\
        Line(3) = {{ 3, 4 }};\n\
        Line(4) = {{ 4, 1 }};\n\
        Line(5) = {{ 3, 5 }};\n\
        Line(6) = {{ 5, 6 }};\n\
        Line(7) = {{ 6, 4 }};\n\
        \n\
        // Register loops\n\
        Line Loop(1) = {{ 1, 2, 3, 4 }};\n\
        Line Loop(2) = {{ -3, 5, 6, 7 }};\n\
        Plane Surface(1) = {{ 1 }};\n\
        Plane Surface(2) = {{ 2 }};\n\
        \n\
        // Physical groups\n\
        Physical Surface(\"dielectric\", {dielectric}) = {{ 1 }};\n\
        Physical Surface(\"vacuum\", {vacuum}) = {{ 2 }};\n\
        Physical Curve(\"wall\", {wall}) = {{ 1, 2, 4, 5, 6, 7 }};\n\
        \n\
        // Define Mesh Settings\n\
        Transfinite Curve {{ 1, 3, 6 }} = {nx_nodes};\n\
        Transfinite Curve {{ 2, 4 }} = {ny_d_nodes};\n\
        Transfinite Curve {{ 5, 7 }} = {ny_v_nodes};\n\
        Transfinite Surface {{ 1, 2 }};\n\
        Recombine Surface {{ 1, 2 }};\n\
        Mesh.ElementOrder = 1;\n\
        Mesh 2;\n",
        dielectric = PHYSICAL_DIELECTRIC,
        vacuum = PHYSICAL_VACUUM,
        wall = PHYSICAL_WALL,
        nx_nodes = resolution.nx + 1,
        ny_d_nodes = ny_d + 1,
        ny_v_nodes = ny_v + 1,
    );

    geo_file
        .write_all(script.as_bytes())
        .and_then(|_| geo_file.flush())
        .map_err(|err| ModeError::Mesher(format!("Failed to write .geo file: {err}")))?;

    Ok(())
}

/// Runs Gmsh on a .geo script
///
/// # Arguments
/// * `geo_file` - The input .geo script
/// * `output` - The output filepath of the .msh file
pub fn compute_mesh(geo_file: &Path, output: &Path) -> Result<(), ModeError> {
    info!("running gmsh...");
    let out = match std::process::Command::new("gmsh")
        .arg(geo_file)
        .arg("-2")
        .arg("-o")
        .arg(output)
        .output()
    {
        Ok(out) => out,
        Err(err) => return Err(ModeError::Mesher(format!("Gmsh failed: {err}"))),
    };

    if !out.status.success() {
        return Err(ModeError::Mesher(format!(
            "Gmsh exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    info!("wrote mesh to {}", output.display());
    Ok(())
}

/// Runs the geometry stage
///
/// # Arguments
/// * `input_file` - The input file that describes the guide
/// * `output_dir` - Directory for the permittivity table and the .geo script
/// * `invoke_gmsh` - Also mesh the .geo script with gmsh
pub fn run(input_file: &str, output_dir: &Path, invoke_gmsh: bool) -> Result<ModelMetadata, ModeError> {
    let input_file_json = load_input_file(input_file)?;
    let model_metadata = parse_input_metadata(&input_file_json)?;

    std::fs::create_dir_all(output_dir).map_err(|err| {
        ModeError::Mesher(format!(
            "Unable to create output directory {}: {err}",
            output_dir.display()
        ))
    })?;

    let (vertices, cells) = build_mesh(&model_metadata.geometry, &model_metadata.resolution);
    let permittivity = assign_permittivity(
        &vertices,
        &cells,
        &model_metadata.geometry,
        &model_metadata.materials,
    );
    info!(
        "built {} vertices and {} cells, {} in the dielectric",
        vertices.len(),
        cells.len(),
        permittivity
            .iter()
            .filter(|&&eps| eps == model_metadata.materials.eps_dielectric)
            .count()
    );

    let interface_row = model_metadata.geometry.depth / model_metadata.geometry.height
        * model_metadata.resolution.ny as f64;
    if (interface_row - interface_row.round()).abs() > 1e-9 {
        warn!("interface depth does not fall on a mesh row; straddling cells follow their centroid");
    }

    post_processor::permittivity_csv_output(
        &vertices,
        &cells,
        &permittivity,
        &output_dir.join("permittivity.csv"),
    )?;

    let geo_path = output_dir.join("waveguide.geo");
    build_geo(
        &model_metadata.geometry,
        &model_metadata.resolution,
        &geo_path,
    )?;
    info!("wrote gmsh script to {}", geo_path.display());

    if invoke_gmsh {
        compute_mesh(&geo_path, &output_dir.join("waveguide.msh"))?;
    }

    Ok(model_metadata)
}
