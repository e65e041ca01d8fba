//! Case files the engine reads from `config/`.
//!
//! Files are split by what they depend on: `meshDict` only changes with the geometry and the
//! mesh-affecting options, everything else is regenerated per job. Batch members that adopt a
//! donor's mesh only get the latter.

use crate::{
    job::{GroundType, JobConfig, Quality, Rotation},
    workspace::Workspace,
};
use std::{
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const SNAPSHOT_FILE: &str = "case.yaml";
pub const MESH_FILE: &str = "meshDict";
pub const CONTROL_FILE: &str = "controlDict";
pub const INFLOW_FILE: &str = "inflow";
pub const SOLVER_OPTIONS_FILE: &str = "solverOptions";

#[derive(Error, Debug)]
pub enum CaseError {
    #[error("Failed to write case file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize the case snapshot: {0}")]
    Snapshot(#[from] serde_yaml::Error),
}

/// Mesh resolution belonging to a quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshPreset {
    pub max_local_cells: u64,
    pub max_global_cells: u64,
    /// min and max surface refinement level
    pub surface_level: (u8, u8),
    /// background mesh cells in x, y, z
    pub background: (u32, u32, u32),
    pub cells_between_levels: u8,
}

impl MeshPreset {
    pub fn for_quality(quality: Quality) -> Self {
        match quality {
            Quality::Basic => Self {
                max_local_cells: 200_000,
                max_global_cells: 500_000,
                surface_level: (2, 3),
                background: (50, 25, 15),
                cells_between_levels: 2,
            },
            Quality::Standard => Self {
                max_local_cells: 500_000,
                max_global_cells: 2_000_000,
                surface_level: (3, 4),
                background: (70, 35, 25),
                cells_between_levels: 3,
            },
            Quality::Pro => Self {
                max_local_cells: 2_000_000,
                max_global_cells: 8_000_000,
                surface_level: (4, 5),
                background: (100, 50, 35),
                cells_between_levels: 3,
            },
        }
    }
}

fn write(path: PathBuf, content: &str) -> Result<PathBuf, CaseError> {
    fs::write(&path, content).map_err(|source| CaseError::Io {
        path: path.clone(),
        source,
    })?;
    debug!(path = ?path, "Wrote case file");

    Ok(path)
}

fn vector(v: [f64; 3]) -> String {
    format!("({:.6} {:.6} {:.6})", v[0], v[1], v[2])
}

fn geometry_name(config: &JobConfig) -> String {
    config
        .geometry
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("geometry.stl"))
}

/// Full configuration of the job, for humans and for re-querying
pub fn write_snapshot(workspace: &Workspace, config: &JobConfig) -> Result<PathBuf, CaseError> {
    let content = serde_yaml::to_string(config)?;
    write(workspace.config_dir().join(SNAPSHOT_FILE), &content)
}

/// Copy the geometry into the case and write the mesh-affecting dictionary
pub fn write_mesh_config(workspace: &Workspace, config: &JobConfig) -> Result<PathBuf, CaseError> {
    let geometry = workspace.config_dir().join(geometry_name(config));
    fs::copy(&config.geometry, &geometry).map_err(|source| CaseError::Io {
        path: geometry.clone(),
        source,
    })?;

    write(
        workspace.config_dir().join(MESH_FILE),
        &mesh_dict(config, &geometry),
    )
}

fn mesh_dict(config: &JobConfig, geometry: &Path) -> String {
    let preset = MeshPreset::for_quality(config.quality);
    let (min_level, max_level) = preset.surface_level;
    let (bx, by, bz) = preset.background;

    let mut dict = String::new();
    // writing into a String cannot fail
    let _ = write!(
        dict,
        "geometry {geometry};
background ({bx} {by} {bz});
maxLocalCells {};
maxGlobalCells {};
nCellsBetweenLevels {};
surfaceLevel ({min_level} {max_level});
wakeLevel {};
",
        preset.max_local_cells,
        preset.max_global_cells,
        preset.cells_between_levels,
        min_level.saturating_sub(1),
        geometry = geometry.display(),
    );

    let _ = writeln!(
        dict,
        "ground {{ enabled {}; type {}; }}",
        config.ground.enabled,
        match config.ground.kind {
            GroundType::Moving => "moving",
            GroundType::Slip => "slip",
        }
    );

    if config.rotation != Rotation::None {
        let _ = writeln!(
            dict,
            "rotatingZone {{ origin (0 0 {radius}); axis (0 1 0); radius {:.6}; }}",
            config.wheel_radius * 1.05,
            radius = config.wheel_radius,
        );
    }

    for region in config.regions.iter() {
        let _ = writeln!(dict, "region {region};");
    }

    dict
}

/// Write every file that depends on the per-job flow parameters
pub fn write_flow_config(
    workspace: &Workspace,
    config: &JobConfig,
) -> Result<Vec<PathBuf>, CaseError> {
    Ok(vec![
        write_snapshot(workspace, config)?,
        write(
            workspace.config_dir().join(CONTROL_FILE),
            &control_dict(config),
        )?,
        write(
            workspace.config_dir().join(INFLOW_FILE),
            &format!(
                "velocity {};\nspeed {};\nincidence {};\n",
                vector(config.inflow()),
                config.speed,
                config.incidence
            ),
        )?,
        write(
            workspace.config_dir().join(SOLVER_OPTIONS_FILE),
            &solver_options(config),
        )?,
    ])
}

fn force_function(dict: &mut String, name: &str, patches: &str, config: &JobConfig) {
    let _ = write!(
        dict,
        "{name}
{{
    patches ({patches});
    rhoInf {};
    CofR (0 0 0);
    dragDir {};
    liftDir {};
    sideDir {};
    pitchAxis (0 1 0);
    magUInf {};
    lRef {};
    Aref {};
}}
",
        config.air.density,
        vector(config.drag_axis()),
        vector(config.lift_axis()),
        vector(config.side_axis()),
        config.speed,
        config.reference_length(),
        config.reference_area,
    );
}

fn control_dict(config: &JobConfig) -> String {
    let mut dict = format!(
        "endTime {};\ndeltaT 1;\nwriteInterval {};\n\n",
        config.target_iterations,
        (config.target_iterations / 5).max(1)
    );

    let patches = if config.regions.is_empty() {
        String::from("wheel")
    } else {
        config.regions.join(" ")
    };
    force_function(&mut dict, "forces", &patches, config);

    for region in config.regions.iter() {
        force_function(&mut dict, &format!("forces_{region}"), region, config);
    }

    dict
}

fn solver_options(config: &JobConfig) -> String {
    let rotation = match config.rotation {
        Rotation::None => "none",
        Rotation::Mrf => "mrf",
        Rotation::Transient => "transient",
    };

    format!(
        "rotation {rotation};\nomega {:.6};\nnu {};\nreynolds {:.1};\ngpu {};\n",
        config.omega(),
        config.air.kinematic_viscosity,
        config.reynolds(),
        config.gpu_acceleration,
    )
}
