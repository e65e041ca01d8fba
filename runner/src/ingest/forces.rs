use super::{parse_iteration, tokens, CoefficientTail, IngestorError};
use crate::{config::OutputLayout, job::JobConfig};
use globset::{Glob, GlobMatcher};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

pub type Vector = [f64; 3];

fn dot(a: &Vector, b: &Vector) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn add(a: &Vector, b: &Vector) -> Vector {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// Forces in wind axes, in N
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forces {
    pub drag: f64,
    pub lift: f64,
    pub side: f64,
}

impl Forces {
    pub fn project(total: &Vector, config: &JobConfig) -> Self {
        Self {
            drag: dot(total, &config.drag_axis()),
            lift: dot(total, &config.lift_axis()),
            side: dot(total, &config.side_axis()),
        }
    }
}

/// Body-axis force vector as reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawForces {
    pub iteration: u64,
    pub total: Vector,
    pub pressure: Option<Vector>,
    pub viscous: Option<Vector>,
}

/// Moments about the body axes, in N·m
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coefficients {
    #[serde(rename = "Cd")]
    pub cd: f64,
    #[serde(rename = "Cl")]
    pub cl: f64,
    #[serde(rename = "Cs")]
    pub cs: f64,
    #[serde(rename = "Cm")]
    pub cm: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum CoefficientSet {
    Available(Coefficients),
    Unavailable { reason: String },
}

impl CoefficientSet {
    pub fn available(&self) -> Option<&Coefficients> {
        match self {
            Self::Available(coefficients) => Some(coefficients),
            Self::Unavailable { .. } => None,
        }
    }
}

/// drag area Cd·A
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DragArea {
    pub m2: f64,
    pub cm2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionShare {
    pub name: String,
    pub forces: Forces,
    /// fraction of the summed region drag, absent if that sum is zero
    pub drag_share: Option<f64>,
}

/// Final, immutable outcome of a completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub iteration: Option<u64>,
    pub forces: Forces,
    pub raw_forces: Option<RawForces>,
    pub coefficients: CoefficientSet,
    pub moments: Option<Moments>,
    pub drag_area: Option<DragArea>,
    pub dynamic_pressure: f64,
    pub reference_area: f64,
    #[serde(default)]
    pub regions: Vec<RegionShare>,
    pub converged: Option<bool>,
}

/// C = F / (q·A), `None` whenever the quotient would not be a finite number
pub fn coefficient(force: f64, reference_area: f64, dynamic_pressure: f64) -> Option<f64> {
    if !(reference_area > 0.0) || !(dynamic_pressure > 0.0) || !force.is_finite() {
        return None;
    }

    let value = force / (dynamic_pressure * reference_area);
    value.is_finite().then_some(value)
}

/// Parse a row of a force or moment file, either `iter x y z` or `iter (px py pz) (vx vy vz)`.
pub(crate) fn parse_vector_row(line: &str) -> Option<RawForces> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut parts = tokens(line);
    let iteration = parse_iteration(parts.next()?)?;
    let numbers = parts
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;

    match numbers.len() {
        n if n >= 6 => {
            let pressure = [numbers[0], numbers[1], numbers[2]];
            let viscous = [numbers[3], numbers[4], numbers[5]];

            Some(RawForces {
                iteration,
                total: add(&pressure, &viscous),
                pressure: Some(pressure),
                viscous: Some(viscous),
            })
        }
        n if n >= 3 => Some(RawForces {
            iteration,
            total: [numbers[0], numbers[1], numbers[2]],
            pressure: None,
            viscous: None,
        }),
        _ => None,
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, IngestorError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(IngestorError::io(path, error)),
    }
}

/// last parseable row of a vector file
pub fn last_vector(path: &Path) -> Result<Option<RawForces>, IngestorError> {
    Ok(read_optional(path)?.and_then(|content| content.lines().rev().find_map(parse_vector_row)))
}

/// Region files matched by a glob with a single `*` standing for the region name
#[derive(Debug, Clone)]
pub struct RegionPattern {
    matcher: GlobMatcher,
    prefix: String,
    suffix: String,
}

impl RegionPattern {
    pub fn new(pattern: &str) -> Result<Self, IngestorError> {
        let invalid = |source| IngestorError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        };
        let matcher = Glob::new(pattern).map_err(invalid)?.compile_matcher();
        let (prefix, suffix) = pattern.split_once('*').unwrap_or((pattern, ""));

        Ok(Self {
            matcher,
            prefix: prefix.to_owned(),
            suffix: suffix.to_owned(),
        })
    }

    pub fn region_name(&self, file_name: &str) -> Option<String> {
        if !self.matcher.is_match(file_name) {
            return None;
        }

        file_name
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_suffix(self.suffix.as_str()))
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
    }

    /// all region files in `dir`, sorted by region name
    pub fn collect(&self, dir: &Path) -> Result<Vec<(String, PathBuf)>, IngestorError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(IngestorError::io(dir, error)),
        };

        Ok(entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = self.region_name(entry.file_name().to_str()?)?;
                Some((name, entry.path()))
            })
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect_vec())
    }
}

/// per-region breakdown, only produced when at least two regions reported forces
pub fn region_breakdown(
    output: &Path,
    pattern: &RegionPattern,
    config: &JobConfig,
) -> Result<Vec<RegionShare>, IngestorError> {
    let regions = pattern
        .collect(output)?
        .into_iter()
        .map(|(name, path)| Ok((name, last_vector(&path)?)))
        .collect::<Result<Vec<_>, IngestorError>>()?
        .into_iter()
        .filter_map(|(name, row)| match row {
            Some(row) => Some((name, Forces::project(&row.total, config))),
            None => {
                warn!(region = %name, "Region force file holds no data");
                None
            }
        })
        .collect_vec();

    if regions.len() < 2 {
        return Ok(Vec::new());
    }

    let total_drag: f64 = regions.iter().map(|(_, forces)| forces.drag).sum();

    Ok(regions
        .into_iter()
        .map(|(name, forces)| RegionShare {
            drag_share: (total_drag != 0.0 && total_drag.is_finite())
                .then(|| forces.drag / total_drag),
            name,
            forces,
        })
        .collect())
}

/// Build the final result from the solver output directory.
///
/// Forces come from the force file; if it is missing they are reconstructed from the last
/// coefficient row. A zero reference area still yields a result, with coefficients marked
/// unavailable.
pub fn extract(
    output: &Path,
    layout: &OutputLayout,
    config: &JobConfig,
) -> Result<JobResult, IngestorError> {
    let q = config.dynamic_pressure();
    let area = config.reference_area;

    let raw = last_vector(&output.join(&layout.forces))?;
    let (iteration, forces) = match raw {
        Some(ref raw) => (Some(raw.iteration), Forces::project(&raw.total, config)),
        None => {
            debug!("No force file, falling back to coefficient output");
            reconstruct_forces(output, layout, config)?
        }
    };

    let moments = last_vector(&output.join(&layout.moments))?.map(|row| Moments {
        roll: row.total[0],
        pitch: row.total[1],
        yaw: row.total[2],
    });

    let coefficients = match (
        coefficient(forces.drag, area, q),
        coefficient(forces.lift, area, q),
        coefficient(forces.side, area, q),
    ) {
        (Some(cd), Some(cl), Some(cs)) => CoefficientSet::Available(Coefficients {
            cd,
            cl,
            cs,
            cm: moments.and_then(|moments| {
                coefficient(moments.pitch, area, q).map(|c| c / config.reference_length())
            }),
        }),
        _ => CoefficientSet::Unavailable {
            reason: if area > 0.0 {
                format!("coefficients are undefined for dynamic pressure {q}")
            } else {
                format!("reference area {area} m² is not positive")
            },
        },
    };

    let drag_area = coefficients.available().map(|c| DragArea {
        m2: c.cd * area,
        cm2: c.cd * area * 10_000.0,
    });

    let regions = region_breakdown(output, &RegionPattern::new(&layout.regions)?, config)?;

    Ok(JobResult {
        iteration,
        forces,
        raw_forces: raw,
        coefficients,
        moments,
        drag_area,
        dynamic_pressure: q,
        reference_area: area,
        regions,
        converged: None,
    })
}

fn reconstruct_forces(
    output: &Path,
    layout: &OutputLayout,
    config: &JobConfig,
) -> Result<(Option<u64>, Forces), IngestorError> {
    let path = output.join(&layout.coefficients);
    let mut tail = CoefficientTail::new(&path, &layout.fields);
    let last = tail.finish()?.pop();

    let scale = config.dynamic_pressure() * config.reference_area;
    let Some(sample) = last.filter(|_| scale > 0.0) else {
        return Err(IngestorError::NoData(output.to_path_buf()));
    };

    let value = |field: &str| {
        tail.fields()
            .iter()
            .position(|name| name == field)
            .and_then(|index| sample.values.get(index).copied())
    };
    let Some(cd) = value("Cd") else {
        return Err(IngestorError::NoData(output.to_path_buf()));
    };

    Ok((
        Some(sample.iteration),
        Forces {
            drag: cd * scale,
            lift: value("Cl").unwrap_or(0.0) * scale,
            side: value("Cs").unwrap_or(0.0) * scale,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> OutputLayout {
        OutputLayout::default()
    }

    fn config(dir: &Path) -> JobConfig {
        let geometry = dir.join("wheel.stl");
        fs::write(&geometry, "solid wheel\nendsolid wheel\n").unwrap();

        JobConfig::new("test", geometry)
    }

    #[test]
    fn coefficient_is_pure_and_guarded() {
        let q = 0.5 * 1.225 * 13.9 * 13.9;

        assert_eq!(coefficient(1.3, 0.0225, q), coefficient(1.3, 0.0225, q));
        assert!((coefficient(1.3, 0.0225, q).unwrap() - 1.3 / (q * 0.0225)).abs() < 1e-12);
        assert_eq!(coefficient(1.3, 0.0, q), None);
        assert_eq!(coefficient(1.3, -1.0, q), None);
        assert_eq!(coefficient(f64::NAN, 0.0225, q), None);
        assert_eq!(coefficient(1.3, f64::NAN, q), None);
        assert_eq!(coefficient(1.3, 0.0225, 0.0), None);
    }

    #[test]
    fn vector_rows() {
        let split = parse_vector_row("10 ((1 2 3) (0.5 0.5 0.5))").unwrap();
        assert_eq!(split.iteration, 10);
        assert_eq!(split.total, [1.5, 2.5, 3.5]);
        assert_eq!(split.viscous, Some([0.5, 0.5, 0.5]));

        let plain = parse_vector_row("11 1 2 3").unwrap();
        assert_eq!(plain.total, [1.0, 2.0, 3.0]);
        assert_eq!(plain.pressure, None);

        assert!(parse_vector_row("# Time forces").is_none());
        assert!(parse_vector_row("12 1 2").is_none());
    }

    #[test]
    fn extract_projects_onto_wind_axes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).with_incidence(90.0);
        fs::write(
            dir.path().join("forces.dat"),
            "# Time forces\n1 (0 0 0) (0 0 0)\n2 ((1.0 2.0 0.5) (0.0 0.0 0.0))\n",
        )
        .unwrap();

        let result = extract(dir.path(), &layout(), &config).unwrap();

        // at 90° the drag axis is +y and the side axis is -x
        assert!((result.forces.drag - 2.0).abs() < 1e-9);
        assert!((result.forces.side + 1.0).abs() < 1e-9);
        assert!((result.forces.lift - 0.5).abs() < 1e-9);
        assert_eq!(result.iteration, Some(2));
        assert!(result.regions.is_empty());
    }

    #[test]
    fn zero_area_keeps_forces() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).with_reference_area(0.0);
        fs::write(dir.path().join("forces.dat"), "5 1.2 0 0.1\n").unwrap();

        let result = extract(dir.path(), &layout(), &config).unwrap();

        assert!((result.forces.drag - 1.2).abs() < 1e-9);
        assert!(matches!(
            result.coefficients,
            CoefficientSet::Unavailable { .. }
        ));
        assert_eq!(result.drag_area, None);
    }

    #[test]
    fn reconstructs_from_coefficients() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::write(
            dir.path().join("forceCoeffs.dat"),
            "# Time Cm Cd Cl\n1 0.0 0.6 0.1\n2 0.0 0.5 0.1\n",
        )
        .unwrap();

        let result = extract(dir.path(), &layout(), &config).unwrap();
        let expected = 0.5 * config.dynamic_pressure() * config.reference_area;

        assert!((result.forces.drag - expected).abs() < 1e-9);
        let cd = result.coefficients.available().unwrap().cd;
        assert!((cd - 0.5).abs() < 1e-9);
    }

    #[test]
    fn missing_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        assert!(matches!(
            extract(dir.path(), &layout(), &config),
            Err(IngestorError::NoData(_))
        ));
    }

    #[test]
    fn region_shares() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::write(dir.path().join("forces.dat"), "3 1.0 0 0\n").unwrap();
        fs::write(dir.path().join("forces_rim.dat"), "3 0.2 0 0\n").unwrap();
        fs::write(dir.path().join("forces_tire.dat"), "3 0.5 0 0\n").unwrap();
        fs::write(dir.path().join("forces_spokes.dat"), "3 0.3 0 0\n").unwrap();

        let result = extract(dir.path(), &layout(), &config).unwrap();
        let names = result
            .regions
            .iter()
            .map(|region| region.name.as_str())
            .collect_vec();

        assert_eq!(names, vec!["rim", "spokes", "tire"]);
        let total: f64 = result.regions.iter().filter_map(|r| r.drag_share).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((result.regions[2].drag_share.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn single_region_has_no_breakdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::write(dir.path().join("forces.dat"), "3 1.0 0 0\n").unwrap();
        fs::write(dir.path().join("forces_rim.dat"), "3 0.2 0 0\n").unwrap();

        let result = extract(dir.path(), &layout(), &config).unwrap();

        assert!(result.regions.is_empty());
    }
}
