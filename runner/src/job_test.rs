use super::*;
use std::io::Write;

fn geometry(dir: &Path, content: &[u8]) -> PathBuf {
    let path = dir.join("wheel.stl");
    let mut file = File::create(&path).unwrap();
    file.write_all(content).unwrap();
    path
}

fn job(dir: &Path) -> Job {
    let config = JobConfig::new("wheel", geometry(dir, b"solid wheel\nendsolid wheel\n"))
        .seal()
        .unwrap();
    Job::new(config)
}

#[test]
fn full_pipeline_edges() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = job(dir.path());
    job.mesh = MeshOrigin::Generated;

    for next in [
        JobStatus::Preparing,
        JobStatus::Meshing,
        JobStatus::Solving,
        JobStatus::PostProcessing,
    ] {
        job.transition(next).unwrap();
        assert_eq!(job.status, next);
        assert_eq!(job.progress, next.progress_floor());
    }
}

#[test]
fn adopted_mesh_skips_meshing() {
    let donor = JobId::new();
    let adopted = MeshOrigin::Adopted { donor };

    assert!(JobStatus::Preparing.can_transition_to(JobStatus::Solving, &adopted));
    assert!(!JobStatus::Preparing.can_transition_to(JobStatus::Meshing, &adopted));
    assert!(!JobStatus::Meshing.can_transition_to(JobStatus::Solving, &adopted));

    assert!(!JobStatus::Preparing.can_transition_to(JobStatus::Solving, &MeshOrigin::Pending));
    assert!(JobStatus::Preparing.can_transition_to(JobStatus::Meshing, &MeshOrigin::Pending));
}

#[test]
fn skipping_stages_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = job(dir.path());

    assert_eq!(
        job.transition(JobStatus::Solving),
        Err(JobError::InvalidTransition {
            from: JobStatus::Queued,
            to: JobStatus::Solving
        })
    );
    assert!(job.transition(JobStatus::Complete).is_err());
    assert_eq!(job.status, JobStatus::Queued);
}

#[test]
fn terminal_states_are_absorbing() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = job(dir.path());

    job.fail(JobFailure::new(FailureReason::Cancelled, "cancelled by user"))
        .unwrap();

    assert_eq!(
        job.transition(JobStatus::Preparing),
        Err(JobError::Terminal(JobStatus::Failed))
    );
    assert_eq!(
        job.fail(JobFailure::new(FailureReason::StageFailed, "again")),
        Err(JobError::Terminal(JobStatus::Failed))
    );
    assert_eq!(
        job.error.as_ref().map(|failure| failure.reason),
        Some(FailureReason::Cancelled)
    );
}

#[test]
fn progress_is_monotone() {
    let dir = tempfile::tempdir().unwrap();
    let mut job = job(dir.path());

    job.raise_progress(60);
    job.raise_progress(20);
    assert_eq!(job.progress, 60);

    job.raise_progress(250);
    assert_eq!(job.progress, 100);
}

#[test]
fn solving_progress_interpolates() {
    assert_eq!(progress::solving(0, 500), progress::MESHED);
    assert_eq!(progress::solving(250, 500), 65);
    assert_eq!(progress::solving(500, 500), progress::SOLVED);
    assert_eq!(progress::solving(9000, 500), progress::SOLVED);
    assert_eq!(progress::solving(10, 0), progress::MESHED);
    assert_eq!(progress::solving(u64::MAX / 2, u64::MAX - 1), 65);
    assert_eq!(progress::solving(u64::MAX, u64::MAX), progress::SOLVED);
}

#[test]
fn validation_rejects_bad_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let geometry = geometry(dir.path(), b"solid\n");
    let base = JobConfig::new("wheel", &geometry);

    assert!(base.validate().is_ok());
    assert!(matches!(
        base.clone().with_speed(0.0).validate(),
        Err(ConfigurationError::NonPositive { field: "speed", .. })
    ));
    assert!(matches!(
        base.clone().with_incidence(f64::NAN).validate(),
        Err(ConfigurationError::NotFinite { field: "incidence" })
    ));
    assert!(matches!(
        base.clone().with_reference_area(-1.0).validate(),
        Err(ConfigurationError::NegativeReferenceArea(_))
    ));
    assert!(matches!(
        base.clone().with_target_iterations(0).validate(),
        Err(ConfigurationError::NoIterations)
    ));
    assert!(matches!(
        base.clone().with_regions(["rim", "spoke s"]).validate(),
        Err(ConfigurationError::InvalidRegion(region)) if region == "spoke s"
    ));
    assert!(matches!(
        JobConfig::new(" ", &geometry).validate(),
        Err(ConfigurationError::EmptyName)
    ));
    assert!(matches!(
        JobConfig::new("wheel", dir.path().join("absent.stl")).validate(),
        Err(ConfigurationError::MissingGeometry(_))
    ));

    // zero area is allowed, coefficients are reported unavailable instead
    assert!(base.with_reference_area(0.0).validate().is_ok());
}

#[test]
fn fingerprint_tracks_content() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();

    let a = JobConfig::new("a", geometry(first.path(), b"solid a\n"))
        .seal()
        .unwrap();
    let b = JobConfig::new("b", geometry(second.path(), b"solid a\n"))
        .seal()
        .unwrap();
    assert!(a.same_geometry(&b));

    let c = JobConfig::new("c", geometry(second.path(), b"solid c\n"))
        .seal()
        .unwrap();
    assert!(!a.same_geometry(&c));

    // unsealed configurations never match
    assert!(!JobConfig::new("d", &a.geometry).same_geometry(&a));
}

#[test]
fn derived_flow_quantities() {
    let dir = tempfile::tempdir().unwrap();
    let config = JobConfig::new("wheel", geometry(dir.path(), b"solid\n")).with_incidence(90.0);

    assert!((config.dynamic_pressure() - 0.5 * 1.225 * 13.9 * 13.9).abs() < 1e-9);
    assert!((config.omega() - 13.9 / 0.325).abs() < 1e-9);

    let inflow = config.inflow();
    assert!(inflow[0].abs() < 1e-9);
    assert!((inflow[1] - 13.9).abs() < 1e-9);
}

#[test]
fn status_round_trips_through_text() {
    for status in [
        JobStatus::Queued,
        JobStatus::PostProcessing,
        JobStatus::Failed,
    ] {
        assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
    }
    assert_eq!(
        "running".parse::<JobStatus>(),
        Err(JobError::UnknownStatus("running".into()))
    );
}
