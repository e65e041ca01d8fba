use super::*;
use crate::{
    ingest::forces::{CoefficientSet, Coefficients, Forces, JobResult},
    workspace::Workspace,
};
use parking_lot::Mutex;
use std::{collections::HashMap, fs, path::Path, sync::Arc};

/// Finishes jobs immediately with a preset status
struct InstantLauncher {
    registry: Arc<JobRegistry>,
    outcomes: HashMap<JobId, JobStatus>,
    launched: Mutex<Vec<(JobId, Option<JobId>)>>,
    released: Mutex<Vec<JobId>>,
}

impl JobLauncher for InstantLauncher {
    fn launch(&self, id: JobId, source: MeshSource) -> Receiver<JobStatus> {
        let donor = match source {
            MeshSource::Generate => None,
            MeshSource::Adopt { donor, .. } => Some(donor),
        };
        self.launched.lock().push((id, donor));

        let status = self
            .outcomes
            .get(&id)
            .copied()
            .unwrap_or(JobStatus::Complete);
        self.registry
            .update(id, |job| {
                job.status = status;
                job.progress = 100;
            })
            .unwrap();

        let (sender, receiver) = crossbeam_channel::bounded(1);
        sender.send(status).unwrap();
        receiver
    }

    fn release(&self, id: JobId) {
        self.released.lock().push(id);
    }
}

fn geometry(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn batch(registry: &JobRegistry, configs: Vec<JobConfig>) -> BatchRecord {
    let mut record = BatchRecord::new(BatchId::new(), "sweep", SweepParameter::Incidence);
    for config in configs {
        let value = config.incidence;
        let job = registry.insert(Job::new(config.seal().unwrap()));
        record.members.push(BatchMember { job, value });
    }
    registry.insert_batch(record.clone());
    record
}

fn sweep_configs(dir: &Path, angles: &[f64]) -> Vec<JobConfig> {
    let base = JobConfig::new("wheel", geometry(dir, "wheel.stl", "solid wheel\n"));
    Sweep::incidence(angles.to_vec()).configs(&base, BatchId::new())
}

fn launcher(registry: &Arc<JobRegistry>, outcomes: HashMap<JobId, JobStatus>) -> InstantLauncher {
    InstantLauncher {
        registry: registry.clone(),
        outcomes,
        launched: Mutex::new(Vec::new()),
        released: Mutex::new(Vec::new()),
    }
}

#[test]
fn status_aggregation() {
    let dir = tempfile::tempdir().unwrap();
    let jobs = sweep_configs(dir.path(), &[0.0, 5.0, 10.0])
        .into_iter()
        .map(Job::new)
        .collect::<Vec<_>>();

    assert_eq!(BatchStatus::of(&jobs).to_string(), "running_1_of_3");

    let mut progressed = jobs.clone();
    progressed[0].status = JobStatus::Complete;
    assert_eq!(BatchStatus::of(&progressed).to_string(), "running_2_of_3");

    progressed[1].status = JobStatus::Failed;
    assert_eq!(
        BatchStatus::of(&progressed),
        BatchStatus::Running {
            current: 3,
            total: 3
        }
    );
    progressed[2].status = JobStatus::Complete;
    assert_eq!(BatchStatus::of(&progressed), BatchStatus::Failed);

    progressed[1].status = JobStatus::Complete;
    assert_eq!(BatchStatus::of(&progressed), BatchStatus::Complete);

    let mut donor_failed = jobs;
    donor_failed[0].status = JobStatus::Failed;
    assert_eq!(BatchStatus::of(&donor_failed), BatchStatus::Failed);
    assert_eq!(
        serde_json::to_string(&BatchStatus::of(&donor_failed)).unwrap(),
        "\"failed\""
    );
}

#[test]
fn dependents_adopt_the_donor_mesh() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(JobRegistry::new());
    let workspaces = WorkspaceManager::new(dir.path().join("cases"));

    let mut configs = sweep_configs(dir.path(), &[0.0, 5.0, 10.0]);
    configs[2].geometry = geometry(dir.path(), "other.stl", "solid other\n");
    let record = batch(&registry, configs);
    let ids = record.job_ids();

    let launcher = launcher(&registry, HashMap::new());
    let coordinator = BatchCoordinator {
        registry: &registry,
        workspaces: &workspaces,
        launcher: &launcher,
        cancel: CancelToken::new(),
    };

    assert_eq!(coordinator.run(&record), BatchStatus::Complete);
    assert_eq!(
        *launcher.launched.lock(),
        vec![(ids[0], None), (ids[1], Some(ids[0])), (ids[2], None)]
    );
}

#[test]
fn donor_failure_leaves_dependents_queued() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(JobRegistry::new());
    let workspaces = WorkspaceManager::new(dir.path().join("cases"));
    let record = batch(&registry, sweep_configs(dir.path(), &[0.0, 5.0, 10.0, 15.0, 20.0]));
    let ids = record.job_ids();

    let launcher = launcher(&registry, HashMap::from([(ids[0], JobStatus::Failed)]));
    let coordinator = BatchCoordinator {
        registry: &registry,
        workspaces: &workspaces,
        launcher: &launcher,
        cancel: CancelToken::new(),
    };

    assert_eq!(coordinator.run(&record), BatchStatus::Failed);
    assert_eq!(launcher.launched.lock().len(), 1);
    assert_eq!(*launcher.released.lock(), ids[1..].to_vec());
    for id in &ids[1..] {
        assert_eq!(registry.get(*id).unwrap().status, JobStatus::Queued);
        assert!(!Workspace::new(workspaces.root().join(id.to_string())).has_artifact());
    }
}

#[test]
fn cancelled_batch_never_starts() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(JobRegistry::new());
    let workspaces = WorkspaceManager::new(dir.path().join("cases"));
    let record = batch(&registry, sweep_configs(dir.path(), &[0.0, 5.0]));

    let launcher = launcher(&registry, HashMap::new());
    let cancel = CancelToken::new();
    cancel.cancel();
    let coordinator = BatchCoordinator {
        registry: &registry,
        workspaces: &workspaces,
        launcher: &launcher,
        cancel,
    };

    assert_eq!(coordinator.run(&record), BatchStatus::Failed);
    assert!(launcher.launched.lock().is_empty());
    assert_eq!(*launcher.released.lock(), record.job_ids());
    for job in registry.select(&record.job_ids()) {
        assert_eq!(
            job.error.map(|failure| failure.reason),
            Some(FailureReason::Cancelled)
        );
    }
}

#[test]
fn sweep_configs_carry_the_value() {
    let dir = tempfile::tempdir().unwrap();
    let base = JobConfig::new("wheel", geometry(dir.path(), "wheel.stl", "solid\n"));
    let batch = BatchId::new();

    let configs = Sweep::speed(vec![10.0, 20.0]).configs(&base, batch);
    assert_eq!(configs[1].speed, 20.0);
    assert_eq!(configs[1].name, "wheel (20 m/s)");
    assert!(configs.iter().all(|config| config.batch == Some(batch)));

    assert!(matches!(
        Sweep::incidence(vec![]).validate(),
        Err(ConfigurationError::EmptySweep)
    ));
    assert!(matches!(
        Sweep::incidence(vec![0.0, f64::INFINITY]).validate(),
        Err(ConfigurationError::InvalidSweepValue(_))
    ));
}

#[test]
fn summary_averages_completed_members() {
    let dir = tempfile::tempdir().unwrap();
    let registry = JobRegistry::new();
    let record = batch(&registry, sweep_configs(dir.path(), &[0.0, 5.0, 10.0]));
    let mut jobs = registry.select(&record.job_ids());

    for (job, cd) in jobs.iter_mut().zip([0.4, 0.6]) {
        job.status = JobStatus::Complete;
        job.result = Some(JobResult {
            iteration: Some(500),
            forces: Forces {
                drag: cd * 2.0,
                lift: 0.1,
                side: 0.0,
            },
            raw_forces: None,
            coefficients: CoefficientSet::Available(Coefficients {
                cd,
                cl: 0.05,
                cs: 0.0,
                cm: None,
            }),
            moments: None,
            drag_area: None,
            dynamic_pressure: 118.3,
            reference_area: 0.0225,
            regions: vec![],
            converged: Some(true),
        });
    }
    jobs[2].status = JobStatus::Failed;

    let summary = BatchSummary::new(&record, &jobs);

    assert_eq!(summary.total, 3);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.status, BatchStatus::Failed);
    assert!((summary.avg_cd.unwrap() - 0.5).abs() < 1e-12);
    assert!((summary.avg_drag_n.unwrap() - 1.0).abs() < 1e-12);
    assert_eq!(summary.members[1].value, 5.0);
    assert_eq!(summary.members[2].cd, None);
}
