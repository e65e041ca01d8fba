use super::{JobStore, StoreError};
use crate::{
    batch::BatchRecord,
    job::{BatchId, Job, JobId},
};
use chrono::{DateTime, Utc};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection};
use serde::{de::DeserializeOwned, Serialize};
use std::{path::Path, sync::Arc};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(InnerConnection::load(path)?))
    }

    /// in-memory database, gone with the connection
    pub fn memory() -> Result<Self, StoreError> {
        Ok(Self::new(InnerConnection {
            connection: Connection::open_in_memory()?,
        }))
    }

    pub fn init(&self) -> Result<(), StoreError> {
        self.lock().init()
    }
}

impl JobStore for SharedConnection {
    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.lock().save_job(job)
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        self.lock().delete("delete from jobs where id = ?", id.to_string())
    }

    fn load_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.lock().load_jobs()
    }

    fn save_batch(&self, batch: &BatchRecord) -> Result<(), StoreError> {
        self.lock().save_batch(batch)
    }

    fn delete_batch(&self, id: BatchId) -> Result<(), StoreError> {
        self.lock()
            .delete("delete from batches where id = ?", id.to_string())
    }

    fn load_batches(&self) -> Result<Vec<BatchRecord>, StoreError> {
        self.lock().load_batches()
    }
}

fn json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(value: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_str(value)?)
}

fn corrupt(id: &str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        id: id.to_owned(),
        reason: reason.to_string(),
    }
}

fn timestamp(id: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| corrupt(id, e))
}

impl InnerConnection {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let connection = Connection::open(path)?;
        debug!(path = ?path, "Opened SQLite job store");

        Ok(Self { connection })
    }

    pub fn init(&mut self) -> Result<(), StoreError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(StoreError::SQLite(error));
                }
            };

            counter += 1;
        }

        info!("Initialized SQLite job store");

        Ok(())
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.connection
            .prepare_cached(
                "insert or replace into jobs
                 (id, name, status, progress, batch, config, result, error, mesh, convergence,
                  workspace, created_at, updated_at)
                 values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                job.id.to_string(),
                job.name,
                job.status.as_str(),
                job.progress,
                job.config.batch.map(|batch| batch.to_string()),
                json(&job.config)?,
                job.result.as_ref().map(json).transpose()?,
                job.error.as_ref().map(json).transpose()?,
                json(&job.mesh)?,
                json(&job.convergence)?,
                job.workspace
                    .as_ref()
                    .map(|path| path.to_string_lossy().into_owned()),
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ])?;

        debug!(job = %job.id, status = %job.status, "Stored job");

        Ok(())
    }

    fn delete(&self, statement: &str, id: String) -> Result<(), StoreError> {
        self.connection
            .prepare_cached(statement)?
            .execute(params![id])?;

        Ok(())
    }

    fn load_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = self
            .connection
            .prepare_cached(
                "select id, name, status, progress, config, result, error, mesh, convergence,
                        workspace, created_at, updated_at
                 from jobs order by created_at",
            )?
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u8>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, String>(11)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(
                    id,
                    name,
                    status,
                    progress,
                    config,
                    result,
                    error,
                    mesh,
                    convergence,
                    workspace,
                    created_at,
                    updated_at,
                )| {
                    Ok(Job {
                        id: id.parse().map_err(|e| corrupt(&id, e))?,
                        name,
                        config: from_json(&config)?,
                        status: status.parse().map_err(|e| corrupt(&id, e))?,
                        progress,
                        result: result.as_deref().map(from_json).transpose()?,
                        convergence: from_json(&convergence)?,
                        error: error.as_deref().map(from_json).transpose()?,
                        mesh: from_json(&mesh)?,
                        workspace: workspace.map(Into::into),
                        created_at: timestamp(&id, &created_at)?,
                        updated_at: timestamp(&id, &updated_at)?,
                    })
                },
            )
            .collect()
    }

    fn save_batch(&self, batch: &BatchRecord) -> Result<(), StoreError> {
        self.connection
            .prepare_cached(
                "insert or replace into batches (id, created_at, record) values (?, ?, ?)",
            )?
            .execute(params![
                batch.id.to_string(),
                batch.created_at.to_rfc3339(),
                json(batch)?
            ])?;

        Ok(())
    }

    fn load_batches(&self) -> Result<Vec<BatchRecord>, StoreError> {
        let records = self
            .connection
            .prepare_cached("select record from batches order by created_at")?
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        records.iter().map(|record| from_json(record)).collect()
    }

    #[cfg(test)]
    fn job_exists(&self, id: JobId) -> Result<bool, StoreError> {
        use rusqlite::OptionalExtension;

        Ok(self
            .connection
            .prepare_cached("select 1 from jobs where id = ?")?
            .query_row(params![id.to_string()], |_| Ok(()))
            .optional()?
            .is_some())
    }
}

pub const SQL_SCHEMA: [&str; 3] = [
    "create table if not exists jobs (
    id text primary key,
    name text not null,
    status text not null,
    progress integer not null,
    batch text,

    config text not null,
    result text,
    error text,
    mesh text not null,
    convergence text not null,

    workspace text,
    created_at text not null,
    updated_at text not null
);",
    "create table if not exists batches (
    id text primary key,
    created_at text not null,
    record text not null
);",
    "create index if not exists jobs_by_batch on jobs (batch);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FailureReason, JobConfig, JobFailure, JobStatus};
    use crate::registry::JobRegistry;

    fn job(dir: &Path) -> Job {
        let geometry = dir.join("wheel.stl");
        std::fs::write(&geometry, "solid\n").unwrap();
        Job::new(JobConfig::new("wheel", geometry).seal().unwrap())
    }

    #[test]
    fn jobs_survive_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedConnection::memory().unwrap();
        store.init().unwrap();

        let mut failed = job(dir.path());
        failed
            .fail(JobFailure::new(FailureReason::StageFailed, "exit code 1"))
            .unwrap();
        let queued = job(dir.path());

        store.save_job(&failed).unwrap();
        store.save_job(&queued).unwrap();
        // replacing keeps a single row
        store.save_job(&failed).unwrap();

        let loaded = store.load_jobs().unwrap();
        assert_eq!(loaded.len(), 2);
        let restored = loaded.iter().find(|job| job.id == failed.id).unwrap();
        assert_eq!(restored.status, JobStatus::Failed);
        assert_eq!(restored.error, failed.error);
        assert_eq!(restored.config, failed.config);
        assert_eq!(restored.created_at, failed.created_at);

        store.delete_job(queued.id).unwrap();
        assert!(!store.lock().job_exists(queued.id).unwrap());
    }

    #[test]
    fn unfinished_jobs_are_marked_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedConnection::memory().unwrap();
        store.init().unwrap();

        let mut running = job(dir.path());
        running.transition(JobStatus::Preparing).unwrap();
        store.save_job(&running).unwrap();

        let registry = JobRegistry::with_store(Arc::new(store.clone())).unwrap();
        assert_eq!(registry.get(running.id).unwrap().status, JobStatus::Preparing);

        assert_eq!(registry.recover_interrupted().unwrap(), 1);
        let restored = registry.get(running.id).unwrap();

        assert_eq!(restored.status, JobStatus::Failed);
        assert_eq!(
            restored.error.map(|failure| failure.reason),
            Some(FailureReason::Interrupted)
        );
        assert_eq!(
            store.load_jobs().unwrap()[0].status,
            JobStatus::Failed
        );
    }
}
