use crate::job::{JobId, Stage};
use ignore::WalkBuilder;
use std::{
    fs, io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument};

const CONFIG_DIR: &str = "config";
const MESH_DIR: &str = "mesh";
const LOGS_DIR: &str = "logs";
const OUTPUT_DIR: &str = "solver-output";
// partially copied artifacts live here until they are complete
const STAGING_DIR: &str = "mesh.incoming";
/// Files up to this size are scanned for the donor's path. Bulk mesh data (points, faces, owner)
/// is copied by the filesystem without passing through memory.
const PATCH_LIMIT: u64 = 1 << 20;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No discretization artifact found in {0:?}")]
    MissingArtifact(PathBuf),
    #[error("Failed to walk {path:?}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: ignore::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// On-disk case directory of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn mesh_dir(&self) -> PathBuf {
        self.root.join(MESH_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn stage_log(&self, stage: Stage) -> PathBuf {
        self.logs_dir().join(format!("{}.log", stage.name()))
    }

    /// true if the mesh directory exists and holds at least one entry
    pub fn has_artifact(&self) -> bool {
        fs::read_dir(self.mesh_dir())
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}

/// Statistics of one artifact copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub files: usize,
    pub bytes: u64,
    /// files in which the donor's own path was rewritten
    pub patched: usize,
}

/// Owns the directory below which all job workspaces live
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workspace(&self, id: JobId) -> Workspace {
        Workspace::new(self.root.join(id.to_string()))
    }

    /// Create the directory layout for a job, existing directories are left untouched
    #[instrument(skip(self), level = "debug")]
    pub fn create_workspace(&self, id: JobId) -> Result<Workspace, WorkspaceError> {
        let workspace = self.workspace(id);

        for dir in [
            workspace.config_dir(),
            workspace.mesh_dir(),
            workspace.logs_dir(),
            workspace.output_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        }

        debug!(path = ?workspace.root(), "Created workspace");
        Ok(workspace)
    }

    /// Remove a job's workspace, a workspace that does not exist is not an error
    pub fn cleanup(&self, id: JobId) -> Result<(), WorkspaceError> {
        let workspace = self.workspace(id);

        match fs::remove_dir_all(workspace.root()) {
            Ok(()) => {
                debug!(path = ?workspace.root(), "Removed workspace");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(workspace.root())(e)),
        }
    }
}

/// Copy the donor's discretization artifact into another workspace.
///
/// The copy is assembled in a staging directory and renamed onto `mesh/` once complete, so the
/// target either keeps its previous artifact or receives the full copy. Small text files and
/// symlinks mentioning the donor's workspace path are patched to point at the target. Repeating
/// the copy yields the same bytes.
#[instrument(skip_all, level = "debug", fields(from = ?from.root(), to = ?to.root()))]
pub fn copy_artifact(from: &Workspace, to: &Workspace) -> Result<CopyReport, WorkspaceError> {
    if !from.has_artifact() {
        return Err(WorkspaceError::MissingArtifact(from.mesh_dir()));
    }

    let source = from.mesh_dir();
    let staging = to.root().join(STAGING_DIR);
    let target = to.mesh_dir();

    // leftovers of an aborted attempt
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(io_error(&staging))?;
    }
    fs::create_dir_all(&staging).map_err(io_error(&staging))?;

    let from_root = from.root().to_string_lossy().into_owned();
    let to_root = to.root().to_string_lossy().into_owned();
    let mut report = CopyReport::default();

    let walker = WalkBuilder::new(&source)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    for entry in walker {
        let entry = entry.map_err(|source_error| WorkspaceError::Walk {
            path: source.clone(),
            source: source_error,
        })?;
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(&source) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let destination = staging.join(relative);

        let Some(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            fs::create_dir_all(&destination).map_err(io_error(&destination))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(path).map_err(io_error(path))?;
            let link = match link.strip_prefix(from.root()) {
                Ok(inside) => {
                    report.patched += 1;
                    to.root().join(inside)
                }
                Err(_) => link,
            };
            symlink(&link, &destination).map_err(io_error(&destination))?;
        } else {
            let size = entry
                .metadata()
                .map_err(|source_error| WorkspaceError::Walk {
                    path: path.to_path_buf(),
                    source: source_error,
                })?
                .len();

            report.files += 1;
            report.bytes += if size > PATCH_LIMIT || from_root.is_empty() {
                fs::copy(path, &destination).map_err(io_error(&destination))?
            } else {
                let content = fs::read(path).map_err(io_error(path))?;
                let content = match std::str::from_utf8(&content) {
                    Ok(text) if text.contains(from_root.as_str()) => {
                        report.patched += 1;
                        text.replace(from_root.as_str(), &to_root).into_bytes()
                    }
                    _ => content,
                };
                fs::write(&destination, &content).map_err(io_error(&destination))?;
                content.len() as u64
            };
        }
    }

    if target.exists() {
        fs::remove_dir_all(&target).map_err(io_error(&target))?;
    }
    fs::rename(&staging, &target).map_err(io_error(&target))?;

    info!(
        files = report.files,
        bytes = report.bytes,
        patched = report.patched,
        "Copied discretization artifact"
    );

    Ok(report)
}
