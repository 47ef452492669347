use super::run_state::RunState;
use crate::shared::fs_atomic::{atomic_write_file, fsync_existing, sync_dir};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const RUN_STATE_FILE: &str = "run-state.json";
pub const RUN_STATE_BACKUP_FILE: &str = "run-state.json.bak";
pub const PENDING_MARKER: &str = ".pending";
pub const ABORT_MARKER: &str = "abort-requested";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("run `{run_id}` not found under {root}")]
    MissingRun { run_id: String, root: String },
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("run state at {path} is unreadable and no usable snapshot remains: {reason}")]
    StateUnreadable { path: String, reason: String },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ArtifactError {
    pub fn fix_hint(&self) -> Option<String> {
        match self {
            Self::MissingRun { root, .. } => Some(format!(
                "Fix: list known runs with `ls {root}` and pass one of those run ids"
            )),
            _ => None,
        }
    }
}

/// Owns the on-disk layout of a single run directory. Exactly one
/// coordinator holds a store for a given run at a time; concurrent runs
/// are partitioned by run id.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    run_id: String,
    run_dir: PathBuf,
}

impl ArtifactStore {
    /// Create the directory for a brand-new run.
    pub fn create(artifacts_root: &Path, run_id: &str) -> Result<Self, ArtifactError> {
        let run_dir = artifacts_root.join(run_id);
        fs::create_dir_all(&run_dir).map_err(|source| ArtifactError::CreateDir {
            path: run_dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            run_id: run_id.to_string(),
            run_dir,
        })
    }

    /// Open an existing run directory; fails when the run id is unknown.
    pub fn open(artifacts_root: &Path, run_id: &str) -> Result<Self, ArtifactError> {
        let run_dir = artifacts_root.join(run_id);
        if !run_dir.is_dir() {
            return Err(ArtifactError::MissingRun {
                run_id: run_id.to_string(),
                root: artifacts_root.display().to_string(),
            });
        }
        Ok(Self {
            run_id: run_id.to_string(),
            run_dir,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn step_dir(&self, step_id: &str) -> PathBuf {
        self.run_dir.join(step_id)
    }

    pub fn abort_marker_path(&self) -> PathBuf {
        self.run_dir.join(ABORT_MARKER)
    }

    /// Open a step directory for writing. A leftover directory from a
    /// previous interrupted attempt is discarded wholesale; the `.pending`
    /// marker stays in place until `finalize_step` removes it.
    pub fn begin_step(&self, step_id: &str) -> Result<PathBuf, ArtifactError> {
        let dir = self.step_dir(step_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|source| self.io_error(&dir, source))?;
        }
        fs::create_dir_all(&dir).map_err(|source| ArtifactError::CreateDir {
            path: dir.display().to_string(),
            source,
        })?;
        fs::write(dir.join(PENDING_MARKER), b"").map_err(|source| self.io_error(&dir, source))?;
        Ok(dir)
    }

    pub fn write_step_file(
        &self,
        step_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<PathBuf, ArtifactError> {
        let path = self.step_dir(step_id).join(name);
        fs::write(&path, content).map_err(|source| self.io_error(&path, source))?;
        Ok(path)
    }

    /// Make every artifact in the step directory durable, then drop the
    /// `.pending` marker. After this returns the step directory is complete
    /// by definition; before it returns, resume discards the directory.
    pub fn finalize_step(&self, step_id: &str) -> Result<(), ArtifactError> {
        let dir = self.step_dir(step_id);
        let entries = fs::read_dir(&dir).map_err(|source| self.io_error(&dir, source))?;
        for entry in entries {
            let entry = entry.map_err(|source| self.io_error(&dir, source))?;
            let path = entry.path();
            if path.is_file() && path.file_name().and_then(|n| n.to_str()) != Some(PENDING_MARKER)
            {
                fsync_existing(&path).map_err(|source| self.io_error(&path, source))?;
            }
        }
        let marker = dir.join(PENDING_MARKER);
        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(self.io_error(&marker, source)),
        }
        sync_dir(&dir).map_err(|source| self.io_error(&dir, source))
    }

    pub fn step_is_pending(&self, step_id: &str) -> bool {
        self.step_dir(step_id).join(PENDING_MARKER).is_file()
    }

    pub fn step_is_finalized(&self, step_id: &str) -> bool {
        let dir = self.step_dir(step_id);
        dir.is_dir() && !dir.join(PENDING_MARKER).exists()
    }

    /// Remove every step directory still carrying a `.pending` marker.
    /// Returns the ids of the discarded steps, in sorted order.
    pub fn discard_pending_steps(&self) -> Result<Vec<String>, ArtifactError> {
        let mut discarded = Vec::new();
        let entries = fs::read_dir(&self.run_dir)
            .map_err(|source| self.io_error(&self.run_dir, source))?;
        for entry in entries {
            let entry = entry.map_err(|source| self.io_error(&self.run_dir, source))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if path.join(PENDING_MARKER).is_file() {
                fs::remove_dir_all(&path).map_err(|source| self.io_error(&path, source))?;
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    discarded.push(name.to_string());
                }
            }
        }
        discarded.sort();
        Ok(discarded)
    }

    /// Persist the run state atomically, keeping the previous snapshot as a
    /// fallback. A failure here is fatal to the run: the caller must not
    /// continue past a state it could not record.
    pub fn save_run_state(&self, state: &RunState) -> Result<(), ArtifactError> {
        let path = self.run_state_path();
        let backup = self.run_dir.join(RUN_STATE_BACKUP_FILE);
        if path.is_file() {
            fs::copy(&path, &backup).map_err(|source| self.io_error(&backup, source))?;
        }
        let body =
            serde_json::to_vec_pretty(state).map_err(|source| ArtifactError::Json {
                path: path.display().to_string(),
                source,
            })?;
        atomic_write_file(&path, &body).map_err(|source| self.io_error(&path, source))
    }

    /// Load the run state, falling back to the last good snapshot when the
    /// primary file is missing or unparseable.
    pub fn load_run_state(&self) -> Result<RunState, ArtifactError> {
        let path = self.run_state_path();
        match read_state_file(&path) {
            Ok(state) => Ok(state),
            Err(primary_reason) => {
                let backup = self.run_dir.join(RUN_STATE_BACKUP_FILE);
                read_state_file(&backup).map_err(|_| ArtifactError::StateUnreadable {
                    path: path.display().to_string(),
                    reason: primary_reason,
                })
            }
        }
    }

    pub fn run_state_path(&self) -> PathBuf {
        self.run_dir.join(RUN_STATE_FILE)
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> ArtifactError {
        ArtifactError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

fn read_state_file(path: &Path) -> Result<RunState, String> {
    let raw = fs::read_to_string(path).map_err(|err| err.to_string())?;
    serde_json::from_str(&raw).map_err(|err| err.to_string())
}

/// List run ids under the artifacts root, newest first. Run ids sort
/// lexicographically by creation time, so a reverse sort is enough.
pub fn list_run_ids(artifacts_root: &Path) -> Result<Vec<String>, ArtifactError> {
    let entries = match fs::read_dir(artifacts_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(ArtifactError::Io {
                path: artifacts_root.display().to_string(),
                source,
            })
        }
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ArtifactError::Io {
            path: artifacts_root.display().to_string(),
            source,
        })?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
    }
    ids.sort();
    ids.reverse();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::run_state::RunStatus;
    use crate::workflow::WorkflowDefinition;

    fn sample_workflow() -> WorkflowDefinition {
        serde_yaml::from_str(
            "version: 1\nname: demo\nmodel_ref: claude\nsteps:\n  - id: one\n    type: cmd\n    command: echo hi\n",
        )
        .expect("workflow")
    }

    fn sample_state(run_id: &str) -> RunState {
        RunState::new(
            run_id,
            sample_workflow(),
            PathBuf::from("/tmp"),
            RunStatus::Running,
            1_700_000_000,
        )
    }

    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::create(temp.path(), "run-1").expect("create");
        let state = sample_state("run-1");
        store.save_run_state(&state).expect("save");
        let loaded = store.load_run_state().expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn corrupt_state_falls_back_to_previous_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::create(temp.path(), "run-1").expect("create");
        let mut state = sample_state("run-1");
        store.save_run_state(&state).expect("save v1");
        state.current_step_index = 1;
        store.save_run_state(&state).expect("save v2");

        fs::write(store.run_state_path(), b"{ truncated").expect("corrupt");
        let loaded = store.load_run_state().expect("fallback");
        // The backup holds the previous good snapshot.
        assert_eq!(loaded.current_step_index, 0);
    }

    #[test]
    fn pending_steps_are_discarded_and_finalized_steps_survive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::create(temp.path(), "run-1").expect("create");

        store.begin_step("done").expect("begin done");
        store
            .write_step_file("done", "output.txt", b"ok")
            .expect("write");
        store.finalize_step("done").expect("finalize");

        store.begin_step("crashed").expect("begin crashed");
        store
            .write_step_file("crashed", "output.txt", b"partial")
            .expect("write");

        assert!(store.step_is_finalized("done"));
        assert!(store.step_is_pending("crashed"));

        let discarded = store.discard_pending_steps().expect("discard");
        assert_eq!(discarded, vec!["crashed".to_string()]);
        assert!(!store.step_dir("crashed").exists());
        assert!(store.step_dir("done").join("output.txt").is_file());
    }

    #[test]
    fn begin_step_replaces_stale_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::create(temp.path(), "run-1").expect("create");
        store.begin_step("retry").expect("first");
        store
            .write_step_file("retry", "stale.txt", b"old attempt")
            .expect("write");
        let dir = store.begin_step("retry").expect("second");
        assert!(!dir.join("stale.txt").exists());
        assert!(store.step_is_pending("retry"));
    }

    #[test]
    fn unknown_run_id_is_reported_with_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = ArtifactStore::open(temp.path(), "nope").expect_err("missing");
        assert!(matches!(err, ArtifactError::MissingRun { .. }));
        assert!(err.fix_hint().is_some());
    }
}
