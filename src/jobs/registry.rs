use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use super::artifacts;
use super::error::PipelineError;
use super::layout::{sanitize_job_id, DataDirs, JobLayout};
use super::pipeline::{PipelineOutcome, TrainerMode};
use super::status::{read_status, Stage, StatusRead, StatusRecord};

/// Coarse classification of a job, as shown in listings.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Unknown,
}

struct JobEntry {
    scene: String,
    mode: TrainerMode,
    state: JobState,
    command: Option<String>,
    cancel: watch::Sender<bool>,
}

/// Everything the polling surface needs to know about one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub scene: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<TrainerMode>,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusRecord>,
    /// The status file existed but could not be parsed.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub status_corrupt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub zip_available: bool,
}

/// Authoritative view of jobs across their run.
///
/// In-memory entries cover jobs started by this process; everything else is
/// reconciled read-through from the on-disk status record and a probe for
/// the result artifact. The disk is the durable source of truth.
pub struct JobRegistry {
    dirs: DataDirs,
    jobs: RwLock<HashMap<String, JobEntry>>,
}

impl JobRegistry {
    pub fn new(dirs: DataDirs) -> Self {
        JobRegistry {
            dirs,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn dirs(&self) -> &DataDirs {
        &self.dirs
    }

    pub fn layout(&self, job_id: &str) -> JobLayout {
        JobLayout::new(&self.dirs, job_id)
    }

    /// Register a queued job and hand back its cancellation receiver.
    ///
    /// Re-registering a job that is currently queued or running is refused;
    /// re-running a finished job replaces its entry.
    pub fn register(
        &self,
        job_id: &str,
        scene: &str,
        mode: TrainerMode,
    ) -> Result<watch::Receiver<bool>, String> {
        let mut jobs = self.jobs.write().expect("registry lock poisoned");
        if let Some(existing) = jobs.get(job_id) {
            if matches!(existing.state, JobState::Queued | JobState::Running) {
                return Err(format!("job {job_id} is already {:?}", existing.state));
            }
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        jobs.insert(
            job_id.to_string(),
            JobEntry {
                scene: scene.to_string(),
                mode,
                state: JobState::Queued,
                command: None,
                cancel: cancel_tx,
            },
        );
        Ok(cancel_rx)
    }

    pub fn mark_running(&self, job_id: &str) {
        let mut jobs = self.jobs.write().expect("registry lock poisoned");
        if let Some(entry) = jobs.get_mut(job_id) {
            entry.state = JobState::Running;
        }
    }

    /// Record the result of a finished pipeline run.
    pub fn complete(&self, job_id: &str, outcome: &PipelineOutcome) {
        let mut jobs = self.jobs.write().expect("registry lock poisoned");
        if let Some(entry) = jobs.get_mut(job_id) {
            entry.state = if outcome.stage == Stage::Done {
                JobState::Done
            } else {
                JobState::Failed
            };
            entry.command = Some(outcome.command.clone());
        }
    }

    /// Drop the in-memory entry without touching any files. Used to back
    /// out of a submission that failed before reaching the queue.
    pub fn forget(&self, job_id: &str) {
        let mut jobs = self.jobs.write().expect("registry lock poisoned");
        jobs.remove(job_id);
    }

    /// Signal cancellation. Returns false when the job is not owned by this
    /// process or has already finished.
    pub fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.jobs.read().expect("registry lock poisoned");
        match jobs.get(job_id) {
            Some(entry) if matches!(entry.state, JobState::Queued | JobState::Running) => {
                info!(job_id, "cancellation requested");
                entry.cancel.send(true).is_ok()
            }
            _ => false,
        }
    }

    /// Merged in-memory + on-disk view of one job. `None` when nothing is
    /// known about the id at all.
    pub fn view(&self, job_id: &str) -> Option<JobView> {
        // Ids that the sanitizer would alter can never have been registered,
        // and their derived paths may point outside the data roots.
        if sanitize_job_id(job_id) != job_id {
            return None;
        }
        let layout = self.layout(job_id);
        let (mem_state, scene, mode, command) = {
            let jobs = self.jobs.read().expect("registry lock poisoned");
            match jobs.get(job_id) {
                Some(e) => (
                    Some(e.state),
                    e.scene.clone(),
                    Some(e.mode),
                    e.command.clone(),
                ),
                None => (None, job_id.to_string(), None, None),
            }
        };

        let (record, corrupt) = match read_status(&layout.status_file) {
            StatusRead::Record(r) => (Some(r), false),
            StatusRead::Corrupt => (None, true),
            StatusRead::Missing => (None, false),
        };

        if mem_state.is_none()
            && record.is_none()
            && !corrupt
            && !layout.output_dir.exists()
            && !layout.dataset_root.exists()
        {
            return None;
        }

        let state = match mem_state {
            // This process owns the job; its own bookkeeping wins.
            Some(s) => s,
            // Reconciliation path: classify from disk alone.
            None => classify_on_disk(record.as_ref(), &layout),
        };

        Some(JobView {
            job_id: job_id.to_string(),
            scene,
            mode,
            state,
            status: record,
            status_corrupt: corrupt,
            command,
            zip_available: layout.zip_path.is_file(),
        })
    }

    /// All known jobs: in-memory entries merged with an output-root scan,
    /// de-duplicated, sorted by `job_id` descending (newest first under the
    /// timestamped id scheme).
    pub fn list(&self) -> Vec<JobView> {
        let mut ids: BTreeSet<String> = {
            let jobs = self.jobs.read().expect("registry lock poisoned");
            jobs.keys().cloned().collect()
        };
        if let Ok(entries) = fs::read_dir(&self.dirs.output_dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        ids.insert(name.to_string());
                    }
                }
            }
        }
        ids.into_iter()
            .rev()
            .filter_map(|id| self.view(&id))
            .collect()
    }

    /// Remove a job's entire namespace and its in-memory entry.
    ///
    /// Best-effort per sub-path and idempotent: deleting a job that never
    /// existed, or deleting twice, succeeds; absent files are the desired
    /// end state.
    pub fn delete(&self, job_id: &str) -> Result<(), PipelineError> {
        // Raw path segments like ".." would make the derived layout point
        // at (or above) the data roots themselves. Only canonical ids name
        // a removable namespace.
        if sanitize_job_id(job_id) != job_id {
            return Err(PipelineError::InvalidJobId(job_id.to_string()));
        }

        // A running job is asked to stop first; its remaining writes land in
        // directories that are being removed anyway.
        self.cancel(job_id);
        {
            let mut jobs = self.jobs.write().expect("registry lock poisoned");
            jobs.remove(job_id);
        }

        let layout = self.layout(job_id);
        let mut first_err: Option<PipelineError> = None;
        let mut remove = |res: std::io::Result<()>, path: &std::path::Path| {
            if let Err(e) = res {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "delete failed");
                    if first_err.is_none() {
                        first_err = Some(PipelineError::io(path, e));
                    }
                }
            }
        };
        remove(fs::remove_dir_all(&layout.dataset_root), &layout.dataset_root);
        remove(fs::remove_dir_all(&layout.output_dir), &layout.output_dir);
        remove(fs::remove_file(&layout.zip_path), &layout.zip_path);
        remove(fs::remove_file(&layout.log_file), &layout.log_file);

        match first_err {
            Some(e) => Err(e),
            None => {
                info!(job_id, "job deleted");
                Ok(())
            }
        }
    }
}

fn classify_on_disk(record: Option<&StatusRecord>, layout: &JobLayout) -> JobState {
    match record {
        Some(r) if r.stage == Stage::Done => JobState::Done,
        Some(r) if r.stage.is_failure() => JobState::Failed,
        // No record, a corrupt one, or a non-terminal stage from a process
        // that is gone: let the artifact decide.
        _ => {
            if artifacts::locate(&layout.output_dir).point_cloud.is_some() {
                JobState::Done
            } else {
                JobState::Unknown
            }
        }
    }
}
