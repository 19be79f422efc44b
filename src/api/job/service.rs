use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use actix_multipart::form::tempfile::TempFile;
use actix_web::{web, HttpResponse, ResponseError};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::validation::ErrorResponse;
use crate::config::Config;
use crate::jobs::layout::{make_job_id, sanitize_job_id, JobLayout};
use crate::jobs::pipeline::TrainerMode;
use crate::jobs::registry::JobView;
use crate::jobs::{archive, artifacts, JobRegistry, PipelineError};
use crate::worker::QueuedJob;

use super::dto::{
    ArtifactsResponse, CancelResponse, DeleteResponse, RerunRequest, StatusResponse,
    SubmitResponse,
};

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "webp"];

/// Service-level errors
#[derive(Debug)]
pub enum ServiceError {
    /// Nothing is known about the job, in memory or on disk
    NotFound(String),

    /// Bad request content (no images, unknown mode, ...)
    ValidationError(String),

    /// Job exists and is currently queued or running
    Conflict(String),

    /// Filesystem trouble under the data directories
    StorageError(String),

    /// The job queue is gone (shutdown in progress)
    Unavailable,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::NotFound(id) => write!(f, "Job not found: {id}"),
            ServiceError::ValidationError(msg) => write!(f, "Validation error: {msg}"),
            ServiceError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            ServiceError::StorageError(msg) => write!(f, "Storage error: {msg}"),
            ServiceError::Unavailable => write!(f, "Service is shutting down"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<PipelineError> for ServiceError {
    fn from(e: PipelineError) -> Self {
        ServiceError::StorageError(e.to_string())
    }
}

impl ResponseError for ServiceError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ServiceError::NotFound(id) => {
                warn!("Job not found: {id}");
                HttpResponse::NotFound().json(ErrorResponse {
                    error: "Not found".to_string(),
                    fields: serde_json::json!({"message": format!("Job {id} not found")}),
                })
            }
            ServiceError::ValidationError(msg) => {
                warn!("Validation error: {msg}");
                HttpResponse::BadRequest().json(ErrorResponse {
                    error: "Validation failed".to_string(),
                    fields: serde_json::json!({"message": msg}),
                })
            }
            ServiceError::Conflict(msg) => {
                warn!("Conflict: {msg}");
                HttpResponse::Conflict().json(ErrorResponse {
                    error: "Conflict".to_string(),
                    fields: serde_json::json!({"message": msg}),
                })
            }
            ServiceError::StorageError(msg) => {
                tracing::error!("Storage error: {msg}");
                HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "Failed to process request".to_string(),
                    fields: serde_json::json!({"message": "Storage error occurred"}),
                })
            }
            ServiceError::Unavailable => HttpResponse::ServiceUnavailable().json(ErrorResponse {
                error: "Unavailable".to_string(),
                fields: serde_json::json!({"message": "Server is shutting down"}),
            }),
        }
    }
}

/// Job service containing the HTTP-facing business logic: accepting
/// uploads, queueing pipeline runs and exposing the polling surface.
pub struct JobService {
    registry: Arc<JobRegistry>,
    config: Arc<Config>,
    queue: mpsc::Sender<QueuedJob>,
}

impl JobService {
    pub fn new(
        registry: Arc<JobRegistry>,
        config: Arc<Config>,
        queue: mpsc::Sender<QueuedJob>,
    ) -> Self {
        Self {
            registry,
            config,
            queue,
        }
    }

    /// Accept an upload, allocate the job namespace and queue the pipeline.
    pub async fn submit(
        &self,
        files: Vec<TempFile>,
        job_id: Option<String>,
        scene: Option<String>,
        mode: Option<String>,
    ) -> Result<SubmitResponse, ServiceError> {
        if files.is_empty() {
            return Err(ServiceError::ValidationError("No files uploaded".to_string()));
        }
        let mode = parse_mode(mode)?;
        let job_id = match job_id {
            Some(raw) => sanitize_job_id(&raw),
            None => make_job_id("recon"),
        };
        let scene = scene.unwrap_or_else(|| job_id.clone());
        info!("Service: Submitting job {job_id} ({} files)", files.len());

        // Register first so a concurrent duplicate submit is refused before
        // either touches the filesystem.
        let cancel_rx = self
            .registry
            .register(&job_id, &scene, mode)
            .map_err(ServiceError::Conflict)?;

        let layout = self.registry.layout(&job_id);
        let save_layout = layout.clone();
        let saved = web::block(move || save_uploads(files, &save_layout))
            .await
            .map_err(|e| ServiceError::StorageError(e.to_string()))
            .and_then(|r| r.map_err(ServiceError::from));
        let saved = match saved {
            Ok(saved) => saved,
            Err(e) => {
                self.registry.forget(&job_id);
                return Err(e);
            }
        };
        if count_images(&layout.input_dir) == 0 {
            self.registry.forget(&job_id);
            return Err(ServiceError::ValidationError(
                "Upload contained no images".to_string(),
            ));
        }

        self.enqueue(&job_id, mode, cancel_rx).await?;
        Ok(SubmitResponse {
            message: "Job accepted".to_string(),
            job_id,
            scene,
            mode: mode.as_str().to_string(),
            saved_images: saved,
        })
    }

    /// Queue another pipeline run over an already-uploaded dataset.
    pub async fn rerun(
        &self,
        job_id: &str,
        request: RerunRequest,
    ) -> Result<SubmitResponse, ServiceError> {
        require_canonical_id(job_id)?;
        let job_id = job_id.to_string();
        let layout = self.registry.layout(&job_id);
        if count_images(&layout.input_dir) == 0 {
            return Err(ServiceError::NotFound(job_id));
        }
        let mode = parse_mode(request.mode)?;
        let scene = request.scene.unwrap_or_else(|| job_id.clone());

        let cancel_rx = self
            .registry
            .register(&job_id, &scene, mode)
            .map_err(ServiceError::Conflict)?;
        self.enqueue(&job_id, mode, cancel_rx).await?;
        info!("Service: Job {job_id} queued for re-run");
        Ok(SubmitResponse {
            message: "Job queued for re-run".to_string(),
            job_id,
            scene,
            mode: mode.as_str().to_string(),
            saved_images: Vec::new(),
        })
    }

    async fn enqueue(
        &self,
        job_id: &str,
        mode: TrainerMode,
        cancel_rx: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), ServiceError> {
        let queued = QueuedJob {
            job_id: job_id.to_string(),
            mode,
            cancel_rx,
        };
        if self.queue.send(queued).await.is_err() {
            self.registry.forget(job_id);
            return Err(ServiceError::Unavailable);
        }
        Ok(())
    }

    pub fn get_status(&self, job_id: &str) -> Result<StatusResponse, ServiceError> {
        require_canonical_id(job_id)?;
        let layout = self.registry.layout(job_id);
        let job = self
            .registry
            .view(job_id)
            .ok_or_else(|| ServiceError::NotFound(job_id.to_string()))?;
        let zip_path = job
            .zip_available
            .then(|| layout.zip_path.display().to_string());
        Ok(StatusResponse {
            job,
            log_path: layout.log_file.display().to_string(),
            zip_path,
        })
    }

    pub fn list_jobs(&self) -> Vec<JobView> {
        self.registry.list()
    }

    pub fn delete(&self, job_id: &str) -> Result<DeleteResponse, ServiceError> {
        require_canonical_id(job_id)?;
        self.registry.delete(job_id)?;
        Ok(DeleteResponse {
            message: "Job deleted".to_string(),
            job_id: job_id.to_string(),
        })
    }

    pub fn cancel(&self, job_id: &str) -> Result<CancelResponse, ServiceError> {
        require_canonical_id(job_id)?;
        if self.registry.view(job_id).is_none() {
            return Err(ServiceError::NotFound(job_id.to_string()));
        }
        let signalled = self.registry.cancel(job_id);
        Ok(CancelResponse {
            message: if signalled {
                "Cancellation signalled".to_string()
            } else {
                "Job is not running".to_string()
            },
            job_id: job_id.to_string(),
            signalled,
        })
    }

    pub fn artifacts(&self, job_id: &str) -> Result<ArtifactsResponse, ServiceError> {
        require_canonical_id(job_id)?;
        if self.registry.view(job_id).is_none() {
            return Err(ServiceError::NotFound(job_id.to_string()));
        }
        let layout = self.registry.layout(job_id);
        let found = artifacts::locate(&layout.output_dir);
        Ok(ArtifactsResponse {
            point_cloud_path: found.point_cloud.map(|p| p.display().to_string()),
            cameras_path: found.cameras.map(|p| p.display().to_string()),
        })
    }

    /// Tail of the job's combined log; readable while the job is running.
    pub async fn read_log(&self, job_id: &str, tail_bytes: u64) -> Result<String, ServiceError> {
        require_canonical_id(job_id)?;
        let layout = self.registry.layout(job_id);
        let mut file = tokio::fs::File::open(&layout.log_file)
            .await
            .map_err(|_| ServiceError::NotFound(job_id.to_string()))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| ServiceError::StorageError(e.to_string()))?
            .len();
        if len > tail_bytes {
            file.seek(std::io::SeekFrom::Start(len - tail_bytes))
                .await
                .map_err(|e| ServiceError::StorageError(e.to_string()))?;
        }
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| ServiceError::StorageError(e.to_string()))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// The archived output tree, for download.
    pub async fn read_archive(&self, job_id: &str) -> Result<Vec<u8>, ServiceError> {
        require_canonical_id(job_id)?;
        let layout = self.registry.layout(job_id);
        tokio::fs::read(&layout.zip_path)
            .await
            .map_err(|_| ServiceError::NotFound(job_id.to_string()))
    }

    pub fn max_log_tail_default() -> u64 {
        64 * 1024
    }
}

/// Path-derived job ids must already be in canonical form. Anything the
/// sanitizer would alter (separators, dots, control characters) cannot name
/// a job namespace, so it is treated as unknown rather than resolved into
/// a filesystem path.
fn require_canonical_id(job_id: &str) -> Result<(), ServiceError> {
    if sanitize_job_id(job_id) != job_id {
        return Err(ServiceError::NotFound(job_id.to_string()));
    }
    Ok(())
}

fn parse_mode(mode: Option<String>) -> Result<TrainerMode, ServiceError> {
    match mode {
        Some(raw) => TrainerMode::parse(&raw)
            .ok_or_else(|| ServiceError::ValidationError(format!("Unknown mode: {raw}"))),
        None => Ok(TrainerMode::default()),
    }
}

/// Move uploaded files into the job's input directory.
///
/// File names are reduced to their basename; a single `.zip` upload is
/// treated as a packaged dataset and extracted with structure preserved.
/// Returns the names of the saved entries.
fn save_uploads(files: Vec<TempFile>, layout: &JobLayout) -> Result<Vec<String>, PipelineError> {
    layout
        .ensure_dirs()
        .map_err(|e| PipelineError::io(&layout.input_dir, e))?;
    let mut saved = Vec::new();
    for upload in files {
        let name = upload
            .file_name
            .as_deref()
            .map(basename)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "upload.bin".to_string());
        let temp_path = upload.file.path().to_path_buf();
        if name.to_ascii_lowercase().ends_with(".zip") {
            archive::extract_zip(&temp_path, &layout.input_dir)?;
        } else {
            let dest = layout.input_dir.join(&name);
            fs::copy(&temp_path, &dest).map_err(|e| PipelineError::io(&dest, e))?;
        }
        saved.push(name);
    }
    Ok(saved)
}

fn basename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn count_images(dir: &Path) -> usize {
    fn walk(dir: &Path, count: &mut usize) {
        let Ok(entries) = fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, count);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
            {
                *count += 1;
            }
        }
    }
    let mut count = 0;
    walk(dir, &mut count);
    count
}
