use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::jobs::registry::JobView;

/// Response for a successfully accepted job
#[derive(Serialize)]
pub struct SubmitResponse {
    pub message: String,
    pub job_id: String,
    pub scene: String,
    pub mode: String,
    pub saved_images: Vec<String>,
}

/// Full polling view of one job
#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub job: JobView,
    pub log_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_path: Option<String>,
}

/// Resolved result file paths; fields are null until produced
#[derive(Serialize)]
pub struct ArtifactsResponse {
    pub point_cloud_path: Option<String>,
    pub cameras_path: Option<String>,
}

/// Re-run the pipeline on an already-uploaded dataset
#[derive(Debug, Deserialize, Validate)]
pub struct RerunRequest {
    #[validate(length(min = 1, max = 128, message = "Scene name must be 1-128 characters"))]
    pub scene: Option<String>,
    pub mode: Option<String>,
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub job_id: String,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub message: String,
    pub job_id: String,
    /// Whether a running pipeline actually received the signal
    pub signalled: bool,
}
