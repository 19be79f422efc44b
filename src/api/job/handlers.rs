use actix_multipart::form::{tempfile::TempFile, text::Text, MultipartForm};
use actix_web::{
    delete, get, post,
    web::{Data, Path, Query, ServiceConfig},
    HttpResponse, Responder,
};
use serde::Deserialize;

use super::dto::RerunRequest;
use super::service::{JobService, ServiceError};

/// Multipart submission: one or more images, or a single zip of a dataset,
/// plus optional job metadata fields.
#[derive(Debug, MultipartForm)]
pub struct SubmitForm {
    #[multipart(rename = "files")]
    pub files: Vec<TempFile>,
    pub job_id: Option<Text<String>>,
    pub scene: Option<Text<String>>,
    pub mode: Option<Text<String>>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// How many bytes from the end of the log to return
    pub tail_bytes: Option<u64>,
}

#[post("")]
async fn submit_job(
    service: Data<JobService>,
    MultipartForm(form): MultipartForm<SubmitForm>,
) -> Result<impl Responder, ServiceError> {
    let response = service
        .submit(
            form.files,
            form.job_id.map(|t| t.into_inner()),
            form.scene.map(|t| t.into_inner()),
            form.mode.map(|t| t.into_inner()),
        )
        .await?;
    Ok(HttpResponse::Accepted().json(response))
}

#[get("")]
async fn list_jobs(service: Data<JobService>) -> impl Responder {
    HttpResponse::Ok().json(service.list_jobs())
}

#[get("/{job_id}")]
async fn job_status(
    service: Data<JobService>,
    path: Path<String>,
) -> Result<impl Responder, ServiceError> {
    Ok(HttpResponse::Ok().json(service.get_status(&path.into_inner())?))
}

#[post("/{job_id}/rerun")]
async fn rerun_job(
    service: Data<JobService>,
    path: Path<String>,
    request: actix_web_validator::Json<RerunRequest>,
) -> Result<impl Responder, ServiceError> {
    let response = service
        .rerun(&path.into_inner(), request.into_inner())
        .await?;
    Ok(HttpResponse::Accepted().json(response))
}

#[post("/{job_id}/cancel")]
async fn cancel_job(
    service: Data<JobService>,
    path: Path<String>,
) -> Result<impl Responder, ServiceError> {
    Ok(HttpResponse::Ok().json(service.cancel(&path.into_inner())?))
}

#[delete("/{job_id}")]
async fn delete_job(
    service: Data<JobService>,
    path: Path<String>,
) -> Result<impl Responder, ServiceError> {
    Ok(HttpResponse::Ok().json(service.delete(&path.into_inner())?))
}

#[get("/{job_id}/artifacts")]
async fn job_artifacts(
    service: Data<JobService>,
    path: Path<String>,
) -> Result<impl Responder, ServiceError> {
    Ok(HttpResponse::Ok().json(service.artifacts(&path.into_inner())?))
}

#[get("/{job_id}/log")]
async fn job_log(
    service: Data<JobService>,
    path: Path<String>,
    query: Query<LogQuery>,
) -> Result<impl Responder, ServiceError> {
    let tail = query
        .tail_bytes
        .unwrap_or_else(JobService::max_log_tail_default);
    let text = service.read_log(&path.into_inner(), tail).await?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(text))
}

#[get("/{job_id}/download")]
async fn download_archive(
    service: Data<JobService>,
    path: Path<String>,
) -> Result<impl Responder, ServiceError> {
    let job_id = path.into_inner();
    let bytes = service.read_archive(&job_id).await?;
    Ok(HttpResponse::Ok()
        .content_type("application/zip")
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{job_id}.zip\""),
        ))
        .body(bytes))
}

pub fn job_config(config: &mut ServiceConfig) {
    config.service(
        actix_web::web::scope("jobs")
            .service(submit_job)
            .service(list_jobs)
            .service(rerun_job)
            .service(cancel_job)
            .service(job_artifacts)
            .service(job_log)
            .service(download_archive)
            .service(job_status)
            .service(delete_job),
    );
}
