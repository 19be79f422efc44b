use std::sync::Arc;

use actix_web::{get, web, HttpResponse, Responder};
use serde::Serialize;
use tracing::error;

use crate::config::Config;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    gs_dir: String,
    tools: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Health check endpoint
///
/// Reports whether the configured external tool directories exist. Use for
/// load balancers and uptime monitors.
#[get("/health")]
async fn health_check(config: web::Data<Arc<Config>>) -> impl Responder {
    let gs_dir = config.tools.gaussian_dir.display().to_string();
    if config.tools.gaussian_dir.is_dir() && config.tools.trainer_dir.is_dir() {
        HttpResponse::Ok().json(HealthResponse {
            status: "healthy".to_string(),
            gs_dir,
            tools: "found".to_string(),
            error: None,
        })
    } else {
        error!("Health check failed: tool directories missing");
        HttpResponse::ServiceUnavailable().json(HealthResponse {
            status: "unhealthy".to_string(),
            gs_dir,
            tools: "missing".to_string(),
            error: Some("external tool directories not found".to_string()),
        })
    }
}

/// Readiness check endpoint
///
/// Checks that the data directories are in place, i.e. jobs can actually be
/// accepted and persisted.
#[get("/ready")]
async fn readiness_check(config: web::Data<Arc<Config>>) -> impl Responder {
    let ready = config.dirs.upload_dir.is_dir() && config.dirs.output_dir.is_dir();
    if ready {
        HttpResponse::Ok().json(serde_json::json!({ "status": "ready" }))
    } else {
        error!("Readiness check failed: data directories missing");
        HttpResponse::ServiceUnavailable().json(serde_json::json!({ "status": "not_ready" }))
    }
}

/// Liveness check endpoint
///
/// Simple check that the process is alive. Does not check dependencies.
#[get("/live")]
async fn liveness_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "alive" }))
}

pub fn health_config(config: &mut web::ServiceConfig) {
    config
        .service(health_check)
        .service(readiness_check)
        .service(liveness_check);
}
