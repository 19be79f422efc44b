use actix_web::HttpResponse;
use serde::Serialize;

/// The one error shape every endpoint returns.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub fields: serde_json::Value,
}

/// Configured JsonConfig with standardized error handling for the project
pub fn json_config() -> actix_web_validator::JsonConfig {
    actix_web_validator::JsonConfig::default().error_handler(|err, _req| {
        let response = match err {
            actix_web_validator::Error::Validate(validation_errors) => {
                let mut fields = serde_json::Map::new();
                for (field, errors) in validation_errors.field_errors() {
                    let messages: Vec<String> = errors
                        .iter()
                        .map(|e| {
                            e.message
                                .as_ref()
                                .map(|m| m.to_string())
                                .unwrap_or_else(|| format!("Validation error in field: {field}"))
                        })
                        .collect();
                    fields.insert(field.to_string(), serde_json::json!({ "errors": messages }));
                }
                ErrorResponse {
                    error: "Validation failed".to_string(),
                    fields: serde_json::Value::Object(fields),
                }
            }
            other => ErrorResponse {
                error: "Request validation failed".to_string(),
                fields: serde_json::json!({ "message": other.to_string() }),
            },
        };
        actix_web::error::InternalError::from_response(
            "",
            HttpResponse::BadRequest().json(response),
        )
        .into()
    })
}
