use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Pin not found: {0}")]
    NotFoundPin(u32),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Config file error: {0}")]
    Config(String),
    #[error("Driver error: {0}")]
    Driver(String),
}

impl AppError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, AppError::Configuration(_))
    }

    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, AppError::InvalidOperation(_))
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFoundPin(_) => StatusCode::NOT_FOUND,
            AppError::Configuration(_) => StatusCode::CONFLICT,
            AppError::InvalidOperation(_) | AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_) | AppError::Driver(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
