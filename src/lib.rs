#![warn(rust_2018_idioms)]

use actix_web::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ValidationError: {0}")]
    Validation(String),

    #[error("NotPermitted: {0}")]
    Authorization(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("EngineError ({status}): {message}")]
    Engine { status: u16, message: String },

    #[error("RegistrarError: {0}")]
    Registrar(String),

    #[error("SharedFsError ({status}): {path}")]
    SharedFs { status: u16, path: String },

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("InconsistentState: {0}")]
    Inconsistent(String),

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("DatabaseError: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("HttpError: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("VarError: {0}")]
    Var(#[from] std::env::VarError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// true for failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Unavailable(_) => true,
            Error::Engine { status, .. } | Error::SharedFs { status, .. } => *status >= 500,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Authorization(_) => StatusCode::FORBIDDEN,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Engine { .. }
            | Error::Registrar(_)
            | Error::SharedFs { .. }
            | Error::Http(_)
            | Error::Unavailable(_) => StatusCode::BAD_GATEWAY,
            Error::Canceled(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub use objects::{proxy::ProxyDefinition, server::ServerRecord, user::User};

pub mod codec;
pub mod compose;
pub mod fleet;
pub mod gateways;
pub mod helpers;
pub mod lifecycle;
pub mod objects;
pub mod ports;
pub mod settings;
pub mod store;

#[cfg(test)]
pub mod testutil;
