use std::io::Error as IoError;

use actix_web::http::StatusCode;
use actix_web::http::header::{self, HeaderValue};
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("{0:#}")]
    Io(#[from] IoError),
    #[error("invalid http_listen '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("https is not supported by the HTTP listener, use an http:// address")]
    TlsUnsupported,
    #[error("Unauthorized")]
    Unauthorized,
}

impl ResponseError for ListenerError {
    fn status_code(&self) -> StatusCode {
        match self {
            ListenerError::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        if matches!(self, ListenerError::Unauthorized) {
            response.insert_header((
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"picket\""),
            ));
        }
        response.body(self.to_string())
    }
}
