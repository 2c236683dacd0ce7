use axum::{
    body::Body as AxumBody,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::core::{rewrite::RewriteError, route_table::RoutingError};

/// Non-standard status reported when the client went away before a response
/// was produced.
pub fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

/// Request-path failures and the status each one maps to.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Not found")]
    NotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Client closed request")]
    ClientClosedRequest,

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::ClientClosedRequest => client_closed_request(),
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body sent to the client. Internal details stay in the logs.
    fn public_message(&self) -> &'static str {
        match self {
            GatewayError::NotFound => "Not Found",
            GatewayError::MethodNotAllowed => "Method Not Allowed",
            GatewayError::ClientClosedRequest => "Client Closed Request",
            GatewayError::BadGateway(_) => "Bad Gateway",
            GatewayError::InternalError(_) => "Internal Server Error",
        }
    }
}

impl From<RoutingError> for GatewayError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::NotFound => GatewayError::NotFound,
            RoutingError::MethodNotAllowed => GatewayError::MethodNotAllowed,
        }
    }
}

impl From<RewriteError> for GatewayError {
    fn from(err: RewriteError) -> Self {
        GatewayError::InternalError(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<AxumBody> {
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.public_message(),
        )
            .into_response()
    }
}
