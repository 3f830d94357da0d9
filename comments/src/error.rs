use std::collections::HashMap;

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::Value;

use crate::{comment::SubmissionError, source::SourceError, store::StoreError};

/// Errors returned by the comment engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("the comment engine has shut down")]
    EngineClosed,
}

#[derive(Debug)]
pub enum ServerError {
    SourceError(SourceError),
    EngineClosed,
}

impl Serialize for ServerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        use serde::ser::SerializeMap;
        let message = match self {
            ServerError::SourceError(e) => e.to_string(),
            ServerError::EngineClosed => Error::EngineClosed.to_string(),
        };
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("message", &message)?;
        map.end()
    }
}

/// Errors as seen by HTTP clients.
pub enum AppError {
    ServerError {
        error: ServerError,

        #[cfg(debug_assertions)]
        backtrace: Option<backtrace::Backtrace>,
    },
    WithStatus(String, StatusCode),
    Unhandled(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    msg: Option<String>,

    #[cfg(debug_assertions)]
    #[serde(skip_serializing_if = "Option::is_none")]
    debug_info: Option<HashMap<&'static str, Value>>,
}

impl ErrorResponse {
    fn new(code: &str, msg: String) -> Self {
        ErrorResponse {
            code: code.into(),
            msg: Some(msg),
            #[cfg(debug_assertions)]
            debug_info: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status_code, error_response) = match self {
            AppError::ServerError {
                error,
                #[cfg(debug_assertions)]
                backtrace,
            } => {
                tracing::error!(?error, "Server error while handling request");

                let status_code = match error {
                    ServerError::SourceError(_) => StatusCode::BAD_GATEWAY,
                    ServerError::EngineClosed => StatusCode::SERVICE_UNAVAILABLE,
                };

                #[allow(unused_mut)]
                let mut response = ErrorResponse::new("SERVER_ERR", "Internal server error".into());

                #[cfg(debug_assertions)]
                {
                    let frames_info = backtrace
                        .as_ref()
                        .map(filter_backtrace)
                        .unwrap_or_default();
                    response.debug_info = Some(HashMap::from([
                        (
                            "backtrace",
                            serde_json::to_value(&frames_info).unwrap_or_default(),
                        ),
                        ("error", serde_json::to_value(&error).unwrap_or_default()),
                    ]));
                }

                (status_code, response)
            }
            AppError::WithStatus(msg, status_code) => {
                (status_code, ErrorResponse::new("ERR", msg))
            }
            AppError::Unhandled(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("ERR", e),
            ),
        };

        (status_code, Json(error_response)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        match e {
            Error::Submission(e) => AppError::WithStatus(e.to_string(), StatusCode::BAD_REQUEST),
            Error::Store(e @ StoreError::OrphanReply { .. }) => {
                AppError::WithStatus(e.to_string(), StatusCode::UNPROCESSABLE_ENTITY)
            }
            Error::Store(e) => AppError::WithStatus(e.to_string(), StatusCode::CONFLICT),
            Error::Source(e) => AppError::server(ServerError::SourceError(e)),
            Error::EngineClosed => AppError::server(ServerError::EngineClosed),
        }
    }
}

impl From<SourceError> for AppError {
    fn from(e: SourceError) -> Self {
        Error::Source(e).into()
    }
}

impl AppError {
    fn server(error: ServerError) -> Self {
        AppError::ServerError {
            error,

            #[cfg(debug_assertions)]
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }
}

impl From<&'static str> for AppError {
    fn from(e: &'static str) -> Self {
        AppError::Unhandled(e.into())
    }
}

impl From<(&'static str, StatusCode)> for AppError {
    fn from((e, status_code): (&'static str, StatusCode)) -> Self {
        AppError::WithStatus(e.into(), status_code)
    }
}

impl From<(String, StatusCode)> for AppError {
    fn from((e, status_code): (String, StatusCode)) -> Self {
        AppError::WithStatus(e, status_code)
    }
}

#[cfg(debug_assertions)]
#[derive(Serialize, Debug)]
struct FrameInfo {
    name: String,
    loc: String,
}

#[cfg(debug_assertions)]
fn filter_backtrace(backtrace: &backtrace::Backtrace) -> Vec<FrameInfo> {
    const MODULE_PREFIX: &str = concat!(env!("CARGO_PKG_NAME"), "::");
    let mut frames_info: Vec<FrameInfo> = Vec::new();

    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            if let (Some(name), Some(filename), Some(lineno)) = (
                symbol.name().map(|n| n.to_string()),
                symbol.filename().map(|f| f.to_owned()),
                symbol.lineno(),
            ) {
                if name.contains(MODULE_PREFIX) {
                    frames_info.push(FrameInfo {
                        name,
                        loc: format!("{}:{}", filename.display(), lineno),
                    });
                }
            }
        }
    }

    frames_info
}
