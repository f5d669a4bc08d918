use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

/// Every failure while serving a generation: template, model or extraction.
///
/// Callers only ever see a 500 with the error text as `detail`.
#[derive(Debug)]
pub struct GenerationFailure(anyhow::Error);

impl<E> From<E> for GenerationFailure
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for GenerationFailure {
    fn into_response(self) -> Response {
        error!(err = ?self.0, "generation failed");
        detail_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", self.0))
    }
}

/// A request body the `Json` extractor refused. Keeps axum's status code
/// (400, 415 or 422) but answers with a `detail` body.
#[derive(Debug)]
pub struct BodyRejection(JsonRejection);

impl From<JsonRejection> for BodyRejection {
    fn from(rejection: JsonRejection) -> Self {
        Self(rejection)
    }
}

impl IntoResponse for BodyRejection {
    fn into_response(self) -> Response {
        let status = self.0.status();
        let detail = self.0.body_text();
        warn!(%status, %detail, "rejected request body");
        detail_response(status, detail)
    }
}

fn detail_response(status: StatusCode, detail: String) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}
