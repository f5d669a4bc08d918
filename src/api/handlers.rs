use axum::{extract::State, Json};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::{
    api::error::GenerationFailure,
    api::extract::JsonBody,
    api::types::{GenerateRequest, GenerateResponse, HealthResponse},
    app_state::AppState,
};

pub async fn generate_handler(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<GenerateRequest>,
) -> Result<Json<GenerateResponse>, GenerationFailure> {
    let request_id = Uuid::new_v4();
    let max = state.infer.clamp_max_new_tokens(req.max_new_tokens);

    let span = info_span!("generate", %request_id);
    async move {
        info!(
            prompt_bytes = req.prompt.len(),
            requested = req.max_new_tokens,
            max_new_tokens = max,
            "generate request"
        );

        let response = state.infer.respond(&req.prompt, max).await?;
        Ok::<_, GenerationFailure>(Json(GenerateResponse { response }))
    }
    .instrument(span)
    .await
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.infer.model_id().to_string(),
    })
}
