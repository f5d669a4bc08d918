use std::sync::Arc;

use crate::inference::InferenceService;

#[derive(Clone)]
pub struct AppState {
    pub infer: Arc<InferenceService>,
}

impl AppState {
    pub fn new(infer: InferenceService) -> Self {
        Self {
            infer: Arc::new(infer),
        }
    }
}
