pub mod llama;

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::prompts::{extract_response, format_prompt};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub do_sample: bool,
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            do_sample: true,
            seed: 299792458,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub sampling: SamplingParams,
}

/// Blocking text generation backend.
///
/// Implementations return the prompt followed by the model's continuation,
/// the way a text-generation pipeline reports `generated_text`.
pub trait TextGenerator: Send + Sync {
    fn model_id(&self) -> &str;

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;
}

/// Formats a prompt, runs it through the generator and extracts the answer.
pub struct InferenceService {
    generator: Arc<dyn TextGenerator>,
    sampling: SamplingParams,
    max_new_tokens_limit: usize,
}

impl InferenceService {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        sampling: SamplingParams,
        max_new_tokens_limit: usize,
    ) -> Self {
        Self {
            generator,
            sampling,
            max_new_tokens_limit: max_new_tokens_limit.max(1),
        }
    }

    pub fn model_id(&self) -> &str {
        self.generator.model_id()
    }

    /// Clamps a caller-supplied budget into `[1, limit]`.
    pub fn clamp_max_new_tokens(&self, requested: i64) -> usize {
        let limit = self.max_new_tokens_limit;
        if requested < 1 {
            1
        } else {
            usize::try_from(requested).map_or(limit, |n| n.min(limit))
        }
    }

    pub async fn respond(&self, prompt: &str, max_new_tokens: usize) -> Result<String> {
        let formatted = format_prompt(prompt).context("failed to render chat template")?;
        let params = GenerationParams {
            max_new_tokens,
            sampling: self.sampling,
        };

        let started = Instant::now();
        let generator = self.generator.clone();
        let input = formatted.clone();
        let generated = tokio::task::spawn_blocking(move || generator.generate(&input, &params))
            .await
            .map_err(|e| anyhow!("generation task failed: {e}"))??;

        debug!(bytes = generated.len(), "raw generation output");

        let answer = extract_response(&generated, &formatted)?;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            answer_bytes = answer.len(),
            "generation finished"
        );

        Ok(answer)
    }
}
