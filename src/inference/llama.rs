use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fs, time::Instant};

use super::{GenerationParams, SamplingParams, TextGenerator};
use crate::config::{DeviceSpec, ModelSettings};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

// ---------------------------------------------------------
// Model files
// ---------------------------------------------------------
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: Vec<PathBuf>,
}

impl ModelFiles {
    fn from_dir(dir: &Path) -> Result<Self> {
        let index = dir.join(WEIGHTS_INDEX_FILE);
        let weights = if index.exists() {
            shards_from_index(&index, |file| Ok(dir.join(file)))?
        } else {
            vec![dir.join(WEIGHTS_FILE)]
        };

        for path in weights.iter() {
            if !path.exists() {
                return Err(anyhow!("missing weights file {}", path.display()));
            }
        }

        Ok(Self {
            config: dir.join(CONFIG_FILE),
            tokenizer: dir.join(TOKENIZER_FILE),
            weights,
        })
    }

    fn from_hub(model_id: &str, revision: &str) -> Result<Self> {
        let api = Api::new().context("failed to initialise hf-hub client")?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let config = repo
            .get(CONFIG_FILE)
            .with_context(|| format!("failed to fetch {CONFIG_FILE} for {model_id}"))?;
        let tokenizer = repo
            .get(TOKENIZER_FILE)
            .with_context(|| format!("failed to fetch {TOKENIZER_FILE} for {model_id}"))?;

        let weights = match repo.get(WEIGHTS_FILE) {
            Ok(path) => vec![path],
            Err(single_err) => {
                debug!(?single_err, "single safetensors file unavailable, trying index");
                let index = repo
                    .get(WEIGHTS_INDEX_FILE)
                    .with_context(|| format!("no safetensors weights found for {model_id}"))?;
                shards_from_index(&index, |file| {
                    repo.get(file)
                        .with_context(|| format!("failed to fetch shard {file}"))
                })?
            }
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

fn shards_from_index<F>(index_path: &Path, mut resolve: F) -> Result<Vec<PathBuf>>
where
    F: FnMut(&str) -> Result<PathBuf>,
{
    let index_json: serde_json::Value = serde_json::from_slice(&fs::read(index_path)?)?;

    let mut files = index_json["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("{}: weight_map is not an object", index_path.display()))?
        .values()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("invalid shard entry in {}", index_path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    files.sort();
    files.dedup();
    files.iter().map(|file| resolve(file)).collect()
}

fn select_device(spec: DeviceSpec) -> Result<Device> {
    match spec {
        DeviceSpec::Cpu => Ok(Device::Cpu),
        DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
            anyhow!(
                "failed to initialize CUDA device {ordinal} ({err}). Build with the `cuda` \
                 feature and ensure CUDA libraries are available."
            )
        }),
    }
}

// ---------------------------------------------------------
// Generator
// ---------------------------------------------------------

/// Llama-architecture chat model (TinyLlama by default) running on candle.
///
/// Weights are loaded once and only read afterwards; every call builds its
/// own KV cache, so concurrent calls never share mutable state.
pub struct LlamaGenerator {
    model_id: String,
    model: Llama,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    eos_tokens: Vec<u32>,
    calls: AtomicU64,
}

impl LlamaGenerator {
    pub fn load(settings: &ModelSettings) -> Result<Self> {
        let started = Instant::now();
        let device = select_device(settings.device)?;
        let dtype = settings.dtype.as_candle();

        let files = match &settings.model_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "loading model from local snapshot");
                ModelFiles::from_dir(dir)?
            }
            None => {
                info!(
                    model = %settings.model_id,
                    revision = %settings.revision,
                    "resolving model files from the hub"
                );
                ModelFiles::from_hub(&settings.model_id, &settings.revision)?
            }
        };

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Tokenizer error: {e}"))?;

        let llama_cfg: LlamaConfig = serde_json::from_slice(&fs::read(&files.config)?)
            .with_context(|| format!("invalid {}", files.config.display()))?;
        let config = llama_cfg.into_config(false);

        let eos_tokens = eos_token_ids(config.eos_token_id.as_ref(), &tokenizer);
        if eos_tokens.is_empty() {
            warn!("no EOS token found; generation will always run to max_new_tokens");
        }

        info!(shards = files.weights.len(), ?dtype, ?device, "mapping safetensors");
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = Llama::load(vb, &config)?;

        info!(
            model = %settings.model_id,
            layers = config.num_hidden_layers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );

        Ok(Self {
            model_id: settings.model_id.clone(),
            model,
            config,
            tokenizer,
            device,
            dtype,
            eos_tokens,
            calls: AtomicU64::new(0),
        })
    }

    fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        // The template already starts with `<s>`.
        let enc = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }
}

impl TextGenerator for LlamaGenerator {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let mut tokens = self.encode(prompt)?;
        let prompt_len = tokens.len();
        if prompt_len == 0 {
            return Err(anyhow!("prompt encoded to zero tokens"));
        }

        let context_limit = self.config.max_position_embeddings;
        if prompt_len >= context_limit {
            return Err(anyhow!(
                "prompt is {prompt_len} tokens, model context is {context_limit}"
            ));
        }
        let budget = params.max_new_tokens.min(context_limit - prompt_len);

        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let seed = params.sampling.seed.wrapping_add(call);
        let mut lp = LogitsProcessor::from_sampling(seed, sampling_for(&params.sampling));
        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;

        let mut pos = 0usize;
        for _ in 0..budget {
            // first step: whole prompt; later: last token only
            let ctx: &[u32] = if pos == 0 {
                &tokens
            } else {
                &tokens[tokens.len() - 1..]
            };

            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input, pos, &mut cache)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;

            pos += ctx.len();

            let next_id = lp.sample(&logits)?;
            if self.eos_tokens.contains(&next_id) {
                break;
            }
            tokens.push(next_id);
        }

        let gen_slice = &tokens[prompt_len..];
        debug!(
            prompt_tokens = prompt_len,
            new_tokens = gen_slice.len(),
            "decode loop done"
        );

        let continuation = self
            .tokenizer
            .decode(gen_slice, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {e}"))?;

        Ok(format!("{prompt}{continuation}"))
    }
}

fn sampling_for(params: &SamplingParams) -> Sampling {
    if !params.do_sample || params.temperature <= 1e-7 {
        return Sampling::ArgMax;
    }
    if params.top_p >= 1.0 {
        Sampling::All {
            temperature: params.temperature,
        }
    } else {
        Sampling::TopP {
            p: params.top_p,
            temperature: params.temperature,
        }
    }
}

fn eos_token_ids(configured: Option<&LlamaEosToks>, tokenizer: &Tokenizer) -> Vec<u32> {
    match configured {
        Some(LlamaEosToks::Single(id)) => vec![*id],
        Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
        None => tokenizer.token_to_id("</s>").into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelDType;
    use crate::prompts::{extract_response, format_prompt};

    #[test]
    fn greedy_when_sampling_disabled() {
        let params = SamplingParams {
            do_sample: false,
            ..SamplingParams::default()
        };
        assert!(matches!(sampling_for(&params), Sampling::ArgMax));

        let cold = SamplingParams {
            temperature: 0.0,
            ..SamplingParams::default()
        };
        assert!(matches!(sampling_for(&cold), Sampling::ArgMax));
    }

    #[test]
    fn nucleus_sampling_by_default() {
        match sampling_for(&SamplingParams::default()) {
            Sampling::TopP { p, temperature } => {
                assert_eq!(p, 0.9);
                assert_eq!(temperature, 0.7);
            }
            _ => panic!("expected top-p sampling"),
        }

        let full = SamplingParams {
            top_p: 1.0,
            ..SamplingParams::default()
        };
        assert!(matches!(sampling_for(&full), Sampling::All { .. }));
    }

    #[test]
    fn shard_index_is_deduplicated() {
        let dir = std::env::temp_dir().join(format!("instserve-index-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let index = dir.join(WEIGHTS_INDEX_FILE);
        fs::write(
            &index,
            r#"{"weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();

        let shards = shards_from_index(&index, |file| Ok(dir.join(file))).unwrap();
        assert_eq!(
            shards,
            vec![
                dir.join("model-00001.safetensors"),
                dir.join("model-00002.safetensors")
            ]
        );

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_local_weights_are_reported() {
        let dir = std::env::temp_dir().join(format!("instserve-empty-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let err = ModelFiles::from_dir(&dir).err().expect("expected an error");
        assert!(err.to_string().contains(WEIGHTS_FILE));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn run_tinyllama_smoke() {
        let snapshot = PathBuf::from("models/tinyllama");
        if !snapshot.join(WEIGHTS_FILE).exists() {
            eprintln!(
                "tinyllama snapshot missing under {}, skipping test",
                snapshot.display()
            );
            return;
        }

        let settings = ModelSettings {
            model_id: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".into(),
            revision: "main".into(),
            model_dir: Some(snapshot),
            device: DeviceSpec::Cpu,
            dtype: ModelDType::F32,
        };
        let generator = LlamaGenerator::load(&settings).expect("failed to load model");

        let formatted = format_prompt("Explain backpropagation in simple terms.").unwrap();
        let params = GenerationParams {
            max_new_tokens: 32,
            sampling: SamplingParams::default(),
        };
        let generated = generator.generate(&formatted, &params).expect("generation failed");
        assert!(generated.starts_with(&formatted));

        let answer = extract_response(&generated, &formatted).unwrap();
        assert!(!answer.is_empty());
        assert!(!answer.starts_with("<SYS>"));
        assert_eq!(answer, answer.trim());
    }
}
