use anyhow::{anyhow, Context, Result};
use std::{env, net::SocketAddr, path::PathBuf, str::FromStr};

use crate::inference::SamplingParams;

pub const DEFAULT_MODEL_ID: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
pub const DEFAULT_MAX_NEW_TOKENS_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelDType {
    F32,
    F16,
    BF16,
}

impl ModelDType {
    pub fn as_candle(self) -> candle::DType {
        match self {
            ModelDType::F32 => candle::DType::F32,
            ModelDType::F16 => candle::DType::F16,
            ModelDType::BF16 => candle::DType::BF16,
        }
    }
}

impl FromStr for ModelDType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(ModelDType::F32),
            "f16" | "float16" => Ok(ModelDType::F16),
            "bf16" | "bfloat16" => Ok(ModelDType::BF16),
            other => Err(anyhow!("unsupported dtype `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
}

impl FromStr for DeviceSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(0)),
            other => {
                let ordinal = other
                    .strip_prefix("cuda:")
                    .ok_or_else(|| anyhow!("unsupported device `{other}`"))?;
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|e| anyhow!("invalid cuda ordinal `{ordinal}`: {e}"))?;
                Ok(DeviceSpec::Cuda(ordinal))
            }
        }
    }
}

/// Where and how the model is loaded. Fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model_id: String,
    pub revision: String,
    /// Local snapshot holding `config.json`, `tokenizer.json` and
    /// `model.safetensors`. Skips the hub entirely when set.
    pub model_dir: Option<PathBuf>,
    pub device: DeviceSpec,
    pub dtype: ModelDType,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub model: ModelSettings,
    pub sampling: SamplingParams,
    pub max_new_tokens_limit: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so it can be exercised
    /// without touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = parse_or(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?;

        let model = ModelSettings {
            model_id: lookup("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            revision: lookup("MODEL_REVISION").unwrap_or_else(|| "main".to_string()),
            model_dir: lookup("MODEL_DIR")
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            device: parse_or(&lookup, "MODEL_DEVICE", DeviceSpec::Cpu)?,
            dtype: parse_or(&lookup, "MODEL_DTYPE", ModelDType::F32)?,
        };

        let defaults = SamplingParams::default();
        let sampling = SamplingParams {
            temperature: parse_or(&lookup, "TEMPERATURE", defaults.temperature)?,
            top_p: parse_or(&lookup, "TOP_P", defaults.top_p)?,
            do_sample: parse_or(&lookup, "DO_SAMPLE", defaults.do_sample)?,
            seed: parse_or(&lookup, "SEED", rand::random::<u64>())?,
        };

        if !(sampling.top_p > 0.0 && sampling.top_p <= 1.0) {
            return Err(anyhow!("TOP_P must be in (0, 1], got {}", sampling.top_p));
        }
        if sampling.temperature < 0.0 {
            return Err(anyhow!(
                "TEMPERATURE must not be negative, got {}",
                sampling.temperature
            ));
        }

        let max_new_tokens_limit =
            parse_or(&lookup, "MAX_NEW_TOKENS_LIMIT", DEFAULT_MAX_NEW_TOKENS_LIMIT)?;
        if max_new_tokens_limit == 0 {
            return Err(anyhow!("MAX_NEW_TOKENS_LIMIT must be at least 1"));
        }

        Ok(Self {
            bind_addr,
            model,
            sampling,
            max_new_tokens_limit,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: `{raw}`")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_tinyllama_on_cpu() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8000);
        assert_eq!(cfg.model.model_id, DEFAULT_MODEL_ID);
        assert_eq!(cfg.model.revision, "main");
        assert!(cfg.model.model_dir.is_none());
        assert_eq!(cfg.model.device, DeviceSpec::Cpu);
        assert_eq!(cfg.model.dtype, ModelDType::F32);
        assert_eq!(cfg.sampling.temperature, 0.7);
        assert_eq!(cfg.sampling.top_p, 0.9);
        assert!(cfg.sampling.do_sample);
        assert_eq!(cfg.max_new_tokens_limit, DEFAULT_MAX_NEW_TOKENS_LIMIT);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config_from(&[
            ("BIND_ADDR", "127.0.0.1:9090"),
            ("MODEL_DIR", "models/tinyllama"),
            ("MODEL_DEVICE", "cuda:1"),
            ("MODEL_DTYPE", "bf16"),
            ("DO_SAMPLE", "false"),
            ("SEED", "42"),
            ("MAX_NEW_TOKENS_LIMIT", "256"),
        ])
        .unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.model.model_dir, Some(PathBuf::from("models/tinyllama")));
        assert_eq!(cfg.model.device, DeviceSpec::Cuda(1));
        assert_eq!(cfg.model.dtype, ModelDType::BF16);
        assert!(!cfg.sampling.do_sample);
        assert_eq!(cfg.sampling.seed, 42);
        assert_eq!(cfg.max_new_tokens_limit, 256);
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = config_from(&[("TOP_P", "lots")]).unwrap_err();
        assert!(format!("{err:#}").contains("TOP_P"));

        assert!(config_from(&[("TOP_P", "1.5")]).is_err());
        assert!(config_from(&[("MAX_NEW_TOKENS_LIMIT", "0")]).is_err());
        assert!(config_from(&[("MODEL_DEVICE", "tpu")]).is_err());
    }
}
