use serde::{de, Deserialize, Deserializer, Serialize};

pub const DEFAULT_MAX_NEW_TOKENS: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    // Signed so that zero and negative budgets reach the clamp instead of
    // failing deserialization.
    #[serde(default = "default_max_new_tokens", deserialize_with = "token_budget")]
    pub max_new_tokens: i64,
}

fn default_max_new_tokens() -> i64 {
    DEFAULT_MAX_NEW_TOKENS
}

/// Accepts integers and integral floats (`100.0`); fractional values are
/// rejected.
fn token_budget<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Budget {
        Int(i64),
        Float(f64),
    }

    match Budget::deserialize(deserializer)? {
        Budget::Int(n) => Ok(n),
        // `as` saturates, the clamp takes care of the rest.
        Budget::Float(f) if f.is_finite() && f.fract() == 0.0 => Ok(f as i64),
        Budget::Float(f) => Err(de::Error::custom(format!(
            "max_new_tokens must be an integer, got {f}"
        ))),
    }
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub response: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> serde_json::Result<GenerateRequest> {
        serde_json::from_str(raw)
    }

    #[test]
    fn max_new_tokens_defaults_to_100() {
        let req = parse(r#"{"prompt": "hi"}"#).unwrap();
        assert_eq!(req.prompt, "hi");
        assert_eq!(req.max_new_tokens, 100);
    }

    #[test]
    fn explicit_budget_is_kept() {
        let req = parse(r#"{"prompt": "hi", "max_new_tokens": -3}"#).unwrap();
        assert_eq!(req.max_new_tokens, -3);
    }

    #[test]
    fn integral_float_budget_is_accepted() {
        let req = parse(r#"{"prompt": "hi", "max_new_tokens": 100.0}"#).unwrap();
        assert_eq!(req.max_new_tokens, 100);

        let huge = parse(r#"{"prompt": "hi", "max_new_tokens": 1e30}"#).unwrap();
        assert_eq!(huge.max_new_tokens, i64::MAX);
    }

    #[test]
    fn fractional_or_textual_budget_is_rejected() {
        let err = parse(r#"{"prompt": "hi", "max_new_tokens": 1.5}"#).unwrap_err();
        assert!(err.to_string().contains("must be an integer"));

        assert!(parse(r#"{"prompt": "hi", "max_new_tokens": "lots"}"#).is_err());
    }

    #[test]
    fn prompt_is_required() {
        assert!(parse(r#"{"max_new_tokens": 5}"#).is_err());
    }
}
