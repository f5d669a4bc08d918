use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::env;

const DEFAULT_PROMPT: &str = "Explain backpropagation in simple terms.";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let server = env::var("SERVER_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let max_new_tokens: i64 = match env::var("MAX_NEW_TOKENS") {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid MAX_NEW_TOKENS `{raw}`"))?,
        Err(_) => 100,
    };

    let prompt = env::args().skip(1).collect::<Vec<_>>().join(" ");
    let prompt = if prompt.trim().is_empty() {
        DEFAULT_PROMPT.to_string()
    } else {
        prompt
    };

    println!("prompt: {prompt}");

    let url = format!("{}/generate", server.trim_end_matches('/'));
    let res = reqwest::Client::new()
        .post(&url)
        .json(&json!({
            "prompt": prompt,
            "max_new_tokens": max_new_tokens,
        }))
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;

    let status = res.status();
    let body: Value = res.json().await.context("server replied with invalid JSON")?;

    if !status.is_success() {
        return Err(anyhow!("server returned {status}: {body}"));
    }

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
