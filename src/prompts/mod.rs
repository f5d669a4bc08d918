use minijinja::{context, Environment};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const INST_END: &str = "[/INST]";

const INST_TEMPLATE_NAME: &str = "llama2_inst";

// The user prompt is inserted verbatim; delimiter-like text inside it is not
// escaped.
const INST_TEMPLATE: &str = "<s>[INST] <<SYS>>\n{{ system_prompt }}\n<</SYS>>\n\n{{ prompt }}[/INST]";

static TEMPLATE_ENV: OnceLock<Environment<'static>> = OnceLock::new();

static SYS_REMNANT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<SYS>\n?").expect("static regex is valid"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("generation output does not contain the instruction end marker `[/INST]`")]
    MissingInstructionEnd,
}

fn template_env() -> &'static Environment<'static> {
    TEMPLATE_ENV.get_or_init(|| {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.add_template(INST_TEMPLATE_NAME, INST_TEMPLATE)
            .expect("static chat template is valid");
        env
    })
}

/// Wraps a raw user prompt into the single-turn Llama-2 instruction template.
pub fn format_prompt(prompt: &str) -> Result<String, minijinja::Error> {
    template_env()
        .get_template(INST_TEMPLATE_NAME)?
        .render(context! {
            system_prompt => SYSTEM_PROMPT,
            prompt => prompt,
        })
}

/// Pulls the model's answer out of a full generation result.
///
/// The generator echoes the formatted prompt before its continuation. When the
/// echo is byte-exact it is sliced off. Otherwise the tokenizer has re-encoded
/// the prompt and the continuation starts after the n-th `[/INST]`, n being the
/// number of markers in `formatted` (user text may contain the marker too).
pub fn extract_response(generated: &str, formatted: &str) -> Result<String, ExtractError> {
    let continuation = match generated.strip_prefix(formatted) {
        Some(rest) => rest,
        None => after_instruction_end(generated, formatted.matches(INST_END).count())?,
    };

    Ok(strip_sys_remnant(continuation.trim()).trim().to_string())
}

fn after_instruction_end(generated: &str, occurrence: usize) -> Result<&str, ExtractError> {
    let occurrence = occurrence.max(1);
    generated
        .match_indices(INST_END)
        .nth(occurrence - 1)
        .map(|(idx, marker)| &generated[idx + marker.len()..])
        .ok_or(ExtractError::MissingInstructionEnd)
}

fn strip_sys_remnant(text: &str) -> &str {
    match SYS_REMNANT.find(text) {
        Some(m) => &text[m.end()..],
        None => text,
    }
}
