use std::sync::OnceLock;

use regex::Regex;
use satele_core::config::ReasoningConfig;
use tracing::{info, warn};

use crate::llm_gateway::{GenerateRequest, LlmGateway};
use crate::text::truncate_with_suffix;

const REASONING_PROMPT_TEMPLATE: &str = include_str!("../../../prompts/reasoning_prompt.md");
const DATA_MARKERS: [&str; 3] = ["email id:", "subject:", "from:"];

fn analysis_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(summarize|analyze|extract|what|how|feedback|status|is|equity|balance|total|worth)\b")
            .expect("valid analysis regex")
    })
}

/// Second model pass that pulls one answer out of bulky command output.
#[derive(Debug, Clone)]
pub struct ReasoningPass {
    enabled: bool,
    min_output_chars: usize,
    substantial_chars: usize,
    max_input_chars: usize,
    max_answer_chars: usize,
}

impl ReasoningPass {
    pub fn from_config(cfg: &ReasoningConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            min_output_chars: cfg.min_output_chars,
            substantial_chars: cfg.substantial_chars,
            max_input_chars: cfg.max_input_chars,
            max_answer_chars: cfg.max_answer_chars,
        }
    }

    pub fn should_run(&self, instruction: &str, output: &str) -> bool {
        if !self.enabled || !analysis_regex().is_match(instruction) {
            return false;
        }
        let len = output.chars().count();
        if len <= self.min_output_chars {
            return false;
        }
        let lower = output.to_lowercase();
        DATA_MARKERS.iter().any(|m| lower.contains(m)) || len > self.substantial_chars
    }

    /// Returns the raw output unchanged if the model call fails.
    pub async fn analyze(&self, gateway: &LlmGateway, instruction: &str, output: &str) -> String {
        let data = truncate_with_suffix(output, self.max_input_chars, "...(truncated)...");
        let prompt = REASONING_PROMPT_TEMPLATE
            .replace("__DATA__", &data)
            .replace("__INSTRUCTION__", instruction);
        let req = GenerateRequest {
            prompt: &prompt,
            max_output_tokens: Some(256),
            ..Default::default()
        };
        info!("reasoning pass: extracting answer from {} chars", output.chars().count());
        match gateway.generate("reasoning", &req).await {
            Ok(answer) => truncate_with_suffix(answer.trim(), self.max_answer_chars, "..."),
            Err(err) => {
                warn!("reasoning pass failed, keeping raw output: {err}");
                output.to_string()
            }
        }
    }
}
