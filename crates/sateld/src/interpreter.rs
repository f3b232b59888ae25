use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::llm_gateway::{Attachment, GenerateRequest, LlmGateway};
use crate::memory::{RecallStore, Role};
use crate::skills::SkillProvider;

const INTERPRETER_PROMPT_TEMPLATE: &str = include_str!("../../../prompts/interpreter_prompt.md");
const UNSUPPORTED_REPLY: &str = "UNSUPPORTED";

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("no language model is configured and no built-in shortcut matched")]
    NoBackend,
    #[error("language model failed: {0}")]
    Backend(String),
}

/// Facts about where commands will run, rendered into the prompt.
#[derive(Debug, Clone, Copy)]
pub struct Environment<'a> {
    pub cwd: &'a Path,
    pub home: &'a Path,
    pub host_home: Option<&'a Path>,
    pub bot_name: &'a str,
}

/// Turns one instruction into an ordered list of command lines.
pub struct Interpreter {
    gateway: LlmGateway,
    skills: SkillProvider,
    memory: Option<Arc<RecallStore>>,
    recall_limit: usize,
}

impl Interpreter {
    pub fn new(
        gateway: LlmGateway,
        skills: SkillProvider,
        memory: Option<Arc<RecallStore>>,
        recall_limit: usize,
    ) -> Self {
        Self {
            gateway,
            skills,
            memory,
            recall_limit,
        }
    }

    pub fn gateway(&self) -> &LlmGateway {
        &self.gateway
    }

    /// `Ok(vec![])` means the model answered but proposed nothing runnable.
    pub async fn interpret(
        &self,
        instruction: &str,
        media: Option<&Path>,
        env: &Environment<'_>,
    ) -> Result<Vec<String>, InterpretError> {
        if self.gateway.is_empty() {
            return match speed_dial(instruction) {
                Some(cmd) => {
                    info!("no model configured, using shortcut: {cmd}");
                    Ok(vec![cmd.to_string()])
                }
                None => Err(InterpretError::NoBackend),
            };
        }

        let query_embedding = if self.memory.is_some() {
            self.gateway.embed(instruction).await.ok()
        } else {
            None
        };
        let recalled = self.recall(instruction, query_embedding.as_deref());
        let skills = self.skills.lookup(Some(instruction), &self.gateway).await;
        let system = render_prompt(env, &skills, &recalled, media);

        let attachments: Vec<Attachment> = media
            .filter(|p| p.is_file())
            .and_then(Attachment::from_path)
            .into_iter()
            .collect();
        if !attachments.is_empty() && !self.gateway.primary_supports_media() {
            warn!("primary backend is text-only, media is used only if a fallback accepts it");
        }
        let prompt = format!("INSTRUCTION: {instruction}");
        let req = GenerateRequest {
            system: &system,
            prompt: &prompt,
            attachments: &attachments,
            ..Default::default()
        };
        let reply = self
            .gateway
            .generate("interpret", &req)
            .await
            .map_err(InterpretError::Backend)?;

        self.remember(instruction, &reply, env.cwd, query_embedding.as_deref())
            .await;

        let lines = clean_reply(&reply);
        if lines.first().is_some_and(|l| l.eq_ignore_ascii_case(UNSUPPORTED_REPLY)) {
            info!("model declined the instruction");
            return Ok(Vec::new());
        }
        Ok(lines)
    }

    fn recall(&self, instruction: &str, embedding: Option<&[f32]>) -> String {
        let Some(memory) = &self.memory else {
            return String::new();
        };
        match memory.recall(instruction, embedding, self.recall_limit) {
            Ok(hits) if !hits.is_empty() => {
                let lines: Vec<String> = hits.iter().map(ToString::to_string).collect();
                format!("\nPrevious relevant context:\n{}", lines.join("\n"))
            }
            Ok(_) => String::new(),
            Err(err) => {
                warn!("recall failed: {err}");
                String::new()
            }
        }
    }

    async fn remember(&self, instruction: &str, reply: &str, cwd: &Path, embedding: Option<&[f32]>) {
        let Some(memory) = &self.memory else {
            return;
        };
        let cwd = cwd.to_string_lossy();
        if let Err(err) = memory.remember(Role::User, &cwd, instruction, embedding) {
            warn!("memory save failed: {err}");
            return;
        }
        let reply_embedding = self.gateway.embed(reply).await.ok();
        if let Err(err) = memory.remember(Role::Assistant, &cwd, reply, reply_embedding.as_deref()) {
            warn!("memory save failed: {err}");
        }
    }
}

fn render_prompt(env: &Environment<'_>, skills: &str, recalled: &str, media: Option<&Path>) -> String {
    let media = media
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none)".to_string());
    INTERPRETER_PROMPT_TEMPLATE
        .replace("__BOT_NAME__", env.bot_name)
        .replace("__ENV_CONTEXT__", &environment_context(env))
        .replace("__SKILLS__", skills)
        .replace("__CWD__", &env.cwd.display().to_string())
        .replace("__MEDIA_PATH__", &media)
        .replace("__RECALLED_CONTEXT__", recalled)
}

fn environment_context(env: &Environment<'_>) -> String {
    match env.host_home {
        Some(host) => {
            let host = host.display();
            format!(
                "Environment:\n\
                 - You are running inside a container.\n\
                 - The user's real files are mounted at {host}. Treat it as the user's home.\n\
                 - Downloads: {host}/Downloads\n\
                 - Documents: {host}/Documents\n\
                 - When the user says \"home\" or \"cd ~\", use {host}. Ignore /root."
            )
        }
        None => {
            let home = env.home.display();
            format!(
                "Environment:\n\
                 - You are running natively on {}.\n\
                 - User home: {home}\n\
                 - Downloads: {home}/Downloads",
                std::env::consts::OS
            )
        }
    }
}

/// Split a model reply into command lines, dropping markdown artifacts.
pub fn clean_reply(reply: &str) -> Vec<String> {
    reply
        .replace("<br/>", "\n")
        .replace("<br />", "\n")
        .replace("<br>", "\n")
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("```"))
        .map(|line| line.replace('`', "").trim().to_string())
        .filter(|line| {
            !line.is_empty()
                && !matches!(line.to_lowercase().as_str(), "bash" | "sh" | "shell" | "zsh")
        })
        .collect()
}

/// Shortcuts used when no model backend is configured at all.
pub fn speed_dial(instruction: &str) -> Option<&'static str> {
    let lower = instruction.to_lowercase();
    if lower.contains("disk") {
        Some("df -h /")
    } else if lower.contains("uptime") {
        Some("uptime")
    } else if lower.contains("who am i") {
        Some("whoami")
    } else if lower.contains("list files") {
        Some("ls -F")
    } else {
        None
    }
}
