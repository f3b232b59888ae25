use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::SateleError;

pub const DEFAULT_CONFIG_PATH: &str = "configs/config.toml";
pub const ENV_PREFIX: &str = "SATELE";
const MIN_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_base_url")]
    pub base_url: String,
    #[serde(default = "default_bridge_auth_token")]
    pub auth_token: String,
    #[serde(default = "default_bridge_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_bridge_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_bridge_error_backoff_seconds")]
    pub error_backoff_seconds: u64,
    #[serde(default = "default_bridge_handoff_marker")]
    pub handoff_marker: String,
    #[serde(default = "default_bridge_bot_name")]
    pub bot_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_base_url(),
            auth_token: default_bridge_auth_token(),
            request_timeout_seconds: default_bridge_request_timeout_seconds(),
            poll_interval_ms: default_bridge_poll_interval_ms(),
            error_backoff_seconds: default_bridge_error_backoff_seconds(),
            handoff_marker: default_bridge_handoff_marker(),
            bot_name: default_bridge_bot_name(),
        }
    }
}

impl BridgeConfig {
    /// Poll interval with the floor applied.
    pub fn effective_poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS)
    }
}

/// Filesystem locations. Empty strings are filled in by [`AppConfig::finalize`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PathsConfig {
    #[serde(default)]
    pub install_root: String,
    #[serde(default)]
    pub state_dir: String,
    #[serde(default)]
    pub default_cwd: String,
    #[serde(default)]
    pub control_script: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tools_shell")]
    pub shell: String,
    #[serde(default = "default_tools_cmd_timeout_seconds")]
    pub cmd_timeout_seconds: u64,
    #[serde(default = "default_tools_blocked_patterns")]
    pub blocked_patterns: Vec<String>,
    #[serde(default)]
    pub python_interpreter: Option<String>,
    #[serde(default = "default_tools_max_result_chars")]
    pub max_result_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell: default_tools_shell(),
            cmd_timeout_seconds: default_tools_cmd_timeout_seconds(),
            blocked_patterns: default_tools_blocked_patterns(),
            python_interpreter: None,
            max_result_chars: default_tools_max_result_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_host_home")]
    pub host_home: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            host_home: default_sandbox_host_home(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_fallback_enabled")]
    pub fallback_enabled: bool,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            fallback_enabled: default_llm_fallback_enabled(),
            gemini: GeminiConfig::default(),
            ollama: OllamaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_gemini_upload_base_url")]
    pub upload_base_url: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_gemini_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_gemini_base_url(),
            upload_base_url: default_gemini_upload_base_url(),
            model: default_gemini_model(),
            embedding_model: default_gemini_embedding_model(),
            timeout_seconds: default_gemini_timeout_seconds(),
        }
    }
}

impl GeminiConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ollama_host")]
    pub host: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default = "default_ollama_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_ollama_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            enabled: default_ollama_enabled(),
            host: default_ollama_host(),
            model: default_ollama_model(),
            embedding_model: default_ollama_embedding_model(),
            timeout_seconds: default_ollama_timeout_seconds(),
        }
    }
}

impl OllamaConfig {
    /// Host with a scheme, since operators often write `localhost:11434`.
    pub fn normalized_host(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SkillMode {
    #[default]
    Naive,
    Ranked,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "default_skills_dir")]
    pub dir: String,
    #[serde(default)]
    pub mode: SkillMode,
    #[serde(default = "default_skills_top_k")]
    pub top_k: usize,
    #[serde(default = "default_skills_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_skills_max_catalog_chars")]
    pub max_catalog_chars: usize,
    #[serde(default)]
    pub cache_file: String,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            dir: default_skills_dir(),
            mode: SkillMode::default(),
            top_k: default_skills_top_k(),
            min_similarity: default_skills_min_similarity(),
            max_catalog_chars: default_skills_max_catalog_chars(),
            cache_file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub sqlite_path: String,
    #[serde(default = "default_memory_recall_limit")]
    pub recall_limit: usize,
    #[serde(default = "default_memory_item_max_chars")]
    pub item_max_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_memory_enabled(),
            sqlite_path: String::new(),
            recall_limit: default_memory_recall_limit(),
            item_max_chars: default_memory_item_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default = "default_reasoning_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reasoning_min_output_chars")]
    pub min_output_chars: usize,
    #[serde(default = "default_reasoning_substantial_chars")]
    pub substantial_chars: usize,
    #[serde(default = "default_reasoning_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_reasoning_max_answer_chars")]
    pub max_answer_chars: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: default_reasoning_enabled(),
            min_output_chars: default_reasoning_min_output_chars(),
            substantial_chars: default_reasoning_substantial_chars(),
            max_input_chars: default_reasoning_max_input_chars(),
            max_answer_chars: default_reasoning_max_answer_chars(),
        }
    }
}

fn default_bridge_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_bridge_auth_token() -> String {
    "default-secret-key".to_string()
}

fn default_bridge_request_timeout_seconds() -> u64 {
    5
}

fn default_bridge_poll_interval_ms() -> u64 {
    2000
}

fn default_bridge_error_backoff_seconds() -> u64 {
    5
}

fn default_bridge_handoff_marker() -> String {
    "use gravity".to_string()
}

fn default_bridge_bot_name() -> String {
    "Satele".to_string()
}

fn default_tools_shell() -> String {
    "sh".to_string()
}

fn default_tools_cmd_timeout_seconds() -> u64 {
    180
}

fn default_tools_blocked_patterns() -> Vec<String> {
    vec![
        "> /dev/sda".to_string(),
        "rm -rf /".to_string(),
        "mkfs".to_string(),
    ]
}

fn default_tools_max_result_chars() -> usize {
    5000
}

fn default_sandbox_host_home() -> String {
    "/host_home".to_string()
}

fn default_llm_provider() -> String {
    "gemini".to_string()
}

fn default_llm_fallback_enabled() -> bool {
    true
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_gemini_upload_base_url() -> String {
    "https://generativelanguage.googleapis.com/upload/v1beta".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_gemini_embedding_model() -> String {
    "text-embedding-004".to_string()
}

fn default_gemini_timeout_seconds() -> u64 {
    60
}

fn default_ollama_enabled() -> bool {
    false
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "gemma:2b".to_string()
}

fn default_ollama_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_ollama_timeout_seconds() -> u64 {
    30
}

fn default_skills_dir() -> String {
    ".agent/skills".to_string()
}

fn default_skills_top_k() -> usize {
    5
}

fn default_skills_min_similarity() -> f32 {
    0.2
}

fn default_skills_max_catalog_chars() -> usize {
    6000
}

fn default_memory_enabled() -> bool {
    true
}

fn default_memory_recall_limit() -> usize {
    3
}

fn default_memory_item_max_chars() -> usize {
    2000
}

fn default_reasoning_enabled() -> bool {
    true
}

fn default_reasoning_min_output_chars() -> usize {
    20
}

fn default_reasoning_substantial_chars() -> usize {
    600
}

fn default_reasoning_max_input_chars() -> usize {
    12000
}

fn default_reasoning_max_answer_chars() -> usize {
    400
}

impl AppConfig {
    /// Load the TOML file (optional) layered with `SATELE__SECTION__KEY` env vars.
    pub fn load(path: &str) -> Result<Self, SateleError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Fill every empty path with its default, anchored at `start_dir`.
    pub fn finalize(mut self, start_dir: &Path) -> Self {
        let install_root = if self.paths.install_root.trim().is_empty() {
            start_dir.to_path_buf()
        } else {
            absolutize(start_dir, &self.paths.install_root)
        };
        let state_dir = if self.paths.state_dir.trim().is_empty() {
            install_root.join("brain")
        } else {
            absolutize(&install_root, &self.paths.state_dir)
        };
        let default_cwd = if self.paths.default_cwd.trim().is_empty() {
            install_root.clone()
        } else {
            absolutize(&install_root, &self.paths.default_cwd)
        };
        let control_script = if self.paths.control_script.trim().is_empty() {
            install_root.join("satele")
        } else {
            absolutize(&install_root, &self.paths.control_script)
        };
        if self.skills.cache_file.trim().is_empty() {
            self.skills.cache_file = path_string(&state_dir.join(".skill_index.json"));
        }
        if self.memory.sqlite_path.trim().is_empty() {
            self.memory.sqlite_path = path_string(&state_dir.join("satele_memory.db"));
        }
        self.paths.install_root = path_string(&install_root);
        self.paths.state_dir = path_string(&state_dir);
        self.paths.default_cwd = path_string(&default_cwd);
        self.paths.control_script = path_string(&control_script);
        self
    }

    pub fn install_root(&self) -> PathBuf {
        PathBuf::from(&self.paths.install_root)
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.state_dir)
    }

    pub fn default_cwd(&self) -> PathBuf {
        PathBuf::from(&self.paths.default_cwd)
    }

    pub fn control_script(&self) -> PathBuf {
        PathBuf::from(&self.paths.control_script)
    }

    pub fn skills_dir(&self) -> PathBuf {
        absolutize(&self.install_root(), &self.skills.dir)
    }

    pub fn cwd_state_file(&self) -> PathBuf {
        self.state_dir().join(".satele_cwd")
    }

    pub fn usage_file(&self) -> PathBuf {
        self.state_dir().join("token_usage.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }
}

fn absolutize(base: &Path, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw.trim());
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}

fn path_string(p: &Path) -> String {
    p.to_string_lossy().to_string()
}
