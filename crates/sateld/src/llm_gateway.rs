use std::fmt;
use std::fs::{create_dir_all, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use satele_core::config::{AppConfig, GeminiConfig, OllamaConfig};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::text::truncate_for_log;
use crate::usage::UsageLedger;

const LLM_RETRY_TIMES: usize = 2;
const INLINE_MEDIA_MAX_BYTES: u64 = 15 * 1024 * 1024;
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone)]
pub enum ProviderError {
    Retryable(String),
    NonRetryable(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Retryable(msg) | ProviderError::NonRetryable(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Image,
}

/// A media file submitted alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: PathBuf,
    pub mime_type: String,
    pub kind: MediaKind,
}

impl Attachment {
    /// Audio or image files only; anything else is not sent to the model.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        let (mime, kind) = match ext.as_str() {
            "ogg" | "oga" | "opus" => ("audio/ogg", MediaKind::Audio),
            "mp3" => ("audio/mpeg", MediaKind::Audio),
            "wav" => ("audio/wav", MediaKind::Audio),
            "m4a" => ("audio/mp4", MediaKind::Audio),
            "jpg" | "jpeg" => ("image/jpeg", MediaKind::Image),
            "png" => ("image/png", MediaKind::Image),
            "webp" => ("image/webp", MediaKind::Image),
            _ => return None,
        };
        Some(Self {
            path: path.to_path_buf(),
            mime_type: mime.to_string(),
            kind,
        })
    }
}

/// An attachment in the form a backend sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPart {
    /// Uploaded out of band and referenced by uri.
    Remote { mime_type: String, uri: String },
    /// Base64 payload carried in the request body.
    Inline { mime_type: String, data: String },
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest<'a> {
    pub system: &'a str,
    pub prompt: &'a str,
    pub attachments: &'a [Attachment],
    /// Filled by the gateway from `LanguageModel::prepare_media`.
    pub media: &'a [MediaPart],
    pub max_output_tokens: Option<u32>,
}

/// One text-generation backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn supports_media(&self) -> bool {
        false
    }
    /// Runs once per request, outside the retry loop.
    async fn prepare_media(&self, _attachments: &[Attachment]) -> Vec<MediaPart> {
        Vec::new()
    }
    async fn generate(&self, req: &GenerateRequest<'_>) -> Result<String, ProviderError>;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Ordered backends: the configured provider first, then its fallback.
#[derive(Clone)]
pub struct LlmGateway {
    backends: Vec<Arc<dyn LanguageModel>>,
    model_io_log: Option<PathBuf>,
}

impl LlmGateway {
    pub fn new(backends: Vec<Arc<dyn LanguageModel>>, model_io_log: Option<PathBuf>) -> Self {
        Self {
            backends,
            model_io_log,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let usage = UsageLedger::new(config.usage_file());
        let gemini = config.llm.gemini.is_configured().then(|| {
            Arc::new(GeminiBackend::new(config.llm.gemini.clone(), Some(usage.clone())))
                as Arc<dyn LanguageModel>
        });
        let provider = config.llm.provider.trim().to_lowercase();
        let ollama_selected = matches!(provider.as_str(), "ollama" | "local");
        let ollama = (ollama_selected || config.llm.ollama.enabled).then(|| {
            Arc::new(OllamaBackend::new(config.llm.ollama.clone())) as Arc<dyn LanguageModel>
        });

        let (primary, secondary) = match provider.as_str() {
            "gemini" | "google" | "cloud" => (gemini, ollama),
            "ollama" | "local" => (ollama, gemini),
            other => {
                warn!("unsupported llm provider={other}, trying gemini then ollama");
                (gemini, ollama)
            }
        };
        let mut backends = Vec::new();
        if let Some(p) = primary {
            backends.push(p);
        }
        if let Some(s) = secondary {
            if config.llm.fallback_enabled || backends.is_empty() {
                backends.push(s);
            }
        }
        for b in &backends {
            info!("llm backend: name={} model={}", b.name(), b.model());
        }
        Self::new(backends, Some(config.logs_dir().join("model_io.log")))
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn describe(&self) -> String {
        if self.backends.is_empty() {
            return "none".to_string();
        }
        self.backends
            .iter()
            .map(|b| format!("{}:{}", b.name(), b.model()))
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    pub fn primary_supports_media(&self) -> bool {
        self.backends.first().is_some_and(|b| b.supports_media())
    }

    /// Try each backend in order; the first usable reply wins.
    pub async fn generate(&self, stage: &str, req: &GenerateRequest<'_>) -> Result<String, String> {
        if self.backends.is_empty() {
            return Err("No available LLM backend configured".to_string());
        }
        let mut last_error = "unknown llm error".to_string();
        for backend in &self.backends {
            let label = format!("{}:{}", backend.name(), backend.model());
            info!(
                "[LLM_CALL] stage={stage} backend={label} attachments={} prompt={}",
                req.attachments.len(),
                truncate_for_log(req.prompt)
            );
            let media = if req.attachments.is_empty() {
                Vec::new()
            } else {
                backend.prepare_media(req.attachments).await
            };
            let prepared = GenerateRequest {
                media: &media,
                ..req.clone()
            };
            match call_with_retry(backend.as_ref(), &prepared).await {
                Ok(text) => {
                    info!(
                        "[LLM_CALL] stage={stage} backend={label} response={}",
                        truncate_for_log(&text)
                    );
                    self.append_model_io_log(
                        stage,
                        backend.as_ref(),
                        "ok",
                        req.prompt,
                        Some(text.as_str()),
                        None,
                    );
                    return Ok(text);
                }
                Err(err) => {
                    last_error = format!("backend={label} failed: {err}");
                    warn!("[LLM_CALL] stage={stage} {last_error}");
                    self.append_model_io_log(
                        stage,
                        backend.as_ref(),
                        "failed",
                        req.prompt,
                        None,
                        Some(last_error.as_str()),
                    );
                }
            }
        }
        Err(last_error)
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let mut last_error = "no backend can embed".to_string();
        for backend in &self.backends {
            match backend.embed(text).await {
                Ok(v) if !v.is_empty() => return Ok(v),
                Ok(_) => last_error = format!("{} returned an empty embedding", backend.name()),
                Err(err) => last_error = format!("{} embed failed: {err}", backend.name()),
            }
        }
        Err(last_error)
    }

    fn append_model_io_log(
        &self,
        stage: &str,
        backend: &dyn LanguageModel,
        status: &str,
        prompt: &str,
        response: Option<&str>,
        error: Option<&str>,
    ) {
        let Some(file_path) = &self.model_io_log else {
            return;
        };
        if let Some(dir) = file_path.parent() {
            if let Err(err) = create_dir_all(dir) {
                warn!("create model io logs dir failed: {err}");
                return;
            }
        }
        let mut file = match OpenOptions::new().create(true).append(true).open(file_path) {
            Ok(f) => f,
            Err(err) => {
                warn!("open model io log file failed: {err}");
                return;
            }
        };
        let line = json!({
            "ts": chrono::Local::now().to_rfc3339(),
            "stage": stage,
            "backend": backend.name(),
            "model": backend.model(),
            "status": status,
            "prompt": truncate_for_log(prompt),
            "response": response.map(truncate_for_log),
            "error": error.map(truncate_for_log),
        })
        .to_string();
        if let Err(err) = writeln!(file, "{line}") {
            warn!("write model io log failed: {err}");
        }
    }
}

async fn call_with_retry(
    backend: &dyn LanguageModel,
    req: &GenerateRequest<'_>,
) -> Result<String, ProviderError> {
    let mut attempts = 0usize;
    loop {
        attempts += 1;
        match backend.generate(req).await {
            Ok(text) => return Ok(text),
            Err(ProviderError::Retryable(err)) => {
                if attempts > LLM_RETRY_TIMES {
                    return Err(ProviderError::Retryable(err));
                }
                tokio::time::sleep(Duration::from_millis(250 * attempts as u64)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// The url is dropped from the message; it may carry credentials.
fn send_error(err: reqwest::Error) -> ProviderError {
    let err = err.without_url();
    if err.is_timeout() {
        ProviderError::Retryable(format!("timeout: {err}"))
    } else {
        ProviderError::Retryable(format!("request failed: {err}"))
    }
}

async fn read_json_response(resp: reqwest::Response) -> Result<Value, ProviderError> {
    let status = resp.status();
    let body_text = resp
        .text()
        .await
        .map_err(|err| ProviderError::Retryable(format!("read response failed: {err}")))?;
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(ProviderError::Retryable(format!(
            "http {}: {}",
            status.as_u16(),
            truncate_for_log(&body_text)
        )));
    }
    if !status.is_success() {
        return Err(ProviderError::NonRetryable(format!(
            "http {}: {}",
            status.as_u16(),
            truncate_for_log(&body_text)
        )));
    }
    serde_json::from_str(&body_text)
        .map_err(|err| ProviderError::NonRetryable(format!("parse response failed: {err}")))
}

/// Managed cloud backend (Gemini `generateContent`).
pub struct GeminiBackend {
    config: GeminiConfig,
    client: Client,
    usage: Option<UsageLedger>,
}

impl GeminiBackend {
    pub fn new(config: GeminiConfig, usage: Option<UsageLedger>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            usage,
        }
    }

    /// Upload one file through the Files API; the returned part references it by uri.
    async fn upload_file(&self, attachment: &Attachment) -> Result<MediaPart, ProviderError> {
        let bytes = tokio::fs::read(&attachment.path)
            .await
            .map_err(|err| ProviderError::NonRetryable(format!("read media failed: {err}")))?;
        let url = format!("{}/files", self.config.upload_base_url.trim_end_matches('/'));
        let resp = self
            .post(url)
            .header("X-Goog-Upload-Protocol", "raw")
            .header("Content-Type", attachment.mime_type.as_str())
            .body(bytes)
            .send()
            .await
            .map_err(send_error)?;
        let value = read_json_response(resp).await?;
        let uri = value
            .get("file")
            .and_then(|f| f.get("uri"))
            .and_then(|u| u.as_str())
            .ok_or_else(|| ProviderError::NonRetryable("upload response missing file.uri".to_string()))?;
        Ok(MediaPart::Remote {
            mime_type: attachment.mime_type.clone(),
            uri: uri.to_string(),
        })
    }

    async fn media_part(&self, attachment: &Attachment) -> Option<MediaPart> {
        match self.upload_file(attachment).await {
            Ok(part) => return Some(part),
            Err(err) => warn!("media upload failed for {}: {err}", attachment.path.display()),
        }
        let size = tokio::fs::metadata(&attachment.path).await.ok()?.len();
        if size > INLINE_MEDIA_MAX_BYTES {
            warn!(
                "media too large to inline ({size} bytes), continuing text-only: {}",
                attachment.path.display()
            );
            return None;
        }
        let bytes = tokio::fs::read(&attachment.path).await.ok()?;
        Some(MediaPart::Inline {
            mime_type: attachment.mime_type.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header(API_KEY_HEADER, self.config.api_key.as_str())
    }

    fn record_usage(&self, value: &Value) {
        let (Some(ledger), Some(meta)) = (&self.usage, value.get("usageMetadata")) else {
            return;
        };
        let field = |k: &str| meta.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
        ledger.record(
            field("promptTokenCount"),
            field("candidatesTokenCount"),
            field("totalTokenCount"),
        );
    }
}

#[async_trait]
impl LanguageModel for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn supports_media(&self) -> bool {
        true
    }

    async fn prepare_media(&self, attachments: &[Attachment]) -> Vec<MediaPart> {
        let mut parts = Vec::new();
        for attachment in attachments {
            if let Some(part) = self.media_part(attachment).await {
                parts.push(part);
            }
        }
        parts
    }

    async fn generate(&self, req: &GenerateRequest<'_>) -> Result<String, ProviderError> {
        let mut parts = Vec::new();
        if !req.system.trim().is_empty() {
            parts.push(json!({ "text": req.system }));
        }
        parts.push(json!({ "text": req.prompt }));
        parts.extend(req.media.iter().map(gemini_media_json));
        let mut body = json!({ "contents": [{ "role": "user", "parts": parts }] });
        if let Some(max) = req.max_output_tokens {
            body["generationConfig"] = json!({ "maxOutputTokens": max });
        }
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );
        let resp = self.post(url).json(&body).send().await.map_err(send_error)?;
        let value = read_json_response(resp).await?;
        self.record_usage(&value);
        parse_gemini_text(&value, &self.config.model)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!(
            "{}/models/{}:embedContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.embedding_model
        );
        let body = json!({ "content": { "parts": [{ "text": text }] } });
        let resp = self.post(url).json(&body).send().await.map_err(send_error)?;
        let value = read_json_response(resp).await?;
        parse_embedding(value.get("embedding").and_then(|e| e.get("values")))
    }
}

fn gemini_media_json(part: &MediaPart) -> Value {
    match part {
        MediaPart::Remote { mime_type, uri } => json!({
            "file_data": { "mime_type": mime_type, "file_uri": uri }
        }),
        MediaPart::Inline { mime_type, data } => json!({
            "inline_data": { "mime_type": mime_type, "data": data }
        }),
    }
}

pub(crate) fn parse_gemini_text(value: &Value, model: &str) -> Result<String, ProviderError> {
    if let Some(block_reason) = value
        .get("promptFeedback")
        .and_then(|v| v.get("blockReason"))
        .and_then(|v| v.as_str())
    {
        return Err(ProviderError::NonRetryable(format!(
            "gemini prompt blocked: blockReason={block_reason}"
        )));
    }
    let first = value
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first());
    match first
        .and_then(|c| c.get("finishReason"))
        .and_then(|v| v.as_str())
    {
        Some("MAX_TOKENS") => warn!("gemini response truncated: finishReason=MAX_TOKENS model={model}"),
        Some(reason @ ("SAFETY" | "RECITATION")) => {
            return Err(ProviderError::NonRetryable(format!(
                "gemini response blocked: finishReason={reason} model={model}"
            )));
        }
        _ => {}
    }
    first
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|v| v.as_array())
        .and_then(|parts| {
            let merged: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
                .collect();
            (!merged.is_empty()).then_some(merged)
        })
        .ok_or_else(|| {
            ProviderError::NonRetryable("missing candidates[0].content.parts[*].text".to_string())
        })
}

/// Locally hosted backend (Ollama chat API). Text only.
pub struct OllamaBackend {
    config: OllamaConfig,
    host: String,
    client: Client,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .unwrap_or_default();
        Self {
            host: config.normalized_host(),
            config,
            client,
        }
    }
}

#[async_trait]
impl LanguageModel for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, req: &GenerateRequest<'_>) -> Result<String, ProviderError> {
        let mut messages = Vec::new();
        if !req.system.trim().is_empty() {
            messages.push(json!({ "role": "system", "content": req.system }));
        }
        messages.push(json!({ "role": "user", "content": req.prompt }));
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(max) = req.max_output_tokens {
            body["options"] = json!({ "num_predict": max });
        }
        let resp = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;
        let value = read_json_response(resp).await?;
        parse_ollama_chat(&value)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = json!({ "model": self.config.embedding_model, "prompt": text });
        let resp = self
            .client
            .post(format!("{}/api/embeddings", self.host))
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;
        let value = read_json_response(resp).await?;
        parse_embedding(value.get("embedding"))
    }
}

pub(crate) fn parse_ollama_chat(value: &Value) -> Result<String, ProviderError> {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProviderError::NonRetryable("missing message.content".to_string()))
}

fn parse_embedding(value: Option<&Value>) -> Result<Vec<f32>, ProviderError> {
    let arr = value
        .and_then(|v| v.as_array())
        .ok_or_else(|| ProviderError::NonRetryable("missing embedding values".to_string()))?;
    Ok(arr
        .iter()
        .filter_map(|x| x.as_f64())
        .map(|x| x as f32)
        .collect())
}
