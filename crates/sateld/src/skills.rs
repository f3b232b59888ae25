use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use satele_core::config::{AppConfig, SkillMode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::llm_gateway::LlmGateway;
use crate::memory::cosine_similarity;

const SKILL_DOC_FILE: &str = "SKILL.md";
const CATALOG_HEADER: &str = "AVAILABLE SKILLS & CUSTOM SCRIPTS:\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillDescriptor {
    pub dir_name: String,
    pub name: String,
    pub description: String,
    pub commands: Vec<String>,
}

impl SkillDescriptor {
    fn embed_text(&self) -> String {
        format!("{}: {}", self.name, self.description)
    }

    fn render(&self) -> String {
        let mut out = format!("- {}: {}\n", self.name, self.description);
        for cmd in &self.commands {
            out.push_str(&format!("  COMMAND: {cmd}\n"));
        }
        out
    }
}

fn command_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"`((?:python3|python|bash|sh|node)\s+[^`\n]+)`").expect("valid skill command regex")
    })
}

fn relative_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(^|\s)((?:\./)?(?:\.agent|brain)/)").expect("valid relative path regex")
    })
}

/// Rewrite `.agent/...` and `brain/...` arguments so they resolve from anywhere.
pub fn absolutize_command(cmd: &str, install_root: &Path) -> String {
    let root = install_root.to_string_lossy();
    let root = root.trim_end_matches('/');
    relative_path_regex()
        .replace_all(cmd, |caps: &regex::Captures<'_>| {
            let rel = caps[2].trim_start_matches("./");
            format!("{}{root}/{rel}", &caps[1])
        })
        .to_string()
}

/// Parse one descriptor. Skills without a description or a runnable command are skipped.
pub fn parse_skill_doc(dir_name: &str, content: &str, install_root: &Path) -> Option<SkillDescriptor> {
    let mut name = dir_name.to_string();
    let mut description = String::new();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("name:") {
            name = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("description:") {
            description = rest.trim().to_string();
        }
    }
    let mut commands: Vec<String> = Vec::new();
    for caps in command_regex().captures_iter(content) {
        let cmd = absolutize_command(caps[1].trim(), install_root);
        if !commands.contains(&cmd) {
            commands.push(cmd);
        }
    }
    if description.is_empty() || commands.is_empty() {
        return None;
    }
    Some(SkillDescriptor {
        dir_name: dir_name.to_string(),
        name,
        description,
        commands,
    })
}

pub fn scan_skills(skills_dir: &Path, install_root: &Path) -> Vec<SkillDescriptor> {
    let entries = match fs::read_dir(skills_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("skills dir unreadable {}: {err}", skills_dir.display());
            return Vec::new();
        }
    };
    let mut skills = Vec::new();
    for entry in entries.flatten() {
        let dir_name = entry.file_name().to_string_lossy().to_string();
        let doc = entry.path().join(SKILL_DOC_FILE);
        let Ok(content) = fs::read_to_string(&doc) else {
            continue;
        };
        match parse_skill_doc(&dir_name, &content, install_root) {
            Some(skill) => skills.push(skill),
            None => warn!("skill {dir_name} has no description or command, skipped"),
        }
    }
    skills.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
    skills
}

/// Render whole entries until the character budget is spent.
pub fn render_catalog<'a, I>(skills: I, max_chars: usize) -> String
where
    I: IntoIterator<Item = &'a SkillDescriptor>,
{
    let mut out = CATALOG_HEADER.to_string();
    let mut any = false;
    for skill in skills {
        let block = skill.render();
        if out.chars().count() + block.chars().count() > max_chars {
            break;
        }
        out.push_str(&block);
        any = true;
    }
    if any {
        out
    } else {
        String::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SkillIndexCache {
    #[serde(default)]
    skills: BTreeMap<String, CachedSkill>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedSkill {
    text: String,
    embedding: Vec<f32>,
}

/// Builds the skill catalogue that goes into the interpreter prompt.
#[derive(Debug, Clone)]
pub struct SkillProvider {
    skills_dir: PathBuf,
    install_root: PathBuf,
    mode: SkillMode,
    top_k: usize,
    min_similarity: f32,
    max_catalog_chars: usize,
    cache_file: PathBuf,
}

impl SkillProvider {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            skills_dir: config.skills_dir(),
            install_root: config.install_root(),
            mode: config.skills.mode,
            top_k: config.skills.top_k.max(1),
            min_similarity: config.skills.min_similarity,
            max_catalog_chars: config.skills.max_catalog_chars,
            cache_file: PathBuf::from(&config.skills.cache_file),
        }
    }

    pub fn skills(&self) -> Vec<SkillDescriptor> {
        scan_skills(&self.skills_dir, &self.install_root)
    }

    /// Never fails: ranking problems fall back to the full listing.
    pub async fn lookup(&self, instruction: Option<&str>, gateway: &LlmGateway) -> String {
        let skills = self.skills();
        if skills.is_empty() {
            return String::new();
        }
        let query = instruction.map(str::trim).filter(|q| !q.is_empty());
        if let (SkillMode::Ranked, Some(query)) = (self.mode, query) {
            match self.rank(query, &skills, gateway).await {
                Ok(ranked) => {
                    info!("skills ranked: {} of {} matched", ranked.len(), skills.len());
                    return render_catalog(ranked, self.max_catalog_chars);
                }
                Err(err) => warn!("skill ranking unavailable, listing all skills: {err}"),
            }
        }
        render_catalog(&skills, self.max_catalog_chars)
    }

    async fn rank<'a>(
        &self,
        query: &str,
        skills: &'a [SkillDescriptor],
        gateway: &LlmGateway,
    ) -> Result<Vec<&'a SkillDescriptor>, String> {
        let query_vec = gateway.embed(query).await?;
        let mut cache = self.load_cache();
        let mut fresh = BTreeMap::new();
        let mut scored = Vec::new();
        for skill in skills {
            let text = skill.embed_text();
            let embedding = match cache.skills.remove(&skill.dir_name) {
                Some(hit) if hit.text == text => hit.embedding,
                _ => gateway.embed(&text).await?,
            };
            scored.push((cosine_similarity(&query_vec, &embedding), skill));
            fresh.insert(skill.dir_name.clone(), CachedSkill { text, embedding });
        }
        self.save_cache(&SkillIndexCache { skills: fresh });
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(self.top_k)
            .filter(|(score, _)| *score > self.min_similarity)
            .map(|(_, skill)| skill)
            .collect())
    }

    fn load_cache(&self) -> SkillIndexCache {
        fs::read_to_string(&self.cache_file)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_cache(&self, cache: &SkillIndexCache) {
        if let Some(parent) = self.cache_file.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("create skill cache dir failed: {err}");
                return;
            }
        }
        let result = serde_json::to_string(cache)
            .map_err(|e| e.to_string())
            .and_then(|body| fs::write(&self.cache_file, body).map_err(|e| e.to_string()));
        if let Err(err) = result {
            warn!("skill index cache write failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::llm_gateway::{GenerateRequest, LanguageModel, ProviderError};

    const WEATHER_DOC: &str = "---\nname: weather\ndescription: Current weather for a city\n---\nRun `python3 .agent/skills/weather/weather.py <city>`\n";
    const DISK_DOC: &str = "name: disk-report\ndescription: Disk usage report\n\n`bash brain/disk_report.sh`\n";

    struct KeywordEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for KeywordEmbedder {
        fn name(&self) -> &str {
            "kw"
        }

        fn model(&self) -> &str {
            "kw"
        }

        async fn generate(&self, _req: &GenerateRequest<'_>) -> Result<String, ProviderError> {
            Err(ProviderError::NonRetryable("embed only".to_string()))
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let t = text.to_lowercase();
            let has = |w: &str| if t.contains(w) { 1.0 } else { 0.0 };
            Ok(vec![has("weather"), has("disk"), 0.01])
        }
    }

    fn write_skill(root: &Path, dir: &str, doc: &str) {
        let skill_dir = root.join(".agent/skills").join(dir);
        fs::create_dir_all(&skill_dir).unwrap();
        fs::write(skill_dir.join(SKILL_DOC_FILE), doc).unwrap();
    }

    fn provider(root: &Path, mode: SkillMode) -> SkillProvider {
        let mut cfg = AppConfig::default().finalize(root);
        cfg.skills.mode = mode;
        cfg.skills.top_k = 1;
        SkillProvider::from_config(&cfg)
    }

    #[test]
    fn descriptor_commands_become_absolute() {
        let skill = parse_skill_doc("weather", WEATHER_DOC, Path::new("/opt/satele")).unwrap();
        assert_eq!(skill.name, "weather");
        assert_eq!(
            skill.commands,
            vec!["python3 /opt/satele/.agent/skills/weather/weather.py <city>".to_string()]
        );
        let disk = parse_skill_doc("disk", DISK_DOC, Path::new("/opt/satele/")).unwrap();
        assert_eq!(disk.commands, vec!["bash /opt/satele/brain/disk_report.sh".to_string()]);
    }

    #[test]
    fn descriptor_without_command_is_skipped() {
        assert!(parse_skill_doc("x", "description: nothing runnable\n", Path::new("/")).is_none());
        assert!(parse_skill_doc("x", "`python3 a.py`\n", Path::new("/")).is_none());
    }

    #[test]
    fn catalog_respects_budget() {
        let skill = parse_skill_doc("weather", WEATHER_DOC, Path::new("/r")).unwrap();
        let full = render_catalog([&skill], 6000);
        assert!(full.starts_with(CATALOG_HEADER));
        assert!(full.contains("- weather: Current weather for a city\n  COMMAND: python3 /r/"));
        assert_eq!(render_catalog([&skill], 40), "");
        assert_eq!(render_catalog(std::iter::empty(), 6000), "");
    }

    #[tokio::test]
    async fn naive_mode_lists_everything() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "weather", WEATHER_DOC);
        write_skill(dir.path(), "disk", DISK_DOC);
        let gateway = LlmGateway::new(Vec::new(), None);
        let catalog = provider(dir.path(), SkillMode::Naive)
            .lookup(Some("weather in paris"), &gateway)
            .await;
        assert!(catalog.contains("- weather:"));
        assert!(catalog.contains("- disk-report:"));
    }

    #[tokio::test]
    async fn ranked_mode_picks_closest_and_caches_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "weather", WEATHER_DOC);
        write_skill(dir.path(), "disk", DISK_DOC);
        let embedder = Arc::new(KeywordEmbedder {
            calls: AtomicUsize::new(0),
        });
        let gateway = LlmGateway::new(vec![embedder.clone() as Arc<dyn LanguageModel>], None);
        let skills = provider(dir.path(), SkillMode::Ranked);

        let catalog = skills.lookup(Some("what is the weather"), &gateway).await;
        assert!(catalog.contains("- weather:"));
        assert!(!catalog.contains("disk-report"));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);

        let catalog = skills.lookup(Some("disk usage please"), &gateway).await;
        assert!(catalog.contains("- disk-report:"));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    fn cached_keys(skills: &SkillProvider) -> Vec<String> {
        let raw = fs::read_to_string(&skills.cache_file).unwrap();
        let cache: SkillIndexCache = serde_json::from_str(&raw).unwrap();
        cache.skills.into_keys().collect()
    }

    #[tokio::test]
    async fn cache_follows_descriptor_edits_and_removals() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "weather", WEATHER_DOC);
        write_skill(dir.path(), "disk", DISK_DOC);
        let embedder = Arc::new(KeywordEmbedder {
            calls: AtomicUsize::new(0),
        });
        let gateway = LlmGateway::new(vec![embedder.clone() as Arc<dyn LanguageModel>], None);
        let skills = provider(dir.path(), SkillMode::Ranked);

        skills.lookup(Some("weather"), &gateway).await;
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cached_keys(&skills), vec!["disk", "weather"]);

        write_skill(
            dir.path(),
            "weather",
            &WEATHER_DOC.replace("Current weather for a city", "Weather forecast for tomorrow"),
        );
        let catalog = skills.lookup(Some("weather"), &gateway).await;
        assert!(catalog.contains("Weather forecast for tomorrow"));
        // query plus the edited skill; the unchanged one is a cache hit
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 5);

        fs::remove_dir_all(dir.path().join(".agent/skills/disk")).unwrap();
        skills.lookup(Some("weather"), &gateway).await;
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 6);
        assert_eq!(cached_keys(&skills), vec!["weather"]);
    }

    #[tokio::test]
    async fn unwritable_cache_still_ranks() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "weather", WEATHER_DOC);
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let mut skills = provider(dir.path(), SkillMode::Ranked);
        skills.cache_file = blocker.join("cache/.skill_index.json");
        let embedder = Arc::new(KeywordEmbedder {
            calls: AtomicUsize::new(0),
        });
        let gateway = LlmGateway::new(vec![embedder as Arc<dyn LanguageModel>], None);
        let catalog = skills.lookup(Some("weather"), &gateway).await;
        assert!(catalog.contains("- weather:"));
        assert!(!skills.cache_file.exists());
    }

    #[tokio::test]
    async fn ranked_mode_degrades_without_backend() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "weather", WEATHER_DOC);
        write_skill(dir.path(), "disk", DISK_DOC);
        let gateway = LlmGateway::new(Vec::new(), None);
        let catalog = provider(dir.path(), SkillMode::Ranked)
            .lookup(Some("weather"), &gateway)
            .await;
        assert!(catalog.contains("- weather:"));
        assert!(catalog.contains("- disk-report:"));
    }

    #[tokio::test]
    async fn missing_skills_dir_gives_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = LlmGateway::new(Vec::new(), None);
        assert_eq!(provider(dir.path(), SkillMode::Naive).lookup(None, &gateway).await, "");
    }
}
