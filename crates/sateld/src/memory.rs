use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use anyhow::anyhow;
use rusqlite::{params, Connection};

use crate::text::char_prefix;

const INIT_SQL: &str = include_str!("../../../migrations/001_init.sql");
const RECALL_SCAN_LIMIT: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "assistant" {
            Role::Assistant
        } else {
            Role::User
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallEntry {
    pub created_at: String,
    pub role: Role,
    pub cwd: String,
    pub text: String,
}

impl fmt::Display for RecallEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minute = self.created_at.get(..16).unwrap_or(&self.created_at);
        write!(
            f,
            "[{minute}] ({}) CWD:{} -> {}",
            self.role.as_str(),
            self.cwd,
            self.text
        )
    }
}

/// Append-only conversation log backed by sqlite, queried by embedding similarity.
pub struct RecallStore {
    db: Mutex<Connection>,
    item_max_chars: usize,
}

impl RecallStore {
    pub fn open(path: &Path, item_max_chars: usize) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?, item_max_chars)
    }

    pub fn open_in_memory(item_max_chars: usize) -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, item_max_chars)
    }

    fn with_connection(conn: Connection, item_max_chars: usize) -> anyhow::Result<Self> {
        conn.execute_batch(INIT_SQL)?;
        Ok(Self {
            db: Mutex::new(conn),
            item_max_chars: item_max_chars.max(128),
        })
    }

    pub fn remember(
        &self,
        role: Role,
        cwd: &str,
        text: &str,
        embedding: Option<&[f32]>,
    ) -> anyhow::Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let content = char_prefix(text, self.item_max_chars);
        let embedding = embedding
            .filter(|v| !v.is_empty())
            .map(serde_json::to_string)
            .transpose()?;
        let created_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let db = self.db.lock().map_err(|_| anyhow!("db lock poisoned"))?;
        db.execute(
            "INSERT INTO recall_entries (created_at, role, cwd, content, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![created_at, role.as_str(), cwd, content, embedding],
        )?;
        Ok(())
    }

    /// Most similar entries first. Falls back to word overlap when no
    /// embedding is available for the query or the stored rows.
    pub fn recall(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        limit: usize,
    ) -> anyhow::Result<Vec<RecallEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = self.recent_rows()?;
        let mut scored: Vec<(f32, usize)> = Vec::new();
        if let Some(q) = query_embedding.filter(|v| !v.is_empty()) {
            for (idx, (_, emb)) in rows.iter().enumerate() {
                if let Some(emb) = emb {
                    let score = cosine_similarity(q, emb);
                    if score > 0.0 {
                        scored.push((score, idx));
                    }
                }
            }
        }
        if scored.is_empty() {
            let query_words = word_set(query);
            for (idx, (entry, _)) in rows.iter().enumerate() {
                let overlap = word_set(&entry.text).intersection(&query_words).count();
                if overlap > 0 {
                    scored.push((overlap as f32, idx));
                }
            }
        }
        // rows are newest first, so the index breaks ties by recency
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, idx)| rows[idx].0.clone())
            .collect())
    }

    pub fn count(&self) -> anyhow::Result<usize> {
        let db = self.db.lock().map_err(|_| anyhow!("db lock poisoned"))?;
        let cnt: i64 = db.query_row("SELECT COUNT(*) FROM recall_entries", [], |row| row.get(0))?;
        Ok(cnt.max(0) as usize)
    }

    pub fn clear(&self) -> anyhow::Result<usize> {
        let db = self.db.lock().map_err(|_| anyhow!("db lock poisoned"))?;
        Ok(db.execute("DELETE FROM recall_entries", [])?)
    }

    fn recent_rows(&self) -> anyhow::Result<Vec<(RecallEntry, Option<Vec<f32>>)>> {
        let db = self.db.lock().map_err(|_| anyhow!("db lock poisoned"))?;
        let mut stmt = db.prepare(
            "SELECT created_at, role, cwd, content, embedding
             FROM recall_entries
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![RECALL_SCAN_LIMIT], |row| {
            let role: String = row.get(1)?;
            let embedding: Option<String> = row.get(4)?;
            Ok((
                RecallEntry {
                    created_at: row.get(0)?,
                    role: Role::parse(&role),
                    cwd: row.get(2)?,
                    text: row.get(3)?,
                },
                embedding.and_then(|raw| serde_json::from_str::<Vec<f32>>(&raw).ok()),
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}
