use serde::{Deserialize, Serialize};

/// Prefix of a result string that asks the reporting layer for a file delivery.
pub const UPLOAD_PREFIX: &str = "UPLOAD:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
}

/// One inbound instruction handed out by the task source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub media_path: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    pub fn media(&self) -> Option<&str> {
        self.media_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub id: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportAck {
    #[serde(default)]
    pub status: Option<String>,
}

/// Render the wire form of a file delivery.
pub fn upload_result(path: &str) -> String {
    format!("{UPLOAD_PREFIX} {path}")
}
