//! Typed form of the line protocol between the model reply and the post-processor.

use satele_core::types::UPLOAD_PREFIX;

const RAW_SHELL_PREFIX: &str = "sh:";
const SHELL_OPERATORS: [&str; 7] = ["&&", "||", ";", "|", ">", "<", "$("];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    Shell(String),
    /// `None` means the bare `cd` form.
    ChangeDirectory(Option<String>),
    Upload(String),
}

/// Text after an `UPLOAD:` prefix (any case), if `line` is an upload directive.
pub fn upload_target(line: &str) -> Option<&str> {
    let line = line.trim();
    let head = line.get(..UPLOAD_PREFIX.len())?;
    if head.eq_ignore_ascii_case(UPLOAD_PREFIX) {
        Some(line[UPLOAD_PREFIX.len()..].trim())
    } else {
        None
    }
}

/// Command text after a `sh:` prefix (any case), if present.
pub fn strip_raw_shell_prefix(text: &str) -> Option<&str> {
    let text = text.trim_start();
    let head = text.get(..RAW_SHELL_PREFIX.len())?;
    if head.eq_ignore_ascii_case(RAW_SHELL_PREFIX) {
        Some(text[RAW_SHELL_PREFIX.len()..].trim())
    } else {
        None
    }
}

pub fn parse_line(line: &str) -> Option<PlanStep> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Some(rest) = strip_raw_shell_prefix(line) {
        line = rest;
        if line.is_empty() {
            return None;
        }
    }
    if let Some(target) = upload_target(line) {
        return Some(PlanStep::Upload(target.to_string()));
    }
    if line == "cd" {
        return Some(PlanStep::ChangeDirectory(None));
    }
    if let Some(arg) = line.strip_prefix("cd ").or_else(|| line.strip_prefix("cd\t")) {
        let arg = arg.trim();
        // compound lines keep their shell semantics
        if !SHELL_OPERATORS.iter().any(|op| arg.contains(op)) {
            return Some(PlanStep::ChangeDirectory(
                (!arg.is_empty()).then(|| arg.to_string()),
            ));
        }
    }
    Some(PlanStep::Shell(line.to_string()))
}

pub fn parse_plan<S: AsRef<str>>(lines: &[S]) -> Vec<PlanStep> {
    lines.iter().filter_map(|l| parse_line(l.as_ref())).collect()
}
