use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::executor::ShellExecutor;
use crate::paths::{absolutize, has_glob, latest_glob_match, resolve_case_insensitive, DirListing};
use crate::plan::{upload_target, PlanStep};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// Every step ran; combined output of all steps.
    Completed(String),
    /// A file delivery short-circuited the plan.
    Upload(PathBuf),
    /// An upload was requested but cannot be honoured.
    Failed(String),
}

/// Resolve the target of a plan-line `UPLOAD:` directive.
///
/// Wildcards pick the newest match; an unmatched pattern is passed through so the
/// delivery layer reports it. Directories are rejected.
pub fn resolve_upload(raw: &str, cwd: &Path, fs: &dyn DirListing) -> Result<PathBuf, String> {
    let raw = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    let mut path = if has_glob(raw) {
        match latest_glob_match(raw, cwd, fs) {
            Some(p) => p,
            None => {
                warn!("upload pattern matched nothing: {raw}");
                PathBuf::from(raw)
            }
        }
    } else {
        PathBuf::from(raw)
    };
    if !path.is_absolute() {
        path = absolutize(cwd, &path.to_string_lossy());
    }
    let path = resolve_case_insensitive(&path, fs);
    if fs.is_dir(&path) {
        return Err(format!(
            "Error: '{}' is a directory. I cannot upload folders, only individual files.",
            path.display()
        ));
    }
    Ok(path)
}

/// Check an `UPLOAD:` line echoed by a command. Only existing regular files qualify.
pub fn resolve_output_upload(raw: &str, cwd: &Path, fs: &dyn DirListing) -> Result<PathBuf, String> {
    let path = absolutize(cwd, raw.trim());
    if fs.is_file(&path) {
        Ok(path)
    } else if fs.is_dir(&path) {
        Err(format!(
            "Upload failed: '{}' is a directory, not a file.",
            path.display()
        ))
    } else {
        Err(format!("Upload failed: file not found: '{}'", path.display()))
    }
}

/// Run a plan step by step, honouring `cd` and upload directives.
pub async fn execute_plan(
    plan: &[PlanStep],
    session: &mut Session,
    executor: &ShellExecutor,
    fs: &dyn DirListing,
) -> PlanOutcome {
    let mut outputs: Vec<String> = Vec::new();
    for step in plan {
        match step {
            PlanStep::Upload(raw) => {
                return match resolve_upload(raw, session.cwd(), fs) {
                    Ok(path) => {
                        info!("upload directive resolved: {}", path.display());
                        PlanOutcome::Upload(path)
                    }
                    Err(msg) => {
                        warn!("{msg}");
                        PlanOutcome::Failed(msg)
                    }
                };
            }
            PlanStep::ChangeDirectory(arg) => {
                let out = match session.change_dir(arg.as_deref()) {
                    Ok(cwd) => format!("Directory changed to: {}", cwd.display()),
                    Err(err) => {
                        warn!("{err}");
                        err
                    }
                };
                outputs.push(out);
            }
            PlanStep::Shell(cmd) => {
                info!("running: {cmd}");
                let out = executor.run(cmd, session.cwd()).await;
                let echoed = out.lines().find_map(upload_target).map(str::to_string);
                if let Some(raw) = echoed {
                    return match resolve_output_upload(&raw, session.cwd(), fs) {
                        Ok(path) => PlanOutcome::Upload(path),
                        Err(msg) => {
                            warn!("{msg}");
                            PlanOutcome::Failed(msg)
                        }
                    };
                }
                outputs.push(out);
            }
        }
    }
    PlanOutcome::Completed(outputs.join("\n"))
}

/// Cap `text` at `max_chars` characters including the visible marker.
///
/// The output never exceeds the budget, so applying it twice is a no-op.
pub fn truncate_result(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let marker = format!("\n\n... (Result truncated at {max_chars} characters) ...");
    let keep = max_chars.saturating_sub(marker.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(&marker);
    out
}
