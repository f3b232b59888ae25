use std::sync::OnceLock;

use regex::Regex;

use crate::plan::strip_raw_shell_prefix;

const CONTROL_PREFIX: &str = "satele ";

/// What a direct-execution intent should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectCommand {
    /// Sub-command of the control script, e.g. `logs` for `satele logs`.
    Control(String),
    Shell(String),
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Another agent owns this instruction.
    Handoff,
    Restart,
    Update,
    Status,
    RunCommand(DirectCommand),
    Printout(DirectCommand),
    RawShell(String),
    Pipeline,
}

struct Patterns {
    restart: Regex,
    update: Regex,
    status: Regex,
    run_command: Regex,
    printout: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        restart: Regex::new(r"(?i)\b(restart|reboot)\b").expect("valid restart regex"),
        update: Regex::new(r"(?i)\b(git pull|update|pull changes)\b").expect("valid update regex"),
        status: Regex::new(r"(?i)\b(status|alive)\b").expect("valid status regex"),
        run_command: Regex::new(r"(?i)\b(run command|execute command)\b\s*([-:]\s*)?")
            .expect("valid run command regex"),
        printout: Regex::new(r"(?i)send me printout\s*([-:]\s*)?").expect("valid printout regex"),
    })
}

/// Pick the handling path for one instruction. First match wins.
pub fn route(instruction: &str, has_media: bool, handoff_marker: &str) -> Route {
    let text = instruction.trim();
    let p = patterns();
    let marker = handoff_marker.trim().to_lowercase();
    if !marker.is_empty() && text.to_lowercase().contains(&marker) {
        return Route::Handoff;
    }
    if p.restart.is_match(text) {
        return Route::Restart;
    }
    if p.update.is_match(text) {
        return Route::Update;
    }
    if p.status.is_match(text) {
        return Route::Status;
    }
    if p.run_command.is_match(text) {
        return Route::RunCommand(direct_command(&p.run_command.replace_all(text, "")));
    }
    if p.printout.is_match(text) {
        return Route::Printout(direct_command(&p.printout.replace_all(text, "")));
    }
    if !has_media {
        if let Some(cmd) = strip_raw_shell_prefix(text) {
            return Route::RawShell(cmd.to_string());
        }
    }
    Route::Pipeline
}

fn direct_command(rest: &str) -> DirectCommand {
    let rest = rest.trim();
    if let Some(sub) = rest.strip_prefix(CONTROL_PREFIX) {
        DirectCommand::Control(sub.trim().to_string())
    } else if rest.is_empty() {
        DirectCommand::Missing
    } else {
        DirectCommand::Shell(rest.to_string())
    }
}
