use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Working-directory state of the bridge, persisted to a sidecar file on every change.
#[derive(Debug, Clone)]
pub struct Session {
    cwd: PathBuf,
    default_root: PathBuf,
    state_file: PathBuf,
    host_home: Option<PathBuf>,
}

impl Session {
    pub fn new(default_root: PathBuf, state_file: PathBuf, host_home: Option<PathBuf>) -> Self {
        Self {
            cwd: default_root.clone(),
            default_root,
            state_file,
            host_home,
        }
    }

    /// Build a session and resume the directory saved by a previous run, if it still exists.
    pub fn restore(default_root: PathBuf, state_file: PathBuf, host_home: Option<PathBuf>) -> Self {
        let mut session = Self::new(default_root, state_file, host_home);
        match fs::read_to_string(&session.state_file) {
            Ok(raw) => {
                let saved = PathBuf::from(raw.trim());
                if !raw.trim().is_empty() && saved.is_dir() {
                    info!("restored session cwd: {}", saved.display());
                    session.cwd = saved;
                } else {
                    warn!(
                        "saved cwd {:?} is gone, staying at {}",
                        raw.trim(),
                        session.cwd.display()
                    );
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("read cwd state failed: {err}"),
        }
        session
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Mounted host home when running inside a container.
    pub fn host_home(&self) -> Option<&Path> {
        self.host_home.as_deref()
    }

    pub fn home_dir(&self) -> PathBuf {
        if let Some(h) = &self.host_home {
            return h.clone();
        }
        dirs::home_dir().unwrap_or_else(|| self.default_root.clone())
    }

    /// Apply a `cd` directive. `None` means "go home".
    pub fn change_dir(&mut self, raw: Option<&str>) -> Result<&Path, String> {
        let target = self.resolve_target(raw);
        let resolved = fs::canonicalize(&target)
            .map_err(|err| format!("CD Failed: {err}: '{}'", target.display()))?;
        if !resolved.is_dir() {
            return Err(format!(
                "CD Failed: Not a directory: '{}'",
                resolved.display()
            ));
        }
        self.cwd = resolved;
        self.persist();
        info!("persistent cd: {}", self.cwd.display());
        Ok(&self.cwd)
    }

    fn resolve_target(&self, raw: Option<&str>) -> PathBuf {
        let arg = raw.map(clean_cd_argument).unwrap_or_default();
        if arg.is_empty() {
            return self.home_dir();
        }
        let home = self.home_dir();
        if arg == "~" || (self.host_home.is_some() && arg.eq_ignore_ascii_case("home")) {
            return home;
        }
        if let Some(rest) = arg.strip_prefix("~/") {
            return home.join(rest);
        }
        let p = PathBuf::from(&arg);
        if p.is_absolute() {
            p
        } else {
            self.cwd.join(p)
        }
    }

    fn persist(&self) {
        if let Some(parent) = self.state_file.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("create cwd state dir failed: {err}");
                return;
            }
        }
        if let Err(err) = fs::write(&self.state_file, self.cwd.to_string_lossy().as_bytes()) {
            warn!("persist cwd failed: {err}");
        }
    }
}

/// Strip quotes and the `CWD:` echo the model sometimes copies from its prompt.
fn clean_cd_argument(raw: &str) -> String {
    let mut arg = raw.trim();
    for q in ['"', '\''] {
        if arg.len() >= 2 && arg.starts_with(q) && arg.ends_with(q) {
            arg = &arg[1..arg.len() - 1];
        }
    }
    if let Some(head) = arg.get(..4) {
        if head.eq_ignore_ascii_case("CWD:") {
            arg = arg[4..].trim();
        }
    }
    arg.trim().to_string()
}
