use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// The filesystem queries path resolution needs, injectable for tests.
pub trait DirListing {
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    fn list(&self, dir: &Path) -> io::Result<Vec<String>>;
    fn modified(&self, path: &Path) -> Option<SystemTime>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl DirListing for RealFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            out.push(entry.file_name().to_string_lossy().to_string());
        }
        Ok(out)
    }

    fn modified(&self, path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }
}

pub fn has_glob(text: &str) -> bool {
    text.contains('*') || text.contains('?')
}

/// `*` matches any run of characters, `?` exactly one.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_ti = 0usize;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

pub fn absolutize(cwd: &Path, raw: &str) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        p
    } else {
        cwd.join(p)
    }
}

/// All existing paths matching `pattern`, anchored at `cwd` when relative.
///
/// Hidden entries only match components that themselves start with a dot.
pub fn expand_glob(pattern: &str, cwd: &Path, fs: &dyn DirListing) -> Vec<PathBuf> {
    let full = absolutize(cwd, pattern);
    let mut candidates: Vec<PathBuf> = vec![PathBuf::new()];
    for comp in full.components() {
        match comp {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                let mut next = Vec::new();
                for base in &candidates {
                    if has_glob(&part) {
                        if !fs.is_dir(base) {
                            continue;
                        }
                        let Ok(mut entries) = fs.list(base) else {
                            continue;
                        };
                        entries.sort();
                        for entry in entries {
                            if entry.starts_with('.') && !part.starts_with('.') {
                                continue;
                            }
                            if wildcard_match(&part, &entry) {
                                next.push(base.join(entry));
                            }
                        }
                    } else {
                        next.push(base.join(part.as_ref()));
                    }
                }
                candidates = next;
            }
            other => {
                for base in &mut candidates {
                    base.push(other.as_os_str());
                }
            }
        }
        if candidates.is_empty() {
            break;
        }
    }
    candidates.retain(|p| fs.exists(p));
    candidates
}

/// The most recently modified match of `pattern`, if any.
pub fn latest_glob_match(pattern: &str, cwd: &Path, fs: &dyn DirListing) -> Option<PathBuf> {
    let mut matches: Vec<(Option<SystemTime>, PathBuf)> = expand_glob(pattern, cwd, fs)
        .into_iter()
        .map(|p| (fs.modified(&p), p))
        .collect();
    matches.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    matches.into_iter().next().map(|(_, p)| p)
}

/// Correct the casing of path components that do not exist as written.
///
/// Returns the corrected path when it exists, otherwise `path` unchanged.
pub fn resolve_case_insensitive(path: &Path, fs: &dyn DirListing) -> PathBuf {
    if fs.exists(path) {
        return path.to_path_buf();
    }
    let mut current = PathBuf::new();
    for comp in path.components() {
        let Component::Normal(part) = comp else {
            current.push(comp.as_os_str());
            continue;
        };
        let attempt = current.join(part);
        if fs.exists(&attempt) {
            current = attempt;
            continue;
        }
        let listing_dir = if current.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            current.clone()
        };
        let wanted = part.to_string_lossy().to_lowercase();
        let found = if fs.is_dir(&listing_dir) {
            fs.list(&listing_dir)
                .ok()
                .and_then(|entries| entries.into_iter().find(|e| e.to_lowercase() == wanted))
        } else {
            None
        };
        current = match found {
            Some(entry) => current.join(entry),
            None => attempt,
        };
    }
    if fs.exists(&current) {
        current
    } else {
        path.to_path_buf()
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeFs;
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("*.txt", "report.txt"));
        assert!(wildcard_match("rep?rt.*", "report.pdf"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("a*b*c", "axxbyyc"));
        assert!(!wildcard_match("*.txt", "report.pdf"));
        assert!(!wildcard_match("a?c", "ac"));
        assert!(!wildcard_match("abc", "abcd"));
    }

    #[test]
    fn glob_picks_most_recent_match() {
        let fs = FakeFs::new()
            .file("/home/u/Downloads/old.pdf", 100)
            .file("/home/u/Downloads/new.pdf", 300)
            .file("/home/u/Downloads/mid.pdf", 200)
            .file("/home/u/Downloads/newest.txt", 900);
        let got = latest_glob_match("Downloads/*.pdf", Path::new("/home/u"), &fs);
        assert_eq!(got, Some(PathBuf::from("/home/u/Downloads/new.pdf")));
    }

    #[test]
    fn glob_without_match_is_none() {
        let fs = FakeFs::new().file("/data/a.txt", 1);
        assert_eq!(latest_glob_match("*.csv", Path::new("/data"), &fs), None);
    }

    #[test]
    fn glob_skips_hidden_entries_unless_asked() {
        let fs = FakeFs::new().file("/d/.secret.txt", 5).file("/d/plain.txt", 1);
        assert_eq!(
            latest_glob_match("/d/*.txt", Path::new("/"), &fs),
            Some(PathBuf::from("/d/plain.txt"))
        );
        assert_eq!(
            latest_glob_match("/d/.*.txt", Path::new("/"), &fs),
            Some(PathBuf::from("/d/.secret.txt"))
        );
    }

    #[test]
    fn glob_expands_directory_components() {
        let fs = FakeFs::new()
            .file("/r/a1/log.txt", 10)
            .file("/r/a2/log.txt", 20)
            .file("/r/b1/log.txt", 30);
        let all = expand_glob("/r/a*/log.txt", Path::new("/"), &fs);
        assert_eq!(
            all,
            vec![PathBuf::from("/r/a1/log.txt"), PathBuf::from("/r/a2/log.txt")]
        );
    }

    #[test]
    fn case_insensitive_fixes_each_segment() {
        let fs = FakeFs::new().file("/Users/Me/Documents/Report.PDF", 1);
        let got = resolve_case_insensitive(Path::new("/users/me/documents/report.pdf"), &fs);
        assert_eq!(got, PathBuf::from("/Users/Me/Documents/Report.PDF"));
    }

    #[test]
    fn case_insensitive_returns_input_when_unresolvable() {
        let fs = FakeFs::new().file("/Users/Me/notes.txt", 1);
        let input = Path::new("/users/me/missing/notes.txt");
        assert_eq!(resolve_case_insensitive(input, &fs), input.to_path_buf());
    }

    #[test]
    fn case_insensitive_keeps_existing_path() {
        let fs = FakeFs::new().file("/a/B.txt", 1);
        assert_eq!(
            resolve_case_insensitive(Path::new("/a/B.txt"), &fs),
            PathBuf::from("/a/B.txt")
        );
    }

    #[test]
    fn case_insensitive_never_panics_on_odd_input() {
        let fs = FakeFs::new();
        for raw in ["", ".", "..", "relative/Thing", "/", "//x//y"] {
            let _ = resolve_case_insensitive(Path::new(raw), &fs);
        }
    }
}
