//! Path deny-list for read-type tools.
//!
//! Paths are compared per segment after normalizing separators and case, so
//! `C:\Users\me\.SSH\id_rsa` and `/home/me/.ssh/id_rsa` are both caught while
//! `/home/me/myenvironment/readme.md` is not. Relative paths are taken from
//! the current directory and `..` is resolved before matching.

/// Directory names whose contents are never readable
const BLOCKED_DIRS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".azure",
    ".kube",
    ".password-store",
    "keychains",
    "keyrings",
];

/// Adjacent segment pairs (parent, child) that mark a credential store
const BLOCKED_PAIRS: &[(&str, &str)] = &[
    (".docker", "config.json"),
    (".config", "gcloud"),
    ("microsoft", "credentials"),
    ("microsoft", "protect"),
    ("microsoft", "vault"),
];

/// Exact file names holding secrets
const BLOCKED_FILES: &[&str] = &[
    ".env",
    ".netrc",
    ".pgpass",
    "id_rsa",
    "id_dsa",
    "id_ecdsa",
    "id_ed25519",
];

/// File suffixes holding secrets
const BLOCKED_SUFFIXES: &[&str] = &[".keychain", ".keychain-db", ".pem", ".key"];

/// Normalize a path for matching: forward slashes, lower case, leading `/`
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.replace('\\', "/").to_lowercase();
    if !normalized.starts_with('/') {
        normalized.insert(0, '/');
    }
    normalized
}

/// Split into segments, dropping `.` and resolving `..` lexically
fn segments(normalized: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            segment => parts.push(segment),
        }
    }
    parts
}

/// Whether a path names its own root: `/x`, `\x` or a drive letter
fn is_rooted(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('\\')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Anchor a relative path at the current directory
fn absolutize(path: &str) -> String {
    if is_rooted(path) {
        return path.to_string();
    }
    match std::env::current_dir() {
        Ok(cwd) => format!("{}/{}", cwd.display(), path),
        Err(_) => path.to_string(),
    }
}

/// Deny-list of sensitive paths checked before any read-type I/O.
#[derive(Debug, Clone, Default)]
pub struct SafetyFilter {
    /// Normalized, segment-split paths of the application's own data files
    protected: Vec<Vec<String>>,
}

impl SafetyFilter {
    /// Create a filter with only the built-in deny-list
    pub fn new() -> Self {
        Self::default()
    }

    /// Also deny a file or directory belonging to the application itself,
    /// such as its conversation database
    pub fn with_protected_path(mut self, path: impl AsRef<str>) -> Self {
        let normalized = normalize_path(&absolutize(path.as_ref()));
        let parts: Vec<String> = segments(&normalized).into_iter().map(String::from).collect();
        if !parts.is_empty() {
            self.protected.push(parts);
        }
        self
    }

    /// Return the rule that blocks `path`, if any
    pub fn check(&self, path: &str) -> Option<String> {
        let normalized = normalize_path(&absolutize(path));
        let parts = segments(&normalized);

        if let Some(dir) = parts.iter().find(|s| BLOCKED_DIRS.contains(*s)) {
            return Some(format!("credential directory '{}'", dir));
        }

        for window in parts.windows(2) {
            if let Some((parent, child)) = BLOCKED_PAIRS
                .iter()
                .find(|(parent, child)| window[0] == *parent && window[1] == *child)
            {
                return Some(format!("credential store '{}/{}'", parent, child));
            }
        }

        if let Some(name) = parts.last() {
            if BLOCKED_FILES.contains(name) || name.starts_with(".env.") {
                return Some(format!("secret file '{}'", name));
            }
            if let Some(suffix) = BLOCKED_SUFFIXES.iter().find(|s| name.ends_with(*s)) {
                return Some(format!("secret file type '{}'", suffix));
            }
        }

        self.protected
            .iter()
            .find(|protected| {
                parts.len() >= protected.len()
                    && parts.iter().zip(protected.iter()).all(|(a, b)| *a == b.as_str())
            })
            .map(|_| "application data".to_string())
    }

    /// Whether `path` is denied
    pub fn is_blocked(&self, path: &str) -> bool {
        self.check(path).is_some()
    }
}
