use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};

/// Absolute path used as the unique cache and navigation key.
///
/// Equality and hashing go through `key`, which is case-folded on platforms
/// whose file systems compare names case-insensitively.
#[derive(Clone)]
pub struct CanonicalPath {
    path: PathBuf,
    key: String,
}

impl CanonicalPath {
    /// Resolve `path` against the file system.
    pub fn resolve(path: &Path) -> io::Result<Self> {
        let abs = std::fs::canonicalize(path)?;
        Ok(Self::from_resolved(abs))
    }

    /// Wrap a path that is already absolute and normalized (e.g. a folder
    /// joined with a name from its own listing).
    pub fn from_resolved(path: PathBuf) -> Self {
        let key = fold_case(&path.to_string_lossy());
        Self { path, key }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dirname(&self) -> Option<CanonicalPath> {
        self.path.parent().map(|p| Self::from_resolved(p.to_path_buf()))
    }

    pub fn basename(&self) -> &str {
        self.path.file_name().and_then(|n| n.to_str()).unwrap_or("")
    }

    pub fn join(&self, name: &str) -> CanonicalPath {
        Self::from_resolved(self.path.join(name))
    }
}

#[cfg(any(windows, target_os = "macos"))]
fn fold_case(s: &str) -> String {
    s.to_lowercase()
}

#[cfg(not(any(windows, target_os = "macos")))]
fn fold_case(s: &str) -> String {
    s.to_owned()
}

impl PartialEq for CanonicalPath {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for CanonicalPath {}

impl Hash for CanonicalPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.path)
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_makes_relative_segments_absolute() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.png"), b"x").unwrap();

        let via_sub = dir.path().join("sub").join("..").join("a.png");
        let direct = CanonicalPath::resolve(&dir.path().join("a.png")).unwrap();
        let indirect = CanonicalPath::resolve(&via_sub).unwrap();

        assert_eq!(direct, indirect);
        assert_eq!(direct.basename(), "a.png");
        assert_eq!(
            direct.dirname().unwrap(),
            CanonicalPath::resolve(dir.path()).unwrap()
        );
    }

    #[test]
    fn resolve_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CanonicalPath::resolve(&dir.path().join("nope.png")).is_err());
    }
}
