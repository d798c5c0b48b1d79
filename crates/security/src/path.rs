//! Confining filesystem access to a base directory.

use std::{
    ffi::OsStr,
    path::{Component, Path, PathBuf},
};

use bambooclaw_config::SecurityConfig;

use crate::error::{Result, SecurityError};

/// Which components inside the base are off limits.
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    pub deny_dotfiles: bool,
    pub sensitive_patterns: Vec<String>,
    pub allowlist: Vec<String>,
}

impl PathPolicy {
    #[must_use]
    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            deny_dotfiles: config.deny_dotfiles,
            sensitive_patterns: config.sensitive_patterns.clone(),
            allowlist: config.path_allowlist.clone(),
        }
    }

    /// Why `name` is sensitive, or `None` if it may be accessed.
    fn sensitive_reason(&self, name: &str) -> Option<String> {
        if self.allowlist.iter().any(|p| glob_match(p, name)) {
            return None;
        }
        if self.deny_dotfiles && name.starts_with('.') {
            return Some(format!("dotfile component \"{name}\""));
        }
        self.sensitive_patterns
            .iter()
            .find(|p| glob_match(p, name))
            .map(|p| format!("\"{name}\" matches sensitive pattern \"{p}\""))
    }
}

/// A path proven to be inside its base. Only [`scope_path`] creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedPath(PathBuf);

impl ScopedPath {
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for ScopedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Resolve `requested` against `base` and prove it stays inside.
///
/// Symlinks are resolved on the longest existing prefix; the remainder may not
/// contain `..`. Absolute requests are allowed only if they land inside the
/// base after resolution.
pub fn scope_path(base: &Path, requested: &Path, policy: &PathPolicy) -> Result<ScopedPath> {
    let canonical_base = base.canonicalize()?;
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        canonical_base.join(requested)
    };

    let resolved = resolve_existing_prefix(&joined)?;
    if !resolved.starts_with(&canonical_base) {
        return Err(SecurityError::Escape {
            path: requested.to_path_buf(),
        });
    }

    let relative = resolved
        .strip_prefix(&canonical_base)
        .map_err(|_| SecurityError::Escape {
            path: requested.to_path_buf(),
        })?;
    for component in relative.components() {
        let name = component.as_os_str().to_string_lossy();
        if let Some(reason) = policy.sensitive_reason(&name) {
            return Err(SecurityError::denied(requested, reason));
        }
    }

    Ok(ScopedPath(resolved))
}

/// Symlink hops followed through dangling links before giving up.
const MAX_LINK_HOPS: usize = 40;

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// rest. A `..` in the non-existent tail cannot be resolved safely and counts
/// as an escape. Dangling symlinks are followed to their target, so the
/// caller's containment check sees where a write would actually land.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf> {
    resolve_with_hops(path, path, 0)
}

fn resolve_with_hops(original: &Path, path: &Path, hops: usize) -> Result<PathBuf> {
    let escape = || SecurityError::Escape {
        path: original.to_path_buf(),
    };
    let mut tail: Vec<&OsStr> = Vec::new();
    let mut cursor = path;
    let existing = loop {
        match cursor.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => match cursor.canonicalize() {
                Ok(resolved) => break resolved,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if hops >= MAX_LINK_HOPS {
                        return Err(escape());
                    }
                    let target = std::fs::read_link(cursor)?;
                    let target = match cursor.parent() {
                        Some(parent) if target.is_relative() => parent.join(target),
                        _ => target,
                    };
                    break resolve_with_hops(original, &target, hops + 1)?;
                },
                Err(e) => return Err(e.into()),
            },
            Ok(_) => break cursor.canonicalize()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        match (cursor.parent(), cursor.components().next_back()) {
            (Some(parent), Some(last)) => {
                match last {
                    Component::Normal(name) => tail.push(name),
                    Component::CurDir => {},
                    Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                        return Err(escape());
                    },
                }
                cursor = parent;
            },
            _ => return Err(escape()),
        }
    };

    let mut resolved = existing;
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Glob matching with `*` (any run of chars) and `?` (one char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn policy() -> PathPolicy {
        PathPolicy {
            deny_dotfiles: true,
            sensitive_patterns: vec!["*.pem".into(), "id_rsa*".into()],
            allowlist: vec![".well-known".into()],
        }
    }

    #[rstest]
    #[case("*.pem", "server.pem", true)]
    #[case("*.pem", "server.pem.bak", false)]
    #[case("id_rsa*", "id_rsa.pub", true)]
    #[case("a?c", "abc", true)]
    #[case("a?c", "ac", false)]
    #[case("*", "", true)]
    #[case("exact", "exact", true)]
    #[case("*mid*", "amidb", true)]
    fn glob_cases(#[case] pattern: &str, #[case] text: &str, #[case] expected: bool) {
        assert_eq!(glob_match(pattern, text), expected);
    }

    #[test]
    fn inside_path_resolves_to_canonical() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("notes")).unwrap();
        let scoped = scope_path(dir.path(), Path::new("notes/./today.md"), &policy()).unwrap();
        let base = dir.path().canonicalize().unwrap();
        assert_eq!(scoped.as_path(), base.join("notes").join("today.md"));
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = scope_path(dir.path(), Path::new("../outside.txt"), &policy()).unwrap_err();
        assert!(matches!(err, SecurityError::Escape { .. }));

        let err =
            scope_path(dir.path(), Path::new("missing/../../x"), &policy()).unwrap_err();
        assert!(matches!(err, SecurityError::Escape { .. }));
    }

    #[test]
    fn absolute_outside_is_rejected_inside_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let err = scope_path(dir.path(), other.path(), &policy()).unwrap_err();
        assert!(matches!(err, SecurityError::Escape { .. }));

        let inside = dir.path().canonicalize().unwrap().join("file.txt");
        assert!(scope_path(dir.path(), &inside, &policy()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = scope_path(dir.path(), Path::new("link/secret.txt"), &policy()).unwrap_err();
        assert!(matches!(err, SecurityError::Escape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_pointing_outside_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("newfile");
        std::os::unix::fs::symlink(&target, dir.path().join("evil")).unwrap();

        let err = scope_path(dir.path(), Path::new("evil"), &policy()).unwrap_err();
        assert!(matches!(err, SecurityError::Escape { .. }));
        let err = scope_path(dir.path(), Path::new("evil/child.txt"), &policy()).unwrap_err();
        assert!(matches!(err, SecurityError::Escape { .. }));
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_inside_resolves_to_its_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("drafts")).unwrap();
        std::os::unix::fs::symlink("drafts/next.md", dir.path().join("latest")).unwrap();

        let scoped = scope_path(dir.path(), Path::new("latest"), &policy()).unwrap();
        let base = dir.path().canonicalize().unwrap();
        assert_eq!(scoped.as_path(), base.join("drafts").join("next.md"));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("b", dir.path().join("a")).unwrap();
        std::os::unix::fs::symlink("a", dir.path().join("b")).unwrap();
        assert!(scope_path(dir.path(), Path::new("a"), &policy()).is_err());
    }

    #[test]
    fn sensitive_components_are_denied_unless_allowlisted() {
        let dir = tempfile::tempdir().unwrap();
        let err = scope_path(dir.path(), Path::new(".env"), &policy()).unwrap_err();
        assert!(matches!(err, SecurityError::Denied { .. }));

        let err = scope_path(dir.path(), Path::new("keys/server.pem"), &policy()).unwrap_err();
        assert!(matches!(err, SecurityError::Denied { .. }));

        assert!(scope_path(dir.path(), Path::new(".well-known/a.txt"), &policy()).is_ok());
    }

    #[test]
    fn missing_base_is_io_error() {
        let err = scope_path(Path::new("/definitely/not/here"), Path::new("a"), &policy())
            .unwrap_err();
        assert!(matches!(err, SecurityError::Io(_)));
    }
}
