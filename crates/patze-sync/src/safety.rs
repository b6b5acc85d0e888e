//! Directory safety for operator-supplied OpenClaw directories.
//!
//! A target's `openclawDir` is read and written by the control plane, so it
//! is confined to a small allowlist under the user's home and kept away
//! from system trees and credential directories. All checks are lexical;
//! nothing here touches the filesystem.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirSafetyError {
    #[error("directory must be an absolute path")]
    NotAbsolute,
    #[error("directory may not be the filesystem root or the home directory")]
    RootOrHome,
    #[error("directory falls under a forbidden system tree")]
    ForbiddenSystemTree,
    #[error("directory falls under a protected home directory")]
    ProtectedHomeDir,
    #[error("directory is outside the allowed OpenClaw locations")]
    OutsideAllowlist,
}

const FORBIDDEN_SYSTEM_PREFIXES: &[&str] = &[
    "/etc", "/var", "/proc", "/sys", "/dev", "/boot", "/bin", "/sbin", "/lib", "/tmp",
];
const PROTECTED_HOME_DIRS: &[&str] = &[".ssh", ".gnupg", ".config"];
const ALLOWED_HOME_DIRS: &[&str] = &[".openclaw", ".patze-control", "openclaw"];

/// Validate an `openclawDir` against the allowlist, resolving `~` against
/// `home`. Returns the normalized absolute path.
pub fn validate_openclaw_dir(dir: &str, home: &Path) -> Result<PathBuf, DirSafetyError> {
    let expanded = expand_home(Path::new(dir), home);
    if !expanded.is_absolute() {
        return Err(DirSafetyError::NotAbsolute);
    }
    let normalized = normalize_lexical(&expanded);
    let home = normalize_lexical(home);

    if normalized == Path::new("/") || normalized == home {
        return Err(DirSafetyError::RootOrHome);
    }
    for prefix in FORBIDDEN_SYSTEM_PREFIXES {
        if normalized.starts_with(prefix) {
            return Err(DirSafetyError::ForbiddenSystemTree);
        }
    }
    for protected in PROTECTED_HOME_DIRS {
        if normalized.starts_with(home.join(protected)) {
            return Err(DirSafetyError::ProtectedHomeDir);
        }
    }
    if ALLOWED_HOME_DIRS
        .iter()
        .any(|allowed| normalized.starts_with(home.join(allowed)))
    {
        Ok(normalized)
    } else {
        Err(DirSafetyError::OutsideAllowlist)
    }
}

/// Filesystem-safe rendering of a job id for `runs/<safe(jobId)>.jsonl`.
pub fn safe_job_id(job_id: &str) -> String {
    let mut out: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(100);
    if out.is_empty() {
        out.push_str("job");
    }
    out
}

fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(stripped) => home.join(stripped),
        Err(_) => path.to_path_buf(),
    }
}

fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> PathBuf {
        PathBuf::from("/home/op")
    }

    #[test]
    fn test_allowed_locations() {
        assert!(validate_openclaw_dir("/home/op/.openclaw", &home()).is_ok());
        assert!(validate_openclaw_dir("~/.openclaw/targets/a", &home()).is_ok());
        assert!(validate_openclaw_dir("~/.patze-control/spool", &home()).is_ok());
        assert!(validate_openclaw_dir("/home/op/openclaw", &home()).is_ok());
    }

    #[test]
    fn test_system_trees_rejected() {
        for dir in ["/etc/openclaw", "/var/lib/openclaw", "/tmp/openclaw", "/proc/1"] {
            assert_eq!(
                validate_openclaw_dir(dir, &home()),
                Err(DirSafetyError::ForbiddenSystemTree),
                "{dir}"
            );
        }
    }

    #[test]
    fn test_protected_home_dirs_rejected() {
        assert_eq!(
            validate_openclaw_dir("~/.ssh/openclaw", &home()),
            Err(DirSafetyError::ProtectedHomeDir)
        );
        assert_eq!(
            validate_openclaw_dir("/home/op/.config/openclaw", &home()),
            Err(DirSafetyError::ProtectedHomeDir)
        );
    }

    #[test]
    fn test_root_and_home_rejected() {
        assert_eq!(validate_openclaw_dir("/", &home()), Err(DirSafetyError::RootOrHome));
        assert_eq!(validate_openclaw_dir("~", &home()), Err(DirSafetyError::RootOrHome));
        assert_eq!(
            validate_openclaw_dir("/home/op", &home()),
            Err(DirSafetyError::RootOrHome)
        );
    }

    #[test]
    fn test_escape_via_dotdot_rejected() {
        assert_eq!(
            validate_openclaw_dir("/home/op/.openclaw/../.ssh/keys", &home()),
            Err(DirSafetyError::ProtectedHomeDir)
        );
    }

    #[test]
    fn test_outside_allowlist_rejected() {
        assert_eq!(
            validate_openclaw_dir("/home/op/projects/openclaw", &home()),
            Err(DirSafetyError::OutsideAllowlist)
        );
        assert_eq!(
            validate_openclaw_dir("relative/dir", &home()),
            Err(DirSafetyError::NotAbsolute)
        );
    }

    #[test]
    fn test_safe_job_id() {
        assert_eq!(safe_job_id("nightly-build"), "nightly-build");
        assert_eq!(safe_job_id("job/with:odd chars"), "job_with_odd_chars");
        assert_eq!(safe_job_id(""), "job");
        assert_eq!(safe_job_id(&"x".repeat(200)).len(), 100);
    }
}
