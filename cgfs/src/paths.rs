use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use procfs::process::Process;

use crate::mount;

/// Longest suffix appended to a resolved path after the fact: `/tasks`
/// plus the terminating NUL the kernel interface requires.
const RESERVED_SUFFIX: usize = 7;

pub fn max_path_len() -> usize {
    libc::PATH_MAX as usize - RESERVED_SUFFIX
}

/// Syntactic validation of a client-supplied cgroup path.
///
/// Paths are interpreted relative to the requestor's own cgroup and may
/// not begin with `/` or `.`, may not contain `..` or NUL anywhere, and
/// have runs of `/` collapsed. The empty string denotes the requestor's
/// own cgroup and normalizes to an empty path.
pub fn normalize_client_path(cgroup: &str) -> Result<PathBuf> {
    if cgroup.is_empty() {
        return Ok(PathBuf::new());
    }
    if cgroup.contains('\0') {
        bail!("cgroup path contains a NUL byte");
    }
    if cgroup.starts_with('/') || cgroup.starts_with('.') {
        bail!("bad requested cgroup path: {}", cgroup);
    }
    if cgroup.contains("..") {
        bail!("cgroup path {} contains ..", cgroup);
    }
    if cgroup.len() > max_path_len() {
        bail!("path name too long");
    }

    Ok(PathBuf::from(path_clean::clean(cgroup)))
}

/// Validation of an attribute key (`tasks`, `memory.limit_in_bytes`, ...):
/// a single file name, never a path.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('.') || key.contains('/') || key.contains('\0') {
        bail!("bad attribute key: {:?}", key);
    }
    Ok(())
}

/// Absolute cgroup directory of `pid` for `controller`: the controller's
/// mount point joined with the pid's entry in `/proc/<pid>/cgroup`.
pub fn pid_cgroup(pid: libc::pid_t, controller: &str) -> Result<PathBuf> {
    let mount_point = mount::controller_mount_point(controller)?;
    let entry = Process::new(pid)
        .with_context(|| format!("failed to inspect pid {}", pid))?
        .cgroups()
        .with_context(|| format!("failed to read cgroups of pid {}", pid))?
        .into_iter()
        .find(|c| c.controllers.iter().any(|name| name == controller))
        .ok_or_else(|| anyhow!("pid {} has no cgroup for controller {}", pid, controller))?;

    Ok(mount_point.join(entry.pathname.trim_start_matches('/')))
}

/// Joins a requestor's own cgroup with a normalized client path, enforcing
/// the length cap at the concatenation.
pub fn resolve(base: &Path, client: &Path) -> Result<PathBuf> {
    if client.as_os_str().is_empty() {
        return Ok(base.to_path_buf());
    }
    let path = base.join(client);
    if path.as_os_str().len() > max_path_len() {
        bail!("path name too long");
    }
    Ok(path)
}

/// True when canonicalizing `path` leaves the subtree rooted at `base`.
///
/// Trailing components that do not exist yet (create targets) are allowed:
/// the deepest existing ancestor anchors the check, so a symlink in the
/// existing part cannot smuggle the tail outside the base.
pub fn escapes(base: &Path, path: &Path) -> Result<bool> {
    let canon_base = base
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", base.display()))?;

    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                missing.push(name.to_os_string());
                existing.pop();
            }
            None => return Ok(true),
        }
    }

    let mut canon = existing
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", existing.display()))?;
    for name in missing.iter().rev() {
        canon.push(name);
    }

    Ok(!canon.starts_with(&canon_base))
}

/// Path of the victim's cgroup relative to the requestor's, `"/"` when
/// they coincide. Fails when the victim is not inside the requestor's
/// subtree.
pub fn subtree_suffix(rpath: &Path, vpath: &Path) -> Result<String> {
    let suffix = vpath.strip_prefix(rpath).map_err(|_| {
        anyhow!(
            "{} is not below {}",
            vpath.display(),
            rpath.display()
        )
    })?;

    Ok(format!("/{}", suffix.display()))
}

#[cfg(test)]
mod tests {
    use std::path::Component;

    use super::*;
    use crate::test::create_temp_dir;

    #[test]
    fn test_empty_path_is_the_own_cgroup() {
        assert_eq!(normalize_client_path("").unwrap(), PathBuf::new());
    }

    #[test]
    fn test_leading_slash_rejected() {
        assert!(normalize_client_path("/a").is_err());
    }

    #[test]
    fn test_leading_dot_rejected() {
        assert!(normalize_client_path(".a").is_err());
        assert!(normalize_client_path("./a").is_err());
    }

    #[test]
    fn test_dotdot_rejected() {
        assert!(normalize_client_path("a/../b").is_err());
        assert!(normalize_client_path("a..b").is_err());
    }

    #[test]
    fn test_nul_rejected() {
        assert!(normalize_client_path("a\0b").is_err());
    }

    #[test]
    fn test_slash_runs_collapse() {
        assert_eq!(
            normalize_client_path("a//b///c").unwrap(),
            PathBuf::from("a/b/c")
        );
    }

    #[test]
    fn test_overlong_rejected() {
        let long = "a/".repeat(libc::PATH_MAX as usize);
        assert!(normalize_client_path(&long).is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("tasks").is_ok());
        assert!(validate_key("memory.limit_in_bytes").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("..").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key(".hidden").is_err());
    }

    #[test]
    fn test_resolve_empty_client_is_base() {
        let base = Path::new("/sys/fs/cgroup/memory/user");
        assert_eq!(resolve(base, Path::new("")).unwrap(), base);
    }

    #[test]
    fn test_escape_through_symlink_detected() {
        let tmp = create_temp_dir("test_escape_through_symlink_detected")
            .expect("create temp directory for test");
        let base = tmp.join("base");
        let outside = tmp.join("outside");
        std::fs::create_dir(&base).unwrap();
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, base.join("link")).unwrap();

        assert!(escapes(&base, &base.join("link")).unwrap());
        assert!(escapes(&base, &base.join("link/child")).unwrap());
        assert!(!escapes(&base, &base.join("plain/child")).unwrap());
    }

    #[test]
    fn test_suffix_of_equal_paths_is_root() {
        let r = Path::new("/sys/fs/cgroup/cpu/a");
        assert_eq!(subtree_suffix(r, r).unwrap(), "/");
    }

    #[test]
    fn test_suffix_of_descendant() {
        let r = Path::new("/sys/fs/cgroup/cpu");
        let v = Path::new("/sys/fs/cgroup/cpu/a/b");
        assert_eq!(subtree_suffix(r, v).unwrap(), "/a/b");
    }

    #[test]
    fn test_sibling_prefix_is_not_a_descendant() {
        // "ab" shares a string prefix with "a" but is not below it
        let r = Path::new("/sys/fs/cgroup/cpu/a");
        let v = Path::new("/sys/fs/cgroup/cpu/ab");
        assert!(subtree_suffix(r, v).is_err());
    }

    quickcheck! {
        fn prop_accepted_paths_are_plain_descendants(segments: Vec<String>) -> bool {
            let joined = segments.join("/");
            match normalize_client_path(&joined) {
                Ok(rel) => rel.components().all(|c| matches!(c, Component::Normal(_))),
                Err(_) => true,
            }
        }

        fn prop_dotdot_is_always_rejected(prefix: String, suffix: String) -> bool {
            normalize_client_path(&format!("{}..{}", prefix, suffix)).is_err()
        }
    }
}
