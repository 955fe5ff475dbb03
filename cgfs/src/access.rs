use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nix::sys::stat::stat;

use crate::common::Credentials;

/// Open intent for a discretionary access check, mirroring the access
/// implied by `O_RDONLY`, `O_WRONLY` and `O_RDWR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    fn wanted_bits(self) -> u32 {
        match self {
            AccessMode::Read => 0o4,
            AccessMode::Write => 0o2,
            AccessMode::ReadWrite => 0o6,
        }
    }
}

/// Would a process with these credentials be permitted to open `path` with
/// `mode` under ordinary Unix semantics?
///
/// The answer is computed against the recorded request credentials, never
/// against the daemon's own privileges, and every directory leading to
/// `path` must also be searchable by the caller.
pub fn may_access(creds: &Credentials, path: &Path, mode: AccessMode) -> bool {
    if creds.uid == 0 {
        return true;
    }

    let groups = supplementary_groups(creds.pid).unwrap_or_default();

    for dir in path.ancestors().skip(1) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        if !allowed(creds, &groups, dir, 0o1) {
            log::debug!(
                "pid {} (uid {} gid {}) may not traverse {}",
                creds.pid,
                creds.uid,
                creds.gid,
                dir.display()
            );
            return false;
        }
    }

    allowed(creds, &groups, path, mode.wanted_bits())
}

fn allowed(creds: &Credentials, groups: &[libc::gid_t], path: &Path, wanted: u32) -> bool {
    let st = match stat(path) {
        Ok(st) => st,
        Err(_) => return false,
    };

    let mode = st.st_mode as u32;
    let granted = if st.st_uid == creds.uid {
        (mode >> 6) & 0o7
    } else if st.st_gid == creds.gid || groups.contains(&st.st_gid) {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };

    granted & wanted == wanted
}

/// May the requestor move the victim between cgroups? Root may move any
/// process, everyone may move themselves, and otherwise the requestor's
/// uid must own the victim.
pub fn may_move(r_pid: libc::pid_t, r_uid: libc::uid_t, v_pid: libc::pid_t) -> bool {
    if r_uid == 0 || r_pid == v_pid {
        return true;
    }
    real_uid(v_pid).map(|uid| uid == r_uid).unwrap_or(false)
}

/// Real uid of `pid`, from the first field of the `Uid:` line in
/// `/proc/<pid>/status`.
fn real_uid(pid: libc::pid_t) -> Result<libc::uid_t> {
    let status = read_status(pid)?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|field| field.parse().ok())
        .with_context(|| format!("no Uid line in status of pid {}", pid))
}

/// Supplementary groups of `pid`, from the `Groups:` line in
/// `/proc/<pid>/status`. Missing information degrades to an empty list;
/// the primary gid is checked separately.
fn supplementary_groups(pid: libc::pid_t) -> Result<Vec<libc::gid_t>> {
    Ok(parse_groups(&read_status(pid)?))
}

fn read_status(pid: libc::pid_t) -> Result<String> {
    let path = format!("/proc/{}/status", pid);
    fs::read_to_string(&path).with_context(|| format!("failed to read {}", path))
}

fn parse_groups(status: &str) -> Vec<libc::gid_t> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Groups:"))
        .map(|rest| {
            rest.split_whitespace()
                .filter_map(|field| field.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;

    use nix::unistd::{getgid, getpid, getuid};

    use super::*;
    use crate::test::{create_temp_dir, set_fixture};

    fn own_creds() -> Credentials {
        Credentials::new(getpid().as_raw(), getuid().as_raw(), getgid().as_raw())
    }

    #[test]
    fn test_owner_bits_grant_access() {
        let tmp = create_temp_dir("test_owner_bits_grant_access")
            .expect("create temp directory for test");
        let file = set_fixture(&tmp, "attr", "").expect("set fixture");
        fs::set_permissions(&file, Permissions::from_mode(0o600)).unwrap();

        assert!(may_access(&own_creds(), &file, AccessMode::Read));
        assert!(may_access(&own_creds(), &file, AccessMode::ReadWrite));
    }

    #[test]
    fn test_owner_bits_deny_access() {
        if getuid().is_root() {
            return;
        }
        let tmp = create_temp_dir("test_owner_bits_deny_access")
            .expect("create temp directory for test");
        let file = set_fixture(&tmp, "attr", "").expect("set fixture");
        fs::set_permissions(&file, Permissions::from_mode(0o400)).unwrap();

        assert!(may_access(&own_creds(), &file, AccessMode::Read));
        assert!(!may_access(&own_creds(), &file, AccessMode::Write));
        assert!(!may_access(&own_creds(), &file, AccessMode::ReadWrite));
    }

    #[test]
    fn test_other_bits_apply_to_strangers() {
        if getuid().is_root() {
            return;
        }
        let tmp = create_temp_dir("test_other_bits_apply_to_strangers")
            .expect("create temp directory for test");
        fs::set_permissions(tmp.path(), Permissions::from_mode(0o711)).unwrap();
        let file = set_fixture(&tmp, "attr", "").expect("set fixture");
        fs::set_permissions(&file, Permissions::from_mode(0o644)).unwrap();

        // a uid/gid that matches neither owner nor group of the fixture,
        // with our own pid so the groups lookup still works
        let stranger = Credentials::new(getpid().as_raw(), getuid().as_raw() + 1, 0xfffe);
        assert!(may_access(&stranger, &file, AccessMode::Read));
        assert!(!may_access(&stranger, &file, AccessMode::Write));
    }

    #[test]
    fn test_group_bits_grant_access() {
        if getuid().is_root() {
            return;
        }
        let tmp = create_temp_dir("test_group_bits_grant_access")
            .expect("create temp directory for test");
        fs::set_permissions(tmp.path(), Permissions::from_mode(0o710)).unwrap();
        let file = set_fixture(&tmp, "attr", "").expect("set fixture");
        fs::set_permissions(&file, Permissions::from_mode(0o640)).unwrap();

        // wrong uid, but the fixture's owning group matches
        let groupie = Credentials::new(getpid().as_raw(), getuid().as_raw() + 1, getgid().as_raw());
        assert!(may_access(&groupie, &file, AccessMode::Read));
        assert!(!may_access(&groupie, &file, AccessMode::Write));
    }

    #[test]
    fn test_untraversable_ancestor_denies() {
        if getuid().is_root() {
            return;
        }
        let tmp = create_temp_dir("test_untraversable_ancestor_denies")
            .expect("create temp directory for test");
        fs::set_permissions(tmp.path(), Permissions::from_mode(0o700)).unwrap();
        let file = set_fixture(&tmp, "attr", "").expect("set fixture");
        fs::set_permissions(&file, Permissions::from_mode(0o666)).unwrap();

        let stranger = Credentials::new(getpid().as_raw(), getuid().as_raw() + 1, 0xfffe);
        assert!(!may_access(&stranger, &file, AccessMode::Read));
    }

    #[test]
    fn test_missing_path_denies() {
        let tmp =
            create_temp_dir("test_missing_path_denies").expect("create temp directory for test");
        if getuid().is_root() {
            return;
        }
        assert!(!may_access(&own_creds(), &tmp.join("missing"), AccessMode::Read));
    }

    #[test]
    fn test_root_may_do_anything() {
        let tmp =
            create_temp_dir("test_root_may_do_anything").expect("create temp directory for test");
        let file = set_fixture(&tmp, "attr", "").expect("set fixture");
        fs::set_permissions(&file, Permissions::from_mode(0o000)).unwrap();

        let root = Credentials::new(1, 0, 0);
        assert!(may_access(&root, &file, AccessMode::ReadWrite));
    }

    #[test]
    fn test_may_move_self_and_root() {
        let pid = getpid().as_raw();
        assert!(may_move(pid, getuid().as_raw(), pid));
        assert!(may_move(1, 0, pid));
    }

    #[test]
    fn test_may_move_owned_process() {
        // we own ourselves, so a second credential set with our uid works
        assert!(may_move(1, getuid().as_raw(), getpid().as_raw()));
        assert!(!may_move(1, getuid().as_raw() + 1, getpid().as_raw()));
    }

    #[test]
    fn test_parse_groups() {
        let status = "Name:\tcat\nUid:\t1000\t1000\t1000\t1000\nGroups:\t4 24 1000\n";
        assert_eq!(parse_groups(status), vec![4, 24, 1000]);
        assert!(parse_groups("Name:\tcat\n").is_empty());
    }
}
