use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nix::unistd::{chown, Gid, Uid};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const CGROUP_TASKS: &str = "tasks";

/// A kernel-attested (pid, uid, gid) triple for one end of a request.
///
/// Each request carries a requestor (the connected peer) and possibly a
/// victim: the process or identity the request acts upon. A victim may be
/// synthetic, with pid 0, when the operation targets a uid/gid pair rather
/// than a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl Credentials {
    pub fn new(pid: libc::pid_t, uid: libc::uid_t, gid: libc::gid_t) -> Self {
        Self { pid, uid, gid }
    }
}

#[inline]
pub fn write_cgroup_file_str<P: AsRef<Path>>(path: P, data: &str) -> Result<()> {
    use std::io::Write;

    fs::OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path.as_ref())
        .with_context(|| format!("failed to open {:?}", path.as_ref()))?
        .write_all(data.as_bytes())
        .with_context(|| format!("failed to write to {:?}", path.as_ref()))?;

    Ok(())
}

#[inline]
pub fn read_cgroup_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))
}

/// Changes ownership of a cgroup directory together with its `tasks` and
/// `cgroup.procs` files. The controller's other attribute files keep their
/// previous owner, so the new owner can create subgroups and move tasks but
/// cannot raise the limits encoded in the resource knobs.
pub fn chown_cgroup_path(path: &Path, uid: Uid, gid: Gid) -> Result<()> {
    chown(path, Some(uid), Some(gid))
        .with_context(|| format!("failed to chown {} to {}:{}", path.display(), uid, gid))?;

    for file in &[CGROUP_TASKS, CGROUP_PROCS] {
        let target = path.join(file);
        if target.exists() {
            chown(&target, Some(uid), Some(gid)).with_context(|| {
                format!("failed to chown {} to {}:{}", target.display(), uid, gid)
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{create_temp_dir, set_fixture};
    use nix::unistd::{getgid, getuid};

    #[test]
    fn test_write_cgroup_file_does_not_create() {
        let tmp = create_temp_dir("test_write_cgroup_file_does_not_create")
            .expect("create temp directory for test");
        assert!(write_cgroup_file_str(tmp.join("missing"), "1").is_err());
        assert!(!tmp.join("missing").exists());
    }

    #[test]
    fn test_read_back_written_value() {
        let tmp = create_temp_dir("test_read_back_written_value")
            .expect("create temp directory for test");
        let file = set_fixture(&tmp, "memory.limit_in_bytes", "0").expect("set fixture");
        write_cgroup_file_str(&file, "1048576").expect("write value");
        assert_eq!(read_cgroup_file(&file).expect("read value"), "1048576");
    }

    #[test]
    fn test_chown_cgroup_path_touches_only_the_trio() {
        let tmp = create_temp_dir("test_chown_cgroup_path_touches_only_the_trio")
            .expect("create temp directory for test");
        set_fixture(&tmp, CGROUP_TASKS, "").expect("set fixture");
        set_fixture(&tmp, CGROUP_PROCS, "").expect("set fixture");
        set_fixture(&tmp, "memory.limit_in_bytes", "0").expect("set fixture");

        // chown to our own uid/gid is a no-op the kernel permits for
        // unprivileged users, which is all this test needs.
        chown_cgroup_path(&tmp, getuid(), getgid()).expect("chown cgroup path");
    }
}
