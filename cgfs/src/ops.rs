use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::{mkdir, Gid, Uid};

use crate::access::{self, AccessMode};
use crate::common::{self, Credentials, CGROUP_TASKS};
use crate::paths;

/// Outcome of a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existed {
    /// Every component of the requested path was already present.
    AllExisted,
    /// At least one directory had to be created.
    Created,
}

/// Outcome of a remove request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removed {
    Removed,
    DidNotExist,
}

/// Creates `cgroup` below `base`, component by component. Every fresh
/// directory is handed to the requestor: the directory itself and its
/// `tasks` and `cgroup.procs` files change owner, nothing else. A chown
/// failure removes the directory it was just performed on, so a retry
/// starts from a clean slate.
pub fn create_cgroup(base: &Path, cgroup: &str, creds: &Credentials) -> Result<Existed> {
    let rel = paths::normalize_client_path(cgroup)?;
    if rel.as_os_str().is_empty() {
        return Ok(Existed::AllExisted);
    }

    let target = paths::resolve(base, &rel)?;
    if paths::escapes(base, &target)? {
        bail!("cgroup path {} escapes {}", cgroup, base.display());
    }

    let mut existed = Existed::AllExisted;
    let mut dir = base.to_path_buf();
    for component in rel.components() {
        let parent = dir.clone();
        dir.push(component);

        if dir.is_dir() {
            if !access::may_access(creds, &dir, AccessMode::Read) {
                bail!(
                    "pid {} (uid {} gid {}) may not look under {}",
                    creds.pid,
                    creds.uid,
                    creds.gid,
                    dir.display()
                );
            }
            continue;
        }

        if !access::may_access(creds, &parent, AccessMode::ReadWrite) {
            bail!(
                "pid {} (uid {} gid {}) may not create under {}",
                creds.pid,
                creds.uid,
                creds.gid,
                parent.display()
            );
        }

        match mkdir(&dir, Mode::from_bits_truncate(0o755)) {
            Ok(()) => {}
            Err(Errno::EEXIST) => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to create {}", dir.display()))
            }
        }

        if let Err(e) = common::chown_cgroup_path(
            &dir,
            Uid::from_raw(creds.uid),
            Gid::from_raw(creds.gid),
        ) {
            let _ = fs::remove_dir(&dir);
            return Err(e);
        }

        existed = Existed::Created;
    }

    Ok(existed)
}

/// Removes `cgroup` below `base`. A missing target is not an error; the
/// caller needs write access to the parent of the removed directory.
/// Recursive removal visits subdirectories post-order and is best-effort:
/// a failure midway leaves the partial state behind.
pub fn remove_cgroup(
    base: &Path,
    cgroup: &str,
    creds: &Credentials,
    recursive: bool,
) -> Result<Removed> {
    let rel = paths::normalize_client_path(cgroup)?;
    if rel.as_os_str().is_empty() {
        return Ok(Removed::Removed);
    }

    let target = paths::resolve(base, &rel)?;
    if paths::escapes(base, &target)? {
        bail!("cgroup path {} escapes {}", cgroup, base.display());
    }
    if !target.is_dir() {
        return Ok(Removed::DidNotExist);
    }

    let parent = target.parent().context("cgroup has no parent")?;
    if !access::may_access(creds, parent, AccessMode::Write) {
        bail!(
            "pid {} ({}:{}) may not remove under {}",
            creds.pid,
            creds.uid,
            creds.gid,
            parent.display()
        );
    }

    if recursive {
        recursive_rmdir(&target)?;
    } else {
        fs::remove_dir(&target)
            .with_context(|| format!("failed to remove {}", target.display()))?;
    }

    Ok(Removed::Removed)
}

/// Attribute files cannot be unlinked from a cgroup; they vanish with
/// their directory, so only subdirectories are visited.
fn recursive_rmdir(dir: &Path) -> Result<()> {
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to open dir {}", dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            recursive_rmdir(&entry.path())?;
        }
    }

    fs::remove_dir(dir).with_context(|| format!("failed to remove {}", dir.display()))
}

/// Writes the victim pid into the `tasks` file of the destination cgroup.
pub fn move_pid(base: &Path, cgroup: &str, r: &Credentials, v: &Credentials) -> Result<()> {
    if !access::may_move(r.pid, r.uid, v.pid) {
        bail!("{} may not move {}", r.pid, v.pid);
    }

    let rel = paths::normalize_client_path(cgroup)?;
    let dir = paths::resolve(base, &rel)?;
    if paths::escapes(base, &dir)? {
        bail!("cgroup path {} escapes {}", cgroup, base.display());
    }
    if !access::may_access(r, &dir, AccessMode::Read) {
        bail!(
            "pid {} (uid {} gid {}) may not read under {}",
            r.pid,
            r.uid,
            r.gid,
            dir.display()
        );
    }

    let tasks = dir.join(CGROUP_TASKS);
    if !access::may_access(r, &tasks, AccessMode::Write) {
        bail!(
            "pid {} (uid {} gid {}) may not write to {}",
            r.pid,
            r.uid,
            r.gid,
            tasks.display()
        );
    }

    common::write_cgroup_file_str(&tasks, &format!("{}\n", v.pid))
}

/// Hands the target cgroup directory to the victim uid/gid. Only the
/// directory, `tasks` and `cgroup.procs` change owner; the new owner can
/// create subgroups but not raise the controller's limits.
pub fn chown_cgroup(base: &Path, cgroup: &str, r: &Credentials, v: &Credentials) -> Result<()> {
    let rel = paths::normalize_client_path(cgroup)?;
    let dir = paths::resolve(base, &rel)?;
    if paths::escapes(base, &dir)? {
        bail!("cgroup path {} escapes {}", cgroup, base.display());
    }
    if !access::may_access(r, &dir, AccessMode::Read) {
        bail!(
            "pid {} (uid {} gid {}) may not read under {}",
            r.pid,
            r.uid,
            r.gid,
            dir.display()
        );
    }
    if !access::may_access(r, &dir, AccessMode::ReadWrite) {
        bail!("pid {} may not chown {}", r.pid, dir.display());
    }

    common::chown_cgroup_path(&dir, Uid::from_raw(v.uid), Gid::from_raw(v.gid))
}

/// Reads one attribute file of the target cgroup and returns its bytes
/// verbatim, trailing newline included.
pub fn get_value(base: &Path, cgroup: &str, key: &str, creds: &Credentials) -> Result<String> {
    let file = attribute_path(base, cgroup, key, creds)?;
    if !access::may_access(creds, &file, AccessMode::Read) {
        bail!("pid {} may not read {}", creds.pid, file.display());
    }

    common::read_cgroup_file(&file)
}

/// Writes `value` to one attribute file of the target cgroup in a single
/// write, adding nothing of its own.
pub fn set_value(
    base: &Path,
    cgroup: &str,
    key: &str,
    value: &str,
    creds: &Credentials,
) -> Result<()> {
    let file = attribute_path(base, cgroup, key, creds)?;
    if !access::may_access(creds, &file, AccessMode::ReadWrite) {
        bail!("pid {} may not write {}", creds.pid, file.display());
    }

    common::write_cgroup_file_str(&file, value)
}

/// Pids in the target cgroup, one decimal entry per line of its `tasks`
/// file.
pub fn get_tasks(base: &Path, cgroup: &str, creds: &Credentials) -> Result<Vec<libc::pid_t>> {
    let tasks = attribute_path(base, cgroup, CGROUP_TASKS, creds)?;
    if !access::may_access(creds, &tasks, AccessMode::Read) {
        bail!("pid {} may not read {}", creds.pid, tasks.display());
    }

    common::read_cgroup_file(&tasks)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .parse::<libc::pid_t>()
                .with_context(|| format!("bad pid {:?} in {}", line, tasks.display()))
        })
        .collect()
}

/// Resolves cgroup and key into the attribute file path, after the caller
/// has proven read access to the containing directory.
fn attribute_path(
    base: &Path,
    cgroup: &str,
    key: &str,
    creds: &Credentials,
) -> Result<std::path::PathBuf> {
    paths::validate_key(key)?;

    let rel = paths::normalize_client_path(cgroup)?;
    let dir = paths::resolve(base, &rel)?;
    if paths::escapes(base, &dir)? {
        bail!("cgroup path {} escapes {}", cgroup, base.display());
    }
    if !access::may_access(creds, &dir, AccessMode::Read) {
        bail!("pid {} may not access {}", creds.pid, dir.display());
    }

    let file = dir.join(key);
    if file.as_os_str().len() > paths::max_path_len() {
        bail!("file name too long for cgroup {} key {}", cgroup, key);
    }

    Ok(file)
}
