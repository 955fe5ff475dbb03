//! Per-operation executors.
//!
//! Each executor re-derives the requestor's own cgroup from the kernel,
//! applies the namespace guards it owns, and performs the filesystem work
//! through `cgfs`. Nothing here trusts an in-band identifier: requestor and
//! victim arrive as kernel-attested credentials.

use anyhow::{bail, Result};

use cgfs::common::Credentials;
use cgfs::ns::{self, NsIds};
use cgfs::ops as fsops;
use cgfs::paths;

pub use cgfs::ops::{Existed, Removed};

pub fn create(controller: &str, cgroup: &str, r: &Credentials) -> Result<Existed> {
    let base = paths::pid_cgroup(r.pid, controller)?;
    let existed = fsops::create_cgroup(&base, cgroup, r)?;
    log::info!(
        "created {}:{} for {} ({}:{})",
        controller,
        cgroup,
        r.pid,
        r.uid,
        r.gid
    );
    Ok(existed)
}

pub fn remove(controller: &str, cgroup: &str, r: &Credentials, recursive: bool) -> Result<Removed> {
    let base = paths::pid_cgroup(r.pid, controller)?;
    let removed = fsops::remove_cgroup(&base, cgroup, r, recursive)?;
    if removed == Removed::Removed {
        log::info!(
            "removed {}:{} for {} ({}:{})",
            controller,
            cgroup,
            r.pid,
            r.uid,
            r.gid
        );
    }
    Ok(removed)
}

pub fn move_pid(controller: &str, cgroup: &str, r: &Credentials, v: &Credentials) -> Result<()> {
    let base = paths::pid_cgroup(r.pid, controller)?;
    fsops::move_pid(&base, cgroup, r, v)?;
    log::info!(
        "{} moved to {}:{} by {}'s request",
        v.pid,
        controller,
        cgroup,
        r.pid
    );
    Ok(())
}

/// Changing the owner of a cgroup requires privilege over two uids, so the
/// peer must sit in the daemon's pid and user namespaces and map to root
/// inside its own user namespace.
pub fn chown(
    ns_ids: &NsIds,
    controller: &str,
    cgroup: &str,
    r: &Credentials,
    v: &Credentials,
) -> Result<()> {
    if !ns_ids.same_pidns(r.pid) {
        bail!("chown called from a foreign pid namespace");
    }
    if !ns_ids.same_userns(r.pid) {
        bail!("chown called from a foreign user namespace");
    }
    match ns::host_uid_to_ns(r.uid, r.pid).unwrap_or(None) {
        Some(0) => {}
        _ => bail!("chown requested by non-root uid {}", r.uid),
    }

    let base = paths::pid_cgroup(r.pid, controller)?;
    fsops::chown_cgroup(&base, cgroup, r, v)
}

/// Reports the victim's cgroup relative to the requestor's own, `"/"` when
/// they coincide. The victim must live below the requestor in the named
/// controller.
pub fn get_pid_cgroup(
    ns_ids: &NsIds,
    controller: &str,
    r: &Credentials,
    v: &Credentials,
) -> Result<String> {
    if !ns_ids.same_pidns(r.pid) {
        bail!("getPidCgroup called from a foreign pid namespace");
    }

    let rpath = paths::pid_cgroup(r.pid, controller)?;
    let vpath = paths::pid_cgroup(v.pid, controller)?;
    paths::subtree_suffix(&rpath, &vpath)
}

pub fn get_value(controller: &str, cgroup: &str, key: &str, r: &Credentials) -> Result<String> {
    let base = paths::pid_cgroup(r.pid, controller)?;
    fsops::get_value(&base, cgroup, key, r)
}

pub fn set_value(
    controller: &str,
    cgroup: &str,
    key: &str,
    value: &str,
    r: &Credentials,
) -> Result<()> {
    let base = paths::pid_cgroup(r.pid, controller)?;
    fsops::set_value(&base, cgroup, key, value, r)
}

pub fn get_tasks(controller: &str, cgroup: &str, r: &Credentials) -> Result<Vec<libc::pid_t>> {
    let base = paths::pid_cgroup(r.pid, controller)?;
    fsops::get_tasks(&base, cgroup, r)
}

#[cfg(test)]
mod tests {
    use nix::unistd::{getgid, getpid, getuid};

    use super::*;

    fn own_creds() -> Credentials {
        Credentials::new(getpid().as_raw(), getuid().as_raw(), getgid().as_raw())
    }

    #[test]
    fn test_chown_rejects_foreign_pidns() {
        // a snapshot that can never match any live process
        let ns_ids = NsIds {
            pid_ns: Some(0),
            user_ns: Some(0),
        };
        let creds = own_creds();
        assert!(chown(&ns_ids, "memory", "a", &creds, &creds).is_err());
    }

    #[test]
    fn test_get_pid_cgroup_rejects_foreign_pidns() {
        let ns_ids = NsIds {
            pid_ns: Some(0),
            user_ns: Some(0),
        };
        let creds = own_creds();
        assert!(get_pid_cgroup(&ns_ids, "memory", &creds, &creds).is_err());
    }
}
