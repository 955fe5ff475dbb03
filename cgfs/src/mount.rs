use std::path::PathBuf;

use anyhow::{anyhow, Result};
use procfs::process::Process;

/// Finds the mount point of a cgroup controller.
///
/// Controllers may be co-mounted (`cpu,cpuacct`, `net_cls,net_prio`), so a
/// mount matches when any comma-separated component of its final path
/// segment equals the controller name.
pub fn controller_mount_point(controller: &str) -> Result<PathBuf> {
    Process::myself()?
        .mountinfo()?
        .into_iter()
        .find(|m| {
            m.fs_type == "cgroup"
                && m.mount_point
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.split(',').any(|c| c == controller))
                    .unwrap_or(false)
        })
        .map(|m| m.mount_point)
        .ok_or_else(|| anyhow!("could not find mount point for controller {}", controller))
}
