use std::fs;

use anyhow::{Context, Result};
use nix::unistd::getpid;

/// Namespace identifiers of the daemon itself, snapshotted once at startup
/// and treated as immutable configuration from then on.
///
/// `None` means the kernel does not expose that namespace type; every
/// same-namespace check then passes, matching hosts without namespace
/// support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NsIds {
    pub pid_ns: Option<u64>,
    pub user_ns: Option<u64>,
}

impl NsIds {
    pub fn snapshot() -> Self {
        let pid = getpid().as_raw();
        NsIds {
            pid_ns: ns_id(pid, "pid").ok(),
            user_ns: ns_id(pid, "user").ok(),
        }
    }

    /// True when `pid` lives in the same pid namespace as the daemon.
    pub fn same_pidns(&self, pid: libc::pid_t) -> bool {
        match self.pid_ns {
            Some(own) => ns_id(pid, "pid").map(|other| other == own).unwrap_or(false),
            None => true,
        }
    }

    /// True when `pid` lives in the same user namespace as the daemon.
    pub fn same_userns(&self, pid: libc::pid_t) -> bool {
        match self.user_ns {
            Some(own) => ns_id(pid, "user").map(|other| other == own).unwrap_or(false),
            None => true,
        }
    }
}

/// Reads the namespace id of `pid` from the `/proc/<pid>/ns/<kind>`
/// symlink, whose target has the form `pid:[4026531836]`.
fn ns_id(pid: libc::pid_t, kind: &str) -> Result<u64> {
    let link = format!("/proc/{}/ns/{}", pid, kind);
    let target = fs::read_link(&link).with_context(|| format!("failed to read {}", link))?;
    let target = target.to_string_lossy().into_owned();

    let open = target.find('[');
    let close = target.find(']');
    match (open, close) {
        (Some(open), Some(close)) if open + 1 < close => target[open + 1..close]
            .parse()
            .with_context(|| format!("unexpected namespace link target {}", target)),
        _ => anyhow::bail!("unexpected namespace link target {}", target),
    }
}

/// Reports what `host_uid` appears as inside the user namespace of `pid`,
/// by scanning that process's uid mapping table. `None` when the host uid
/// is not mapped there at all.
pub fn host_uid_to_ns(host_uid: libc::uid_t, pid: libc::pid_t) -> Result<Option<libc::uid_t>> {
    let path = format!("/proc/{}/uid_map", pid);
    let map = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path))?;
    Ok(lookup_uid_map(&map, host_uid))
}

fn lookup_uid_map(map: &str, host_uid: libc::uid_t) -> Option<libc::uid_t> {
    for line in map.lines() {
        let mut fields = line.split_whitespace();
        let range = (
            fields.next().and_then(|f| f.parse::<u32>().ok()),
            fields.next().and_then(|f| f.parse::<u32>().ok()),
            fields.next().and_then(|f| f.parse::<u32>().ok()),
        );
        if let (Some(inside), Some(outside), Some(count)) = range {
            if host_uid >= outside && host_uid - outside < count {
                return Some(inside + (host_uid - outside));
            }
        }
    }
    None
}
