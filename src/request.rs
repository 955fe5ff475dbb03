//! The request surface of the broker.
//!
//! Each connection carries exactly one request, framed as a single JSON
//! object on its own line. Every operation exists in two shapes: a plain
//! variant that names the victim by value and reads the requestor from
//! `SO_PEERCRED`, and an scm variant that collects requestor (and victim)
//! through the credential handshake, for callers in foreign namespaces.

use serde::Deserialize;

use cgfs::common::Credentials;

/// Single-byte replies shared by most operations.
pub const REPLY_FAILURE: u8 = b'0';
pub const REPLY_OK: u8 = b'1';
pub const REPLY_EXISTED: u8 = b'2';

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Request {
    Ping {
        #[serde(default)]
        junk: i32,
    },
    GetPidCgroup {
        controller: String,
        pid: libc::pid_t,
    },
    GetPidCgroupScm {
        controller: String,
    },
    MovePid {
        controller: String,
        cgroup: String,
        pid: libc::pid_t,
    },
    MovePidScm {
        controller: String,
        cgroup: String,
    },
    Create {
        controller: String,
        cgroup: String,
    },
    CreateScm {
        controller: String,
        cgroup: String,
    },
    Chown {
        controller: String,
        cgroup: String,
        uid: libc::uid_t,
        gid: libc::gid_t,
    },
    ChownScm {
        controller: String,
        cgroup: String,
    },
    GetValue {
        controller: String,
        cgroup: String,
        key: String,
    },
    GetValueScm {
        controller: String,
        cgroup: String,
        key: String,
    },
    SetValue {
        controller: String,
        cgroup: String,
        key: String,
        value: String,
    },
    SetValueScm {
        controller: String,
        cgroup: String,
        key: String,
        value: String,
    },
    Remove {
        controller: String,
        cgroup: String,
        #[serde(default)]
        recursive: bool,
    },
    RemoveScm {
        controller: String,
        cgroup: String,
        #[serde(default)]
        recursive: bool,
    },
    GetTasks {
        controller: String,
        cgroup: String,
    },
    GetTasksScm {
        controller: String,
        cgroup: String,
    },
}

impl Request {
    /// Scm variants gather the requestor, and possibly the victim, through
    /// the credential handshake instead of `SO_PEERCRED` and in-band
    /// arguments.
    pub fn is_scm(&self) -> bool {
        matches!(
            self,
            Request::GetPidCgroupScm { .. }
                | Request::MovePidScm { .. }
                | Request::CreateScm { .. }
                | Request::ChownScm { .. }
                | Request::GetValueScm { .. }
                | Request::SetValueScm { .. }
                | Request::RemoveScm { .. }
                | Request::GetTasksScm { .. }
        )
    }

    /// Two-cred requests act on a process or identity the kernel must
    /// vouch for with a second datagram.
    pub fn needs_victim_creds(&self) -> bool {
        matches!(
            self,
            Request::GetPidCgroupScm { .. }
                | Request::MovePidScm { .. }
                | Request::ChownScm { .. }
        )
    }

    /// Operations whose wire reply is a single status byte, so failure is
    /// the literal `'0'`. The payload-valued operations signal failure by
    /// writing nothing at all instead.
    pub fn replies_with_byte(&self) -> bool {
        !matches!(
            self,
            Request::GetPidCgroup { .. }
                | Request::GetPidCgroupScm { .. }
                | Request::GetValue { .. }
                | Request::GetValueScm { .. }
                | Request::GetTasks { .. }
                | Request::GetTasksScm { .. }
        )
    }

    /// Victim credentials synthesized from the by-value arguments of a
    /// plain request: pid with zeroed uid/gid, or a uid/gid pair with pid
    /// zero. `None` for single-cred operations.
    pub fn victim_from_args(&self) -> Option<Credentials> {
        match self {
            Request::GetPidCgroup { pid, .. } | Request::MovePid { pid, .. } => {
                Some(Credentials::new(*pid, 0, 0))
            }
            Request::Chown { uid, gid, .. } => Some(Credentials::new(0, *uid, *gid)),
            _ => None,
        }
    }

    /// Method name for the request log.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping { .. } => "Ping",
            Request::GetPidCgroup { .. } => "GetPidCgroup",
            Request::GetPidCgroupScm { .. } => "GetPidCgroupScm",
            Request::MovePid { .. } => "MovePid",
            Request::MovePidScm { .. } => "MovePidScm",
            Request::Create { .. } => "Create",
            Request::CreateScm { .. } => "CreateScm",
            Request::Chown { .. } => "Chown",
            Request::ChownScm { .. } => "ChownScm",
            Request::GetValue { .. } => "GetValue",
            Request::GetValueScm { .. } => "GetValueScm",
            Request::SetValue { .. } => "SetValue",
            Request::SetValueScm { .. } => "SetValueScm",
            Request::Remove { .. } => "Remove",
            Request::RemoveScm { .. } => "RemoveScm",
            Request::GetTasks { .. } => "GetTasks",
            Request::GetTasksScm { .. } => "GetTasksScm",
        }
    }
}
