//! The transport server and per-request credential-exchange state machine.
//!
//! One single-threaded readiness loop owns the listening socket and every
//! live request context. A context is created on accept, mutated only from
//! this loop, and torn down after the final reply or the first I/O error;
//! no state is shared between requests.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Context, Result};
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};

use cgfs::common::Credentials;
use cgfs::ns::NsIds;

use crate::creds;
use crate::ops;
use crate::request::{Request, REPLY_EXISTED, REPLY_FAILURE, REPLY_OK};

const SERVER: Token = Token(0);
const MAX_EVENTS: usize = 128;

/// A request frame has no business being larger than a couple of paths.
const MAX_REQUEST_LEN: usize = 2 * libc::PATH_MAX as usize;

/// Progress of one connection through its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Reading the JSON request line.
    AwaitRequest,
    /// Waiting for the requestor's credential datagram.
    AwaitRequestor,
    /// Waiting for the victim's credential datagram.
    AwaitVictim,
}

enum Progress {
    /// Nothing more to read right now; keep the context.
    Pending,
    /// The state machine advanced; try to make more progress.
    Advanced,
    /// The reply went out (or was abandoned); tear the context down.
    Done,
}

struct Conn {
    stream: UnixStream,
    buf: Vec<u8>,
    step: Step,
    request: Option<Request>,
    rcred: Option<Credentials>,
}

pub struct Server {
    poll: Poll,
    listener: UnixListener,
    conns: HashMap<Token, Conn>,
    next_token: usize,
    ns_ids: NsIds,
}

impl Server {
    pub fn bind(socket_path: &Path, ns_ids: NsIds) -> Result<Self> {
        let mut listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, SERVER, Interest::READABLE)?;

        Ok(Server {
            poll,
            listener,
            conns: HashMap::new(),
            next_token: 1,
            ns_ids,
        })
    }

    /// Serves requests until the process dies. Peer disconnects and bad
    /// requests only ever kill their own context.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        loop {
            self.poll.poll(&mut events, None)?;
            for event in events.iter() {
                match event.token() {
                    SERVER => self.accept()?,
                    token => self.drive(token),
                }
            }
        }
    }

    fn accept(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    log::debug!("connection from private client on token {}", token.0);
                    self.conns.insert(
                        token,
                        Conn {
                            stream,
                            buf: Vec::new(),
                            step: Step::AwaitRequest,
                            request: None,
                            rcred: None,
                        },
                    );
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("accept failed"),
            }
        }
    }

    /// Advances one connection as far as the socket allows. Any error
    /// aborts the request immediately; no partial state persists.
    fn drive(&mut self, token: Token) {
        let ns_ids = self.ns_ids;
        let conn = match self.conns.get_mut(&token) {
            Some(conn) => conn,
            None => return,
        };

        loop {
            match Self::step(&ns_ids, conn) {
                Ok(Progress::Pending) => return,
                Ok(Progress::Advanced) => continue,
                Ok(Progress::Done) => break,
                Err(e) => {
                    log::error!("request aborted: {:#}", e);
                    // A broken handshake still owes byte-reply operations
                    // their failure code; a request that never decoded
                    // gets the generic one. Payload-valued operations
                    // fail by replying nothing.
                    let failure_byte = match &conn.request {
                        Some(req) => req.replies_with_byte(),
                        None => conn.step == Step::AwaitRequest,
                    };
                    if failure_byte {
                        let _ = conn.stream.write_all(&[REPLY_FAILURE]);
                    }
                    break;
                }
            }
        }

        if let Some(mut conn) = self.conns.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }

    fn step(ns_ids: &NsIds, conn: &mut Conn) -> Result<Progress> {
        match conn.step {
            Step::AwaitRequest => {
                let req = match read_request(conn)? {
                    Some(req) => req,
                    None => return Ok(Progress::Pending),
                };

                if req.is_scm() {
                    creds::enable_cred_passing(conn.stream.as_raw_fd())?;
                    kick(&mut conn.stream)?;
                    conn.request = Some(req);
                    conn.step = Step::AwaitRequestor;
                    return Ok(Progress::Advanced);
                }

                let r = creds::peer_credentials(conn.stream.as_raw_fd())?;
                log::info!(
                    "{}: client is pid={} uid={} gid={}",
                    req.name(),
                    r.pid,
                    r.uid,
                    r.gid
                );
                let v = req.victim_from_args();
                execute_and_reply(ns_ids, &mut conn.stream, &req, &r, v.as_ref(), false);
                Ok(Progress::Done)
            }
            Step::AwaitRequestor => {
                let r = match creds::recv_credentials(conn.stream.as_raw_fd())? {
                    Some(r) => r,
                    None => return Ok(Progress::Pending),
                };

                let req = conn.request.take().context("no request in context")?;
                log::info!(
                    "{}: client is pid={} uid={} gid={}",
                    req.name(),
                    r.pid,
                    r.uid,
                    r.gid
                );
                if req.needs_victim_creds() {
                    conn.rcred = Some(r);
                    conn.request = Some(req);
                    kick(&mut conn.stream)?;
                    conn.step = Step::AwaitVictim;
                    return Ok(Progress::Advanced);
                }

                execute_and_reply(ns_ids, &mut conn.stream, &req, &r, None, true);
                Ok(Progress::Done)
            }
            Step::AwaitVictim => {
                let v = match creds::recv_credentials(conn.stream.as_raw_fd())? {
                    Some(v) => v,
                    None => return Ok(Progress::Pending),
                };

                let r = conn
                    .rcred
                    .take()
                    .context("requestor credentials missing from context")?;
                let req = conn.request.take().context("no request in context")?;
                execute_and_reply(ns_ids, &mut conn.stream, &req, &r, Some(&v), true);
                Ok(Progress::Done)
            }
        }
    }
}

/// Reads until the request line is complete. `None` means the socket ran
/// dry before the newline arrived.
fn read_request(conn: &mut Conn) -> Result<Option<Request>> {
    let mut chunk = [0u8; 1024];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => bail!("peer closed before sending a full request"),
            Ok(n) => {
                conn.buf.extend_from_slice(&chunk[..n]);
                if conn.buf.len() > MAX_REQUEST_LEN {
                    bail!("request too large");
                }
                if let Some(pos) = conn.buf.iter().position(|&b| b == b'\n') {
                    let req = serde_json::from_slice(&conn.buf[..pos])
                        .context("malformed request")?;
                    return Ok(Some(req));
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("failed to read request"),
        }
    }
}

fn kick(stream: &mut UnixStream) -> Result<()> {
    stream
        .write_all(&[creds::KICK])
        .context("failed to kick the client")
}

/// Runs the executor for the decoded request and writes the compact reply.
/// Executor failures become the operation's negative reply; the structured
/// error only reaches the log.
fn execute_and_reply(
    ns_ids: &NsIds,
    stream: &mut UnixStream,
    req: &Request,
    r: &Credentials,
    v: Option<&Credentials>,
    scm: bool,
) {
    match req {
        Request::Ping { .. } => reply_byte(stream, REPLY_OK),

        Request::Create { controller, cgroup } | Request::CreateScm { controller, cgroup } => {
            match ops::create(controller, cgroup, r) {
                Ok(ops::Existed::AllExisted) => reply_byte(stream, REPLY_EXISTED),
                Ok(ops::Existed::Created) => reply_byte(stream, REPLY_OK),
                Err(e) => reply_failure(stream, req, e),
            }
        }

        Request::Remove {
            controller,
            cgroup,
            recursive,
        }
        | Request::RemoveScm {
            controller,
            cgroup,
            recursive,
        } => match ops::remove(controller, cgroup, r, *recursive) {
            Ok(ops::Removed::Removed) => reply_byte(stream, REPLY_EXISTED),
            Ok(ops::Removed::DidNotExist) => reply_byte(stream, REPLY_OK),
            Err(e) => reply_failure(stream, req, e),
        },

        Request::MovePid {
            controller, cgroup, ..
        }
        | Request::MovePidScm { controller, cgroup } => {
            match v.context("movePid without victim credentials") {
                Ok(v) => match ops::move_pid(controller, cgroup, r, v) {
                    Ok(()) => reply_byte(stream, REPLY_OK),
                    Err(e) => reply_failure(stream, req, e),
                },
                Err(e) => reply_failure(stream, req, e),
            }
        }

        Request::Chown {
            controller, cgroup, ..
        }
        | Request::ChownScm { controller, cgroup } => {
            match v.context("chown without victim credentials") {
                Ok(v) => match ops::chown(ns_ids, controller, cgroup, r, v) {
                    Ok(()) => reply_byte(stream, REPLY_OK),
                    Err(e) => reply_failure(stream, req, e),
                },
                Err(e) => reply_failure(stream, req, e),
            }
        }

        Request::SetValue {
            controller,
            cgroup,
            key,
            value,
        }
        | Request::SetValueScm {
            controller,
            cgroup,
            key,
            value,
        } => match ops::set_value(controller, cgroup, key, value, r) {
            Ok(()) => reply_byte(stream, REPLY_OK),
            Err(e) => reply_failure(stream, req, e),
        },

        Request::GetValue {
            controller,
            cgroup,
            key,
        }
        | Request::GetValueScm {
            controller,
            cgroup,
            key,
        } => match ops::get_value(controller, cgroup, key, r) {
            Ok(value) => reply_string(stream, &value),
            Err(e) => reply_nothing(req, e),
        },

        Request::GetPidCgroup { controller, .. } | Request::GetPidCgroupScm { controller } => {
            match v.context("getPidCgroup without victim credentials") {
                Ok(v) => match ops::get_pid_cgroup(ns_ids, controller, r, v) {
                    Ok(path) => reply_string(stream, &path),
                    Err(e) => reply_nothing(req, e),
                },
                Err(e) => reply_nothing(req, e),
            }
        }

        Request::GetTasks { controller, cgroup } | Request::GetTasksScm { controller, cgroup } => {
            match ops::get_tasks(controller, cgroup, r) {
                Ok(pids) => reply_tasks(stream, &pids, scm),
                Err(e) => reply_nothing(req, e),
            }
        }
    }
}

fn reply_byte(stream: &mut UnixStream, byte: u8) {
    if let Err(e) = stream.write_all(&[byte]) {
        log::error!("error writing final result to client: {}", e);
    }
}

fn reply_string(stream: &mut UnixStream, value: &str) {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    if let Err(e) = stream.write_all(&out) {
        log::error!("error writing final result to client: {}", e);
    }
}

/// String-valued operations signal failure with a zero-length reply: the
/// client reads EOF instead of a NUL-terminated payload.
fn reply_nothing(req: &Request, err: anyhow::Error) {
    log::error!("{}: {:#}", req.name(), err);
}

fn reply_failure(stream: &mut UnixStream, req: &Request, err: anyhow::Error) {
    log::error!("{}: {:#}", req.name(), err);
    reply_byte(stream, REPLY_FAILURE);
}

/// The task list starts with a 32-bit little-endian count. The scm variant
/// then sends each pid as a credential datagram so the kernel re-attests
/// it across a possible namespace boundary; the plain variant sends the
/// pids by value.
fn reply_tasks(stream: &mut UnixStream, pids: &[libc::pid_t], scm: bool) {
    let count = (pids.len() as u32).to_le_bytes();
    if let Err(e) = stream.write_all(&count) {
        log::error!("error writing task count to client: {}", e);
        return;
    }

    if scm {
        for pid in pids {
            let pid_creds = Credentials::new(*pid, 0, 0);
            if let Err(e) = creds::send_credentials(stream.as_raw_fd(), &pid_creds) {
                log::error!("error writing pids back to client: {:#}", e);
                return;
            }
        }
    } else {
        let mut out = Vec::with_capacity(4 * pids.len());
        for pid in pids {
            out.extend_from_slice(&pid.to_le_bytes());
        }
        if let Err(e) = stream.write_all(&out) {
            log::error!("error writing pids back to client: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream as StdUnixStream;

    use super::*;

    fn stream_pair() -> (UnixStream, StdUnixStream) {
        let (ours, theirs) = StdUnixStream::pair().expect("socketpair");
        ours.set_nonblocking(true).expect("set nonblocking");
        (UnixStream::from_std(ours), theirs)
    }

    #[test]
    fn test_string_reply_is_nul_terminated() {
        let (mut ours, mut theirs) = stream_pair();
        reply_string(&mut ours, "/a/b");

        let mut buf = [0u8; 5];
        theirs.read_exact(&mut buf).expect("read reply");
        assert_eq!(&buf, b"/a/b\0");
    }

    #[test]
    fn test_plain_task_reply_encoding() {
        let (mut ours, mut theirs) = stream_pair();
        reply_tasks(&mut ours, &[1, 258], false);

        let mut buf = [0u8; 12];
        theirs.read_exact(&mut buf).expect("read reply");
        assert_eq!(&buf[..4], &2u32.to_le_bytes());
        assert_eq!(&buf[4..8], &1i32.to_le_bytes());
        assert_eq!(&buf[8..], &258i32.to_le_bytes());
    }

    #[test]
    fn test_failure_replies_are_one_byte() {
        let (mut ours, mut theirs) = stream_pair();
        reply_failure(&mut ours, &Request::Ping { junk: 0 }, anyhow::anyhow!("nope"));

        let mut buf = [0u8; 1];
        theirs.read_exact(&mut buf).expect("read reply");
        assert_eq!(buf[0], REPLY_FAILURE);
    }
}
