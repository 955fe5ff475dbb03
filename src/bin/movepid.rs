//! Standalone test client: asks the broker to move a pid into a cgroup,
//! walking through the credential-passing handshake by hand.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::unistd::{getegid, geteuid, getpid};

use cgbroker::creds;
use cgfs::common::{Credentials, DEFAULT_CGROUP_ROOT};

#[derive(Parser, Debug)]
#[clap(version = "0.1.0", about = "Control group client")]
struct Opts {
    /// Controller for which to act
    #[clap(short, long)]
    controller: String,
    /// Cgroup name to which to move the pid
    #[clap(short, long)]
    name: String,
    /// Pid to move; defaults to the client itself
    #[clap(short, long)]
    pid: Option<libc::pid_t>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let pid = opts.pid.unwrap_or_else(|| getpid().as_raw());

    let socket = format!("{}/cgbroker/sock", DEFAULT_CGROUP_ROOT);
    let mut stream =
        UnixStream::connect(&socket).with_context(|| format!("failed to connect to {}", socket))?;

    let request = serde_json::json!({
        "method": "movePidScm",
        "controller": opts.controller,
        "cgroup": opts.name,
    });
    stream.write_all(format!("{}\n", request).as_bytes())?;

    // first kick asks for our own credentials
    wait_for_kick(&mut stream).context("did not get go-ahead from cgbroker")?;
    let own = Credentials::new(getpid().as_raw(), geteuid().as_raw(), getegid().as_raw());
    creds::send_credentials(stream.as_raw_fd(), &own)?;

    // second kick asks for the victim's
    wait_for_kick(&mut stream).context("did not get victim go-ahead from cgbroker")?;
    let victim = Credentials::new(pid, geteuid().as_raw(), getegid().as_raw());
    creds::send_credentials(stream.as_raw_fd(), &victim)?;

    let mut reply = [0u8; 1];
    stream
        .read_exact(&mut reply)
        .context("did not get final ack from cgbroker")?;
    match reply[0] {
        b'1' => Ok(()),
        b => bail!("cgbroker refused the move (reply {:?})", b as char),
    }
}

fn wait_for_kick(stream: &mut UnixStream) -> Result<()> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf)?;
    Ok(())
}
