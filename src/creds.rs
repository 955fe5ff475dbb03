//! Kernel-attested credential exchange over a local socket.
//!
//! No in-band identifier can be trusted when the peer lives in another
//! namespace, so both requestor and victim identities travel as
//! `SCM_CREDENTIALS` ancillary data which the kernel validates against the
//! sender and translates across namespace boundaries.

use std::os::unix::io::RawFd;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::socket::{
    self, sockopt, ControlMessage, ControlMessageOwned, MsgFlags, UnixCredentials,
};
use nix::sys::uio::IoVec;

use cgfs::common::Credentials;

/// One kick byte tells the peer to transmit the next credential datagram.
pub const KICK: u8 = b'1';

/// Identity of the connected peer as recorded by the kernel at connect
/// time.
pub fn peer_credentials(fd: RawFd) -> Result<Credentials> {
    let ucred = socket::getsockopt(fd, sockopt::PeerCredentials)
        .context("failed to read peer credentials")?;
    Ok(Credentials::new(ucred.pid(), ucred.uid(), ucred.gid()))
}

/// Asks the kernel to attach sender credentials to every datagram received
/// on this socket from now on.
pub fn enable_cred_passing(fd: RawFd) -> Result<()> {
    socket::setsockopt(fd, sockopt::PassCred, &true).context("failed to set SO_PASSCRED")
}

/// Receives one credential-bearing datagram. `None` when the socket has no
/// data yet; the payload byte is discarded, only the attested triple
/// matters.
pub fn recv_credentials(fd: RawFd) -> Result<Option<Credentials>> {
    let mut buf = [0u8; 1];
    let iov = [IoVec::from_mut_slice(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!(UnixCredentials);

    let msg = match socket::recvmsg(fd, &iov, Some(&mut cmsg_buffer), MsgFlags::empty()) {
        Ok(msg) => msg,
        Err(Errno::EAGAIN) => return Ok(None),
        Err(Errno::EINTR) => return Ok(None),
        Err(e) => return Err(e).context("failed to receive credential datagram"),
    };
    if msg.bytes == 0 {
        bail!("peer closed the socket mid-exchange");
    }

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmCredentials(ucred) = cmsg {
            return Ok(Some(Credentials::new(ucred.pid(), ucred.uid(), ucred.gid())));
        }
    }

    bail!("credential datagram carried no SCM_CREDENTIALS")
}

/// Sends `creds` as an `SCM_CREDENTIALS` datagram with a one-byte payload.
/// The kernel refuses triples the sender has no privilege to claim.
pub fn send_credentials(fd: RawFd, creds: &Credentials) -> Result<()> {
    let ucred: UnixCredentials = libc::ucred {
        pid: creds.pid,
        uid: creds.uid,
        gid: creds.gid,
    }
    .into();
    let iov = [IoVec::from_slice(b"p")];
    let cmsgs = [ControlMessage::ScmCredentials(&ucred)];

    socket::sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), None)
        .context("failed to send credential datagram")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use nix::unistd::{getgid, getpid, getuid};

    use super::*;

    fn own_creds() -> Credentials {
        Credentials::new(getpid().as_raw(), getuid().as_raw(), getgid().as_raw())
    }

    #[test]
    fn test_kick_byte_value() {
        assert_eq!(KICK, b'1');
    }

    #[test]
    fn test_credentials_round_trip() {
        let (sender, receiver) = UnixStream::pair().expect("socketpair");
        enable_cred_passing(receiver.as_raw_fd()).expect("enable SO_PASSCRED");

        let me = own_creds();
        send_credentials(sender.as_raw_fd(), &me).expect("send credentials");

        let got = recv_credentials(receiver.as_raw_fd())
            .expect("receive credentials")
            .expect("datagram ready");
        assert_eq!(got, me);
    }

    #[test]
    fn test_peer_credentials_are_our_own() {
        let (a, _b) = UnixStream::pair().expect("socketpair");
        let peer = peer_credentials(a.as_raw_fd()).expect("peer credentials");
        assert_eq!(peer, own_creds());
    }

    #[test]
    fn test_recv_without_passcred_has_no_ancillary() {
        let (sender, receiver) = UnixStream::pair().expect("socketpair");
        send_credentials(sender.as_raw_fd(), &own_creds()).expect("send credentials");

        // without SO_PASSCRED the kernel strips the ancillary payload
        assert!(recv_credentials(receiver.as_raw_fd()).is_err());
    }
}
