//! Startup plumbing: the socket directory under the cgroup root, the
//! stale-socket cleanup, and daemonization.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::mount::{mount, MsFlags};

pub const SOCKET_DIR: &str = "cgbroker";
pub const SOCKET_FILE: &str = "sock";

/// Prepares the directory that holds the broker socket and returns the
/// socket path.
///
/// The cgroup root is normally a tmpfs put there by the init system; when
/// it turns out to be read-only a small tmpfs is mounted over it so the
/// socket can live at the well-known path containers get bind-mounted.
pub fn setup_socket_dir(root: &Path) -> Result<PathBuf> {
    if !root.is_dir() {
        bail!("{} does not exist", root.display());
    }

    let dir = root.join(SOCKET_DIR);
    let sock = dir.join(SOCKET_FILE);

    if daemon_running(&sock) {
        bail!("cgbroker is already running on {}", sock.display());
    }
    if sock.exists() {
        fs::remove_file(&sock)
            .with_context(|| format!("failed to delete stale socket {}", sock.display()))?;
    }

    if !writable(root) {
        mount(
            Some("cgroup"),
            root,
            Some("tmpfs"),
            MsFlags::empty(),
            Some("size=10000"),
        )
        .with_context(|| format!("failed to mount tmpfs on {}", root.display()))?;
        log::debug!("mounted tmpfs onto {}", root.display());
    }

    match fs::create_dir(&dir) {
        Ok(()) => {}
        Err(ref e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(e).with_context(|| format!("could not create {}", dir.display()));
        }
    }

    Ok(sock)
}

/// Detaches from the controlling terminal. The working directory is kept
/// so relative log paths stay valid.
pub fn daemonise() -> Result<()> {
    nix::unistd::daemon(true, false).context("unable to become daemon")
}

/// A live daemon answers a connect on its socket; a stale socket file
/// refuses it.
fn daemon_running(sock: &Path) -> bool {
    UnixStream::connect(sock).is_ok()
}

fn writable(dir: &Path) -> bool {
    let probe = dir.join(".cgbroker-probe");
    let _ = fs::remove_file(&probe);
    match fs::File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_root_fails() {
        assert!(setup_socket_dir(Path::new("/no/such/root")).is_err());
    }

    #[test]
    fn test_socket_dir_is_created_under_writable_root() {
        let root = std::env::temp_dir().join("test_socket_dir_is_created");
        fs::create_dir_all(&root).unwrap();

        let sock = setup_socket_dir(&root).expect("set up socket dir");
        assert_eq!(sock, root.join(SOCKET_DIR).join(SOCKET_FILE));
        assert!(root.join(SOCKET_DIR).is_dir());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_stale_socket_is_removed() {
        let root = std::env::temp_dir().join("test_stale_socket_is_removed");
        let dir = root.join(SOCKET_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SOCKET_FILE), b"").unwrap();

        let sock = setup_socket_dir(&root).expect("set up socket dir");
        assert!(!sock.exists());

        let _ = fs::remove_dir_all(&root);
    }
}
