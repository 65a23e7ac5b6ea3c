//! Listener hand-over between a restarting process and its child.
//!
//! The parent starts its own executable again with the listening sockets
//! duplicated onto fds 3, 4, … and `EUDORE_GRACEFUL_ADDRS=<addr1>,<addr2>,…`
//! naming them in the same order. The child adopts those fds instead of
//! binding, and once it serves it sends SIGTERM to the parent, which then
//! drains and exits.

use crate::error::Error;

pub const ENV_GRACEFUL_ADDRS: &str = "EUDORE_GRACEFUL_ADDRS";

#[cfg(unix)]
pub(crate) use unix::{inherited, notify_parent, restart};

#[cfg(unix)]
mod unix {
    use std::io;
    use std::net::TcpListener;
    use std::os::fd::{FromRawFd, RawFd};
    use std::os::unix::process::CommandExt;
    use std::process::Command;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tracing::{info, warn};

    use super::{ENV_GRACEFUL_ADDRS, Error};

    const FIRST_FD: RawFd = 3;

    /// Set once the inherited fds are owned by this process.
    static ADOPTED: AtomicBool = AtomicBool::new(false);

    /// Sockets passed down by the parent, in `EUDORE_GRACEFUL_ADDRS` order.
    /// Only the first call in a process adopts them.
    pub(crate) fn inherited() -> Result<Vec<(String, TcpListener)>, Error> {
        let Ok(addrs) = std::env::var(ENV_GRACEFUL_ADDRS) else {
            return Ok(Vec::new());
        };
        if ADOPTED.swap(true, Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        adopt(&addrs, FIRST_FD)
    }

    /// Takes ownership of the listeners on `first..`, one per address.
    fn adopt(addrs: &str, first: RawFd) -> Result<Vec<(String, TcpListener)>, Error> {
        let mut out = Vec::new();
        for (i, addr) in addrs.split(',').filter(|a| !a.is_empty()).enumerate() {
            let fd = first + i as RawFd;
            // SAFETY: fcntl on an arbitrary fd number only queries its flags.
            if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
                return Err(Error::ServerListen { addr: addr.to_owned(), source: io::Error::last_os_error() });
            }
            // SAFETY: the parent placed a listening socket on this fd and
            // nothing else in the process owns it.
            let listener = unsafe { TcpListener::from_raw_fd(fd) };
            listener.set_nonblocking(true)?;
            out.push((addr.to_owned(), listener));
        }
        Ok(out)
    }

    /// Tells the parent that this process has taken over its listeners.
    pub(crate) fn notify_parent() {
        if !ADOPTED.load(Ordering::SeqCst) {
            return;
        }
        // SAFETY: plain syscalls without memory arguments.
        let (parent, rc) = unsafe {
            let parent = libc::getppid();
            (parent, libc::kill(parent, libc::SIGTERM))
        };
        match rc {
            0 => info!(parent, "restart: took over listeners, parent told to stop"),
            _ => warn!(parent, "restart: signalling parent failed: {}", io::Error::last_os_error()),
        }
    }

    /// Starts the current executable with the same arguments and `listeners`
    /// on fds 3, 4, …. Returns the child's pid.
    pub(crate) fn restart(listeners: &[(String, RawFd)]) -> Result<u32, Error> {
        let exe = std::env::current_exe()?;
        let addrs = listeners.iter().map(|(addr, _)| addr.as_str()).collect::<Vec<_>>().join(",");
        let sources: Vec<RawFd> = listeners.iter().map(|(_, fd)| *fd).collect();
        let mut scratch = sources.clone();

        let mut cmd = Command::new(exe);
        cmd.args(std::env::args_os().skip(1)).env(ENV_GRACEFUL_ADDRS, addrs);
        // SAFETY: the hook runs between fork and exec and only calls
        // async-signal-safe functions on memory allocated before the fork.
        unsafe {
            cmd.pre_exec(move || remap_fds(&sources, &mut scratch, FIRST_FD));
        }
        let child = cmd.spawn()?;
        Ok(child.id())
    }

    /// Moves `sources` onto `first..`. Every source is first duplicated
    /// above the target range so no `dup2` overwrites a source still needed.
    fn remap_fds(sources: &[RawFd], scratch: &mut [RawFd], first: RawFd) -> io::Result<()> {
        let floor = first + sources.len() as RawFd;
        for (fd, high) in sources.iter().zip(scratch.iter_mut()) {
            // SAFETY: fcntl/dup2/close on fds owned by the forked child.
            *high = unsafe { libc::fcntl(*fd, libc::F_DUPFD, floor) };
            if *high < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        for (i, high) in scratch.iter().enumerate() {
            // SAFETY: as above; dup2 clears close-on-exec on the target.
            unsafe {
                if libc::dup2(*high, first + i as RawFd) < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::close(*high);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use std::os::fd::AsRawFd;

        use super::*;

        // Well above anything the test process has open.
        const BASE: RawFd = 700;

        fn local() -> TcpListener {
            TcpListener::bind("127.0.0.1:0").unwrap()
        }

        fn addr_of(fd: RawFd) -> std::net::SocketAddr {
            let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
            assert!(dup >= 0);
            unsafe { TcpListener::from_raw_fd(dup) }.local_addr().unwrap()
        }

        #[test]
        fn remap_places_fds_in_order() {
            let (a, b) = (local(), local());
            let mut scratch = [0; 2];
            remap_fds(&[b.as_raw_fd(), a.as_raw_fd()], &mut scratch, BASE).unwrap();
            assert_eq!(addr_of(BASE), b.local_addr().unwrap());
            assert_eq!(addr_of(BASE + 1), a.local_addr().unwrap());
            unsafe {
                libc::close(BASE);
                libc::close(BASE + 1);
            }
        }

        #[test]
        fn remap_survives_sources_inside_the_target_range() {
            let (a, b) = (local(), local());
            let base = BASE + 10;
            unsafe {
                assert_eq!(libc::dup2(a.as_raw_fd(), base), base);
                assert_eq!(libc::dup2(b.as_raw_fd(), base + 1), base + 1);
            }
            let mut scratch = [0; 2];
            remap_fds(&[base + 1, base], &mut scratch, base).unwrap();
            assert_eq!(addr_of(base), b.local_addr().unwrap());
            assert_eq!(addr_of(base + 1), a.local_addr().unwrap());
            unsafe {
                libc::close(base);
                libc::close(base + 1);
            }
        }

        #[test]
        fn adopt_takes_listeners_at_their_addresses() {
            let l = local();
            let want = l.local_addr().unwrap();
            let base = BASE + 20;
            unsafe {
                assert_eq!(libc::dup2(l.as_raw_fd(), base), base);
            }
            drop(l);
            let got = adopt(&want.to_string(), base).unwrap();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].0, want.to_string());
            assert_eq!(got[0].1.local_addr().unwrap(), want);
            drop(got);

            let err = adopt("127.0.0.1:1", BASE + 30).unwrap_err();
            assert!(matches!(err, Error::ServerListen { .. }), "{err}");
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn inherited() -> Result<Vec<(String, std::net::TcpListener)>, Error> {
    Ok(Vec::new())
}

#[cfg(not(unix))]
pub(crate) fn notify_parent() {}
