//! A restarted child adopting its parent's listener from fd 3.
//!
//! Kept in its own test binary: it sets the process environment and owns fd 3.
#![cfg(unix)]

use std::net::TcpListener;
use std::os::fd::IntoRawFd;

use eudore::server::ENV_GRACEFUL_ADDRS;
use eudore::{Server, ServerConfig, ServerListenConfig};

const FIRST_FD: i32 = 3;

#[test]
fn listen_adopts_the_inherited_socket() {
    let parent = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = parent.local_addr().unwrap();
    let fd = parent.into_raw_fd();
    if fd != FIRST_FD {
        unsafe {
            assert_eq!(libc::dup2(fd, FIRST_FD), FIRST_FD);
            libc::close(fd);
        }
    }
    // SAFETY: the only test in this binary; nothing else reads the environment.
    unsafe { std::env::set_var(ENV_GRACEFUL_ADDRS, addr.to_string()) };
    assert!(TcpListener::bind(addr).is_err(), "fd 3 holds the port");

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    rt.block_on(async {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        let got = server.listen(&ServerListenConfig::new(addr.to_string())).await.unwrap();
        assert_eq!(got, addr);
        assert_eq!(server.local_addrs(), [addr]);

        // The adopted socket is the server's now: dropping it closes fd 3.
        drop(server);
        assert!(unsafe { libc::fcntl(FIRST_FD, libc::F_GETFD) } < 0);
    });

    // Adoption happens once per process: fd 3 is gone, yet a second server
    // neither fails on it nor picks it up.
    rt.block_on(async {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.listen(&ServerListenConfig::new("127.0.0.1:0")).await.unwrap();
    });
}
