// ABOUTME: PTY allocation and shell process spawning for guest sessions
// ABOUTME: Child setup: setsid, controlling tty, stdio redirect, execve of /bin/bash

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::pty::openpty;
use nix::unistd::{self, ForkResult, Pid, fork, setsid};
use tracing::info;

use crate::vsock::set_nonblocking;

const SHELL_PATH: &str = "/bin/bash";

/// Environment exported to every spawned shell.
///
/// `HOME` comes from the server's own environment with a `/root` fallback;
/// the rest is a fixed minimal set.
#[derive(Clone, Debug)]
pub struct ShellEnv {
    envp: Vec<CString>,
}

impl ShellEnv {
    pub fn from_process_env() -> Self {
        let home = std::env::var("HOME")
            .unwrap_or_else(|_| "/root".to_string())
            .replace('\0', "");
        let vars = [
            format!("HOME={home}"),
            "PATH=/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            "TERM=xterm".to_string(),
            "SHELL=/bin/bash".to_string(),
        ];
        let envp = vars
            .into_iter()
            .map(|var| CString::new(var).expect("environment strings contain no NUL"))
            .collect();
        Self { envp }
    }
}

/// A live PTY master and the shell process on its slave side.
#[derive(Debug)]
pub struct PtySession {
    pub master: OwnedFd,
    pub child: Pid,
}

/// Create a PTY pair and spawn `/bin/bash` on the slave end.
///
/// With `command`, the shell runs `bash -c <command>`; without, it is an
/// interactive login-less shell. The child becomes a session leader with
/// the slave as its controlling terminal and its stdio redirected there.
/// The parent keeps the master, set nonblocking.
pub fn spawn_shell(env: &ShellEnv, command: Option<&str>) -> io::Result<PtySession> {
    let pty = openpty(None, None).map_err(io::Error::from)?;

    let shell = CString::new(SHELL_PATH).expect("shell path contains no NUL");
    let argv: Vec<CString> = match command {
        Some(cmd) => vec![
            shell.clone(),
            CString::new("-c").expect("flag contains no NUL"),
            CString::new(cmd).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "command contains NUL byte")
            })?,
        ],
        None => vec![shell.clone()],
    };

    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Child => {
            // Only async-signal-safe calls from here to the exec.
            drop(pty.master);
            let _ = setsid();
            let slave = pty.slave.as_raw_fd();
            unsafe {
                libc::ioctl(slave, libc::TIOCSCTTY, 0);
            }
            let _ = unistd::dup2(slave, 0);
            let _ = unistd::dup2(slave, 1);
            let _ = unistd::dup2(slave, 2);
            drop(pty.slave);
            let _ = unistd::execve(&shell, &argv, &env.envp);
            unsafe { libc::_exit(127) }
        }
        ForkResult::Parent { child } => {
            drop(pty.slave);
            set_nonblocking(pty.master.as_fd())?;
            info!(pid = child.as_raw(), pty = pty.master.as_raw_fd(), "spawned shell");
            Ok(PtySession {
                master: pty.master,
                child,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use std::io::Read;
    use std::time::{Duration, Instant};

    #[test]
    fn one_shot_command_writes_to_the_master() {
        let env = ShellEnv::from_process_env();
        let pty = spawn_shell(&env, Some("printf vsock-pty-test")).unwrap();

        let mut file = std::fs::File::from(pty.master.try_clone().unwrap());
        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut buf = [0u8; 4096];
        while Instant::now() < deadline {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if collected
                        .windows(b"vsock-pty-test".len())
                        .any(|w| w == b"vsock-pty-test")
                    {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                // EIO when the child side closes.
                Err(_) => break,
            }
        }

        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("vsock-pty-test"), "got: {text:?}");

        // Collect the child so the test leaves no zombie behind.
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match waitpid(pty.child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => std::thread::sleep(Duration::from_millis(10)),
                _ => break,
            }
        }
    }
}
