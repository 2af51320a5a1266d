// ABOUTME: Server session engine: registry of per-client sessions and their state machine
// ABOUTME: Single-threaded; all mutation happens inside the select loop's tick

pub mod pty;
pub mod transfer;

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{self, Pid};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::queue::{FrameQueue, QueueError, Receive};
use crate::record::{self, MAX_PAYLOAD, Record, RecordType, WindowSize};
use crate::term;

pub use pty::{PtySession, ShellEnv};

/// Rounds of flush + writability poll spent draining CLIENT_END on destroy.
const DESTROY_DRAIN_ROUNDS: usize = 8;
const DESTROY_DRAIN_WAIT_MS: u16 = 50;

/// Errors that tear down the session they occur on.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Payload(#[from] record::PayloadError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What a session is bound to. Set once by the first record; never
/// transitions afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    Unbound,
    Bash,
    Cmd,
    UploadSink,
    DownloadSource,
}

/// All state for one accepted connection.
pub struct Session {
    socket: OwnedFd,
    peer_cid: u32,
    pub(crate) mode: SessionMode,
    pub(crate) queue: FrameQueue,
    pty: Option<PtySession>,
    pub(crate) file: Option<File>,
    pub(crate) file_path: Option<PathBuf>,
    pub(crate) transfer_begun: bool,
}

impl Session {
    fn new(socket: OwnedFd, peer_cid: u32) -> Self {
        Self {
            socket,
            peer_cid,
            mode: SessionMode::Unbound,
            queue: FrameQueue::new(),
            pty: None,
            file: None,
            file_path: None,
            transfer_begun: false,
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    #[cfg(test)]
    pub(crate) fn pty_master_fd(&self) -> Option<RawFd> {
        self.pty.as_ref().map(|pty| pty.master.as_raw_fd())
    }

    fn receive(&mut self) -> Result<Receive, QueueError> {
        self.queue.receive(self.socket.as_fd())
    }

    fn flush(&mut self) {
        self.queue.flush(self.socket.as_fd());
    }

    /// Best-effort bounded drain of the TX ring, used on destruction so the
    /// closing notification is not silently dropped on a full socket
    /// buffer. Bounded, so a wedged peer cannot stall the server.
    fn drain_tx(&mut self) {
        for _ in 0..DESTROY_DRAIN_ROUNDS {
            self.flush();
            if !self.queue.has_pending() {
                break;
            }
            let mut fds = [PollFd::new(self.socket.as_fd(), PollFlags::POLLOUT)];
            let _ = poll(&mut fds, PollTimeout::from(DESTROY_DRAIN_WAIT_MS));
        }
    }
}

/// Readiness sources one session contributes to the select set.
#[derive(Clone, Copy, Debug)]
pub struct PollSource {
    pub socket_fd: RawFd,
    pub pty_fd: Option<RawFd>,
    /// The socket belongs in the write set: the TX ring has pending bytes.
    pub wants_write: bool,
}

/// The per-client session registry and record dispatcher.
///
/// Runs single-threaded: the owning select loop observes readiness and
/// calls [`Server::service`] per session. The loop iterates over a
/// snapshot of [`Server::poll_sources`], so a handler destroying the
/// current session leaves later lookups returning nothing rather than
/// touching freed state.
pub struct Server {
    sessions: HashMap<RawFd, Session>,
    shell_env: ShellEnv,
}

impl Server {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            shell_env: ShellEnv::from_process_env(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Mode of the session behind `fd`, if it is still registered.
    pub fn session_mode(&self, fd: RawFd) -> Option<SessionMode> {
        self.sessions.get(&fd).map(Session::mode)
    }

    #[cfg(test)]
    pub(crate) fn session(&self, fd: RawFd) -> Option<&Session> {
        self.sessions.get(&fd)
    }

    /// Register an accepted (nonblocking) stream as a new unbound session.
    pub fn adopt(&mut self, socket: OwnedFd, peer_cid: u32) {
        let fd = socket.as_raw_fd();
        info!(socket = fd, cid = peer_cid, "created new session");
        self.sessions.insert(fd, Session::new(socket, peer_cid));
    }

    /// Snapshot of every session's readiness sources for the select set.
    pub fn poll_sources(&self) -> Vec<PollSource> {
        self.sessions
            .values()
            .map(|session| PollSource {
                socket_fd: session.socket.as_raw_fd(),
                pty_fd: session.pty.as_ref().map(|pty| pty.master.as_raw_fd()),
                wants_write: session.queue.has_pending(),
            })
            .collect()
    }

    /// Run one service tick for the session behind `fd`.
    ///
    /// Order per the session engine contract: drain and dispatch inbound
    /// records, pump PTY output, feed the download producer when the TX
    /// ring is below saturation, then flush. Any stage may destroy the
    /// session; later stages notice it is gone and stop.
    pub fn service(&mut self, fd: RawFd, socket_ready: bool, pty_ready: bool) {
        if socket_ready {
            match self.sessions.get_mut(&fd).map(Session::receive) {
                None => return,
                Some(Ok(Receive::Closed)) => {
                    info!(socket = fd, "peer closed connection");
                    self.destroy(fd);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    error!(socket = fd, error = %err, "socket read failed");
                    self.destroy(fd);
                    return;
                }
            }

            loop {
                let record = match self.sessions.get_mut(&fd) {
                    None => return,
                    Some(session) => match session.queue.next_record() {
                        Ok(Some(record)) => record,
                        Ok(None) => break,
                        Err(err) => {
                            error!(socket = fd, error = %err, "framing error");
                            self.destroy(fd);
                            return;
                        }
                    },
                };
                if let Err(err) = self.handle_record(fd, record) {
                    error!(socket = fd, error = %err, "record handling failed");
                    self.destroy(fd);
                    return;
                }
            }
        }

        if pty_ready {
            self.pump_pty(fd);
        }

        if let Some(session) = self.sessions.get_mut(&fd) {
            if session.mode == SessionMode::DownloadSource && !session.queue.is_saturated() {
                if let Err(err) = transfer::pump_download(session) {
                    error!(socket = fd, error = %err, "download failed");
                    self.destroy(fd);
                    return;
                }
            }
        }

        if let Some(session) = self.sessions.get_mut(&fd) {
            session.flush();
        }
    }

    /// Dispatch one inbound record against the session's mode.
    fn handle_record(&mut self, fd: RawFd, record: Record) -> Result<(), SessionError> {
        match record.record_type {
            RecordType::OpenBash => self.handle_open(fd, None),
            RecordType::OpenCmd => {
                let command = record::decode_text(&record.payload)?.to_string();
                self.handle_open(fd, Some(command))
            }
            RecordType::FileDataEndAck => {
                // The client has closed its side of a download; the
                // session is complete.
                if self.sessions.get(&fd).map(Session::mode) != Some(SessionMode::DownloadSource) {
                    return Err(SessionError::Protocol(
                        "FILE_DATA_END_ACK outside download".into(),
                    ));
                }
                info!(socket = fd, "download acknowledged by client");
                self.destroy(fd);
                Ok(())
            }
            _ => {
                let Some(session) = self.sessions.get_mut(&fd) else {
                    return Ok(());
                };
                match record.record_type {
                    RecordType::WindowSize => handle_window_size(session, &record.payload),
                    RecordType::ClientData => handle_client_data(session, &record.payload),
                    RecordType::FileUploadStart => {
                        require_mode(session, SessionMode::Unbound, "FILE_UPLOAD_START")?;
                        transfer::handle_upload_start(session, &record.payload)
                    }
                    RecordType::FileDownloadStart => {
                        require_mode(session, SessionMode::Unbound, "FILE_DOWNLOAD_START")?;
                        transfer::handle_download_start(session, &record.payload)
                    }
                    RecordType::FileData => transfer::handle_file_data(session, &record.payload),
                    RecordType::FileDataBegin => {
                        // Begin marker for an upload stream; nothing to do.
                        require_mode(session, SessionMode::UploadSink, "FILE_DATA_BEGIN")
                    }
                    RecordType::FileDataEnd => transfer::handle_file_data_end(session),
                    other => Err(SessionError::Protocol(format!(
                        "record type {other:?} is not valid client-to-server"
                    ))),
                }
            }
        }
    }

    /// `OPEN_BASH` / `OPEN_CMD`: create the PTY pair, fork the shell, bind
    /// the session mode.
    fn handle_open(&mut self, fd: RawFd, command: Option<String>) -> Result<(), SessionError> {
        {
            let Some(session) = self.sessions.get(&fd) else {
                return Ok(());
            };
            if session.mode != SessionMode::Unbound {
                return Err(SessionError::Protocol(
                    "session already bound, refusing open".into(),
                ));
            }
        }

        let pty = pty::spawn_shell(&self.shell_env, command.as_deref())?;

        let Some(session) = self.sessions.get_mut(&fd) else {
            return Ok(());
        };
        session.pty = Some(pty);
        session.mode = if command.is_some() {
            SessionMode::Cmd
        } else {
            SessionMode::Bash
        };
        Ok(())
    }

    /// Relay up to one 4096-byte chunk of PTY output into the TX ring.
    ///
    /// Skipped while saturated; the PTY stays readable, so the level-
    /// triggered loop retries next tick. EOF or EIO on the master means
    /// the child is gone.
    fn pump_pty(&mut self, fd: RawFd) {
        let close = {
            let Some(session) = self.sessions.get_mut(&fd) else {
                return;
            };
            if session.queue.is_saturated() {
                return;
            }
            let Some(pty) = session.pty.as_ref() else {
                return;
            };

            let mut buf = [0u8; MAX_PAYLOAD];
            match unistd::read(pty.master.as_raw_fd(), &mut buf) {
                Ok(0) => {
                    info!(socket = fd, "pty closed");
                    true
                }
                Ok(count) => {
                    if let Err(err) = session.queue.enqueue(&Record::pty_data(&buf[..count])) {
                        warn!(socket = fd, error = %err, "failed to queue pty data");
                    }
                    false
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => false,
                Err(Errno::EIO) => {
                    // Master reads fail with EIO once the child exits.
                    info!(socket = fd, "pty closed");
                    true
                }
                Err(err) => {
                    error!(socket = fd, error = %err, "pty read failed");
                    true
                }
            }
        };
        if close {
            self.destroy(fd);
        }
    }

    /// Reap exited children and destroy the sessions that owned them.
    ///
    /// Called from the main loop after a SIGCHLD notification; the signal
    /// handler itself never sweeps. Also collects children whose session
    /// was already destroyed, so no zombies linger.
    pub fn reap_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, status)) => {
                    info!(pid = pid.as_raw(), status, "child exited");
                    self.destroy_by_pid(pid);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    info!(pid = pid.as_raw(), signal = %signal, "child killed");
                    self.destroy_by_pid(pid);
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => break,
                Err(err) => {
                    warn!(error = %err, "waitpid failed");
                    break;
                }
            }
        }
    }

    fn destroy_by_pid(&mut self, pid: Pid) {
        let fd = self
            .sessions
            .iter()
            .find(|(_, session)| session.pty.as_ref().map(|pty| pty.child) == Some(pid))
            .map(|(fd, _)| *fd);
        if let Some(fd) = fd {
            self.destroy(fd);
        }
    }

    /// Tear one session down: notify the peer, drain, signal the child,
    /// release every resource, delist.
    ///
    /// Safe to call for an fd that is already gone.
    pub fn destroy(&mut self, fd: RawFd) {
        let Some(mut session) = self.sessions.remove(&fd) else {
            return;
        };
        info!(
            socket = fd,
            cid = session.peer_cid,
            mode = ?session.mode,
            "destroying session"
        );

        if let Err(err) = session.queue.enqueue(&Record::client_end()) {
            warn!(socket = fd, error = %err, "failed to queue CLIENT_END");
        }
        session.drain_tx();

        if let Some(pty) = session.pty.take() {
            let _ = kill(pty.child, Signal::SIGTERM);
            let _ = waitpid(pty.child, Some(WaitPidFlag::WNOHANG));
        }
        // PTY master, file handle and socket close as the session drops.
    }

    /// Destroy every session; used for clean shutdown.
    pub fn destroy_all(&mut self) {
        let fds: Vec<RawFd> = self.sessions.keys().copied().collect();
        for fd in fds {
            self.destroy(fd);
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

fn require_mode(
    session: &Session,
    expected: SessionMode,
    what: &str,
) -> Result<(), SessionError> {
    if session.mode != expected {
        return Err(SessionError::Protocol(format!(
            "{what} in {:?} mode",
            session.mode
        )));
    }
    Ok(())
}

/// `WINDOW_SIZE`: apply the client's terminal dimensions to the PTY master.
fn handle_window_size(session: &mut Session, payload: &[u8]) -> Result<(), SessionError> {
    let pty = match session.mode {
        SessionMode::Bash | SessionMode::Cmd => session
            .pty
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("WINDOW_SIZE without pty".into()))?,
        _ => {
            return Err(SessionError::Protocol(format!(
                "WINDOW_SIZE in {:?} mode",
                session.mode
            )));
        }
    };
    let size = WindowSize::decode(payload)?;
    term::set_window_size(pty.master.as_raw_fd(), size)?;
    Ok(())
}

/// `CLIENT_DATA`: write keystrokes through to the PTY master.
///
/// Partial writes are logged, not retried; dropping terminal input under
/// pressure is acceptable where corrupting a file would not be.
fn handle_client_data(session: &mut Session, payload: &[u8]) -> Result<(), SessionError> {
    let pty = match session.mode {
        SessionMode::Bash | SessionMode::Cmd => session
            .pty
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("CLIENT_DATA without pty".into()))?,
        _ => {
            return Err(SessionError::Protocol(format!(
                "CLIENT_DATA in {:?} mode",
                session.mode
            )));
        }
    };

    match unistd::write(pty.master.as_fd(), payload) {
        Ok(written) if written < payload.len() => {
            warn!(
                written,
                total = payload.len(),
                "partial write to pty"
            );
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(Errno::EAGAIN) => {
            warn!(total = payload.len(), "pty write would block, input dropped");
            Ok(())
        }
        Err(err) => Err(SessionError::Io(err.into())),
    }
}
