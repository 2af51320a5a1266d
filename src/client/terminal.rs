// ABOUTME: Host-side terminal session driver: stdin/socket/SIGWINCH select loop
// ABOUTME: Interactive sessions run the local terminal in raw mode behind an RAII guard

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::select::{FdSet, select};
use nix::sys::signal::Signal;
use nix::unistd;
use tracing::{info, warn};

use crate::queue::{FrameQueue, Receive};
use crate::record::{MAX_PAYLOAD, Record, RecordType};
use crate::signal::SignalPipe;
use crate::term;
use crate::vsock;

use super::{ClientError, ClientResult};

/// Run a terminal session over `socket`.
///
/// With `command` the server runs it one-shot through a PTY; without, an
/// interactive shell is opened and the local terminal switches to raw mode
/// for the duration. Returns when the server announces the session's end
/// or stdin reaches EOF.
pub fn run_terminal_session(socket: OwnedFd, command: Option<&str>) -> ClientResult<()> {
    vsock::set_nonblocking(socket.as_fd())?;
    let sigwinch = SignalPipe::install(&[Signal::SIGWINCH]).map_err(io::Error::from)?;

    let mut queue = FrameQueue::new();
    send_window_size(&mut queue);
    match command {
        Some(cmd) => queue.enqueue(&Record::open_cmd(cmd))?,
        None => queue.enqueue(&Record::open_bash())?,
    }

    let _raw_mode = match command {
        None => Some(term::enter_raw_mode()?),
        Some(_) => None,
    };

    let stdin = io::stdin();
    loop {
        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        read_set.insert(socket.as_fd());
        read_set.insert(stdin.as_fd());
        read_set.insert(sigwinch.as_fd());
        if queue.has_pending() {
            write_set.insert(socket.as_fd());
        }

        match select(None, &mut read_set, &mut write_set, None, None) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(ClientError::Io(err.into())),
        }

        if read_set.contains(socket.as_fd()) {
            match queue.receive(socket.as_fd())? {
                Receive::Closed => {
                    info!("server closed connection");
                    return Ok(());
                }
                Receive::Data(_) | Receive::WouldBlock => {}
            }
            while let Some(record) = queue.next_record()? {
                match record.record_type {
                    RecordType::PtyData => write_all(io::stdout().as_fd(), &record.payload)?,
                    RecordType::ClientEnd => {
                        info!("server closed session");
                        return Ok(());
                    }
                    other => {
                        warn!(record_type = ?other, "unexpected record in terminal session");
                    }
                }
            }
        }

        if read_set.contains(stdin.as_fd()) {
            let mut buf = [0u8; MAX_PAYLOAD];
            match unistd::read(stdin.as_raw_fd(), &mut buf) {
                Ok(0) => {
                    info!("eof on stdin");
                    return Ok(());
                }
                Ok(count) => queue.enqueue(&Record::client_data(&buf[..count]))?,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                Err(err) => return Err(ClientError::Io(err.into())),
            }
        }

        if read_set.contains(sigwinch.as_fd()) && !sigwinch.drain().is_empty() {
            send_window_size(&mut queue);
        }

        queue.flush(socket.as_fd());
    }
}

/// Queue the local terminal dimensions; skipped with a warning when stdin
/// is not a terminal.
fn send_window_size(queue: &mut FrameQueue) {
    match term::window_size(libc::STDIN_FILENO) {
        Ok(size) => {
            if let Err(err) = queue.enqueue(&Record::window_size(size)) {
                warn!(error = %err, "failed to queue window size");
            }
        }
        Err(err) => warn!(error = %err, "failed to query window size"),
    }
}

fn write_all(fd: BorrowedFd<'_>, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match unistd::write(fd, data) {
            Ok(written) => data = &data[written..],
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
